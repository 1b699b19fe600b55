//! Counting-permit rate limiter bounding concurrent publishes.
//!
//! The pool size is fixed at construction; a permit must be held for the
//! whole publish attempt and is returned when the [`RateLimitPermit`] is
//! dropped, so release happens exactly once on every exit path.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Errors from permit acquisition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcquireError {
    /// Shutdown was triggered while waiting for a permit. Not a fault;
    /// callers log it as an expected part of teardown.
    #[error("acquire cancelled, shutdown in progress")]
    Cancelled,
}

/// Caps the number of concurrently in-flight publish operations.
///
/// Cloning is cheap; all clones draw from the same permit pool.
#[derive(Clone)]
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl RateLimiter {
    /// Create a limiter with a fixed number of permits.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a permit, or bail out when `cancel` fires first.
    ///
    /// The returned permit is released when dropped.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<RateLimitPermit, AcquireError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(AcquireError::Cancelled),
            acquired = Arc::clone(&self.semaphore).acquire_owned() => match acquired {
                Ok(permit) => Ok(RateLimitPermit { _permit: permit }),
                // The pool is never closed; a closed semaphore reads as
                // cancellation.
                Err(_) => Err(AcquireError::Cancelled),
            },
        }
    }

    /// The configured pool size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// A held unit of publish capacity; returned to the pool on drop.
#[derive(Debug)]
pub struct RateLimitPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let limiter = RateLimiter::new(2);
        let cancel = CancellationToken::new();

        assert_eq!(limiter.available(), 2);

        let first = limiter.acquire(&cancel).await.unwrap();
        let second = limiter.acquire(&cancel).await.unwrap();
        assert_eq!(limiter.available(), 0);

        drop(first);
        assert_eq!(limiter.available(), 1);
        drop(second);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn test_acquire_blocks_at_capacity() {
        let limiter = RateLimiter::new(1);
        let cancel = CancellationToken::new();

        let held = limiter.acquire(&cancel).await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire(&cancel)).await;
        assert!(blocked.is_err(), "second acquire should block");

        drop(held);
        let unblocked =
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire(&cancel)).await;
        assert!(unblocked.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_acquire_holds_nothing() {
        let limiter = RateLimiter::new(1);
        let cancel = CancellationToken::new();

        let _held = limiter.acquire(&cancel).await.unwrap();
        cancel.cancel();

        let result = limiter.acquire(&cancel).await;
        assert_eq!(result.unwrap_err(), AcquireError::Cancelled);
        // Cancelled waiters must not consume capacity
        assert_eq!(limiter.available(), 0);
        drop(_held);
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_tasks_never_exceed_capacity() {
        const CAPACITY: usize = 3;
        const TASKS: usize = 20;

        let limiter = RateLimiter::new(CAPACITY);
        let cancel = CancellationToken::new();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..TASKS {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);

            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire(&cancel).await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        // All permits returned once every task is done
        assert_eq!(limiter.available(), CAPACITY);
    }
}
