//! Graceful shutdown coordination for the notifier.
//!
//! This module provides a [`Shutdown`] handle that coordinates graceful
//! termination across the dispatch loop and its publish tasks when a
//! termination signal is received and, unlike a bare cancellation token,
//! records *why* the run was cancelled. The dispatch loop uses the recorded
//! [`ShutdownReason`] to decide whether cancellation was the expected
//! shutdown path (return cleanly) or a fault (return an error).
//!
//! # Example
//!
//! ```rust,ignore
//! use userv_notifier::shutdown::{Shutdown, ShutdownReason};
//!
//! #[tokio::main]
//! async fn main() {
//!     let shutdown = Shutdown::new();
//!
//!     // Clone for the signal waiter
//!     let signal = shutdown.clone();
//!     tokio::spawn(async move { signal.wait_for_signal().await });
//!
//!     tokio::select! {
//!         _ = shutdown.cancelled() => match shutdown.reason() {
//!             ShutdownReason::Signal => { /* clean exit */ }
//!             ShutdownReason::Fault(cause) => { /* propagate error */ }
//!         },
//!         // ... process events
//!     }
//! }
//! ```

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Why the run context was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The expected path: a termination signal or programmatic stop.
    Signal,
    /// Anything else; the cause is propagated as a run-loop error.
    Fault(String),
}

/// A cloneable handle coordinating graceful shutdown.
///
/// All clones share the same cancellation state. The first `trigger` wins:
/// later causes are ignored so the reason observed after `cancelled()`
/// resolves is stable.
#[derive(Clone)]
pub struct Shutdown {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl Shutdown {
    /// Create a new, untriggered shutdown handle.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Trigger shutdown with the given cause.
    ///
    /// Idempotent; only the first recorded cause is kept.
    pub fn trigger(&self, reason: ShutdownReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Non-blocking check whether shutdown has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The recorded cause.
    ///
    /// Defaults to [`ShutdownReason::Signal`] if the token was cancelled
    /// without a recorded cause.
    pub fn reason(&self) -> ShutdownReason {
        self.reason.get().cloned().unwrap_or(ShutdownReason::Signal)
    }

    /// The underlying cancellation token, for cancellation-aware waits in
    /// publish tasks.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Wait for a termination signal (SIGTERM or Ctrl+C), then trigger
    /// shutdown with the expected [`ShutdownReason::Signal`] cause.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("received Ctrl+C, initiating graceful shutdown");
            }
            _ = terminate => {
                info!("received SIGTERM, initiating graceful shutdown");
            }
        }

        self.trigger(ShutdownReason::Signal);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
