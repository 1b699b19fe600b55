//! Reconnecting subscription to the storage notification channel.
//!
//! The storage engine's LISTEN/NOTIFY mechanism delivers at-least-once,
//! in-order notifications on a single logical channel. [`ChangeListener`]
//! wraps that mechanism behind a handle that reconnects transparently, so
//! the dispatch loop never sees transient connectivity loss; the receive
//! stream simply resumes.
//!
//! # Reconnection
//!
//! ```text
//! recv() ──► next notification          -> Some(ChangeEvent)
//!        ──► connection re-established  -> None  (keep-alive, caller ignores)
//!        ──► reconnect attempt failed   -> backoff sleep, retry internally
//! ```
//!
//! A lost connection surfaces to the caller only as a `None` gap marker;
//! notifications sent while disconnected are gone: the channel itself is
//! at-least-once only while connected, and the pipeline makes no replay
//! promises.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPoolOptions};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::event::ChangeEvent;

/// Errors establishing or using the subscription.
#[derive(Debug, Error)]
pub enum ListenError {
    /// The initial connection attempt failed (network, auth, TLS).
    #[error("storage listener connect: {0}")]
    Connect(#[from] sqlx::Error),

    /// The connection was established but did not reach a usable state.
    #[error("storage listener not connected: {0}")]
    NotConnected(#[source] sqlx::Error),

    /// LISTEN on the named channel failed.
    #[error("listen on channel '{channel}': {source}")]
    Channel {
        channel: String,
        #[source]
        source: sqlx::Error,
    },
}

/// A sequential source of change events.
///
/// Abstracts [`ChangeListener`] so the dispatch loop can be driven by an
/// in-memory source in tests. `recv` returning `Ok(None)` is a keep-alive
/// no-op the caller must skip.
#[async_trait]
pub trait ChangeSource: Send {
    /// Begin receiving notifications on the named channel.
    async fn listen(&mut self, channel: &str) -> Result<(), ListenError>;

    /// The next change event, or `None` for a keep-alive gap marker.
    async fn recv(&mut self) -> Result<Option<ChangeEvent>, ListenError>;
}

/// Doubling backoff bounded to `[min, max]`.
#[derive(Debug)]
struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, next: min }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.min;
    }
}

/// The live, auto-reconnecting handle to the notification channel.
///
/// Exactly one instance is active per running dispatch loop; reconnection
/// reuses the same underlying pool and never creates a second subscription.
pub struct ChangeListener {
    inner: PgListener,
    backoff: Backoff,
    channel: Option<String>,
}

impl ChangeListener {
    /// Connect to storage and verify the connection is usable.
    ///
    /// Blocks until the first connection attempt resolves; a notifier that
    /// cannot establish its subscription must fail at startup rather than
    /// limp along.
    pub async fn connect(config: &StorageConfig, min_reconnect: Duration, max_reconnect: Duration) -> Result<Self, ListenError> {
        let options = config.connect_options()?;

        debug!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            ssl_mode = %config.ssl_mode,
            "connecting storage listener"
        );

        // One connection for the listener, one for the liveness check.
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(config.connect_timeout())
            .connect_with(options)
            .await?;

        let inner = PgListener::connect_with(&pool).await?;

        // A fresh handle can still point at a server that refuses work.
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(ListenError::NotConnected)?;

        info!("notifier connected to database");

        Ok(Self {
            inner,
            backoff: Backoff::new(min_reconnect, max_reconnect),
            channel: None,
        })
    }

    /// Begin receiving notifications on `channel`. Call once after connect.
    pub async fn listen(&mut self, channel: &str) -> Result<(), ListenError> {
        self.inner
            .listen(channel)
            .await
            .map_err(|source| ListenError::Channel {
                channel: channel.to_string(),
                source,
            })?;

        self.channel = Some(channel.to_string());
        Ok(())
    }

    /// The next change event.
    ///
    /// `Ok(None)` marks a re-established connection (the subscription is
    /// re-issued automatically); callers treat it as a keep-alive and poll
    /// again. Failed reconnect attempts are retried internally with bounded
    /// backoff and never surface as errors.
    pub async fn recv(&mut self) -> Result<Option<ChangeEvent>, ListenError> {
        loop {
            match self.inner.try_recv().await {
                Ok(Some(notification)) => {
                    self.backoff.reset();
                    return Ok(Some(ChangeEvent::new(notification.payload())));
                }
                Ok(None) => {
                    self.backoff.reset();
                    warn!(
                        channel = self.channel.as_deref().unwrap_or_default(),
                        "listener connection lost, resubscribed; notifications in the gap are dropped"
                    );
                    return Ok(None);
                }
                Err(error) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        error = %error,
                        retry_in_secs = delay.as_secs(),
                        "listener reconnect failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl ChangeSource for ChangeListener {
    async fn listen(&mut self, channel: &str) -> Result<(), ListenError> {
        ChangeListener::listen(self, channel).await
    }

    async fn recv(&mut self) -> Result<Option<ChangeEvent>, ListenError> {
        ChangeListener::recv(self).await
    }
}
