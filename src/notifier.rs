//! The dispatch loop, the brain of the notifier.
//!
//! [`Notifier`] consumes change events from a [`ChangeSource`], admits each
//! one through the [`RateLimiter`], and hands it to a concurrent publish
//! task so the loop is immediately free to receive the next notification.
//!
//! # Event lifecycle
//!
//! ```text
//! Listening ──► notification
//!                   │
//!            (keep-alive? skip)
//!                   ▼
//!            spawn publish task:  Admitting ──► Publishing ──► Done
//!                                 (permit)      (write+trace)  (permit
//!                                                               released)
//! ```
//!
//! Admission happens in arrival order; completion order is unconstrained,
//! since admitted publishes run concurrently and the broker may reorder.
//!
//! # Failure semantics
//!
//! No event is redelivered. A failed admission or publish drops that one
//! event with a log line; only an unexpected shutdown cause is fatal to the
//! loop. On exit, in-flight tasks are drained up to a configurable timeout
//! and the publisher is closed exactly once.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{KafkaConfig, NotifierConfig};
use crate::event::{ChangeEvent, OutboundMessage};
use crate::limiter::{AcquireError, RateLimiter};
use crate::listener::{ChangeSource, ListenError};
use crate::publisher::{PublishError, Publisher};
use crate::shutdown::{Shutdown, ShutdownReason};
use crate::telemetry;

/// Errors fatal to the dispatch loop.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// LISTEN on the notification channel failed at startup.
    #[error("listen on channel '{channel}' failed: {source}")]
    Listen {
        channel: String,
        #[source]
        source: ListenError,
    },

    /// The notification stream returned an error.
    #[error("notification stream failed: {0}")]
    Stream(#[from] ListenError),

    /// The run context was cancelled for a reason other than the expected
    /// shutdown signal.
    #[error("dispatch aborted: {0}")]
    Aborted(String),
}

/// Where outbound messages go and how they are keyed.
#[derive(Debug, Clone)]
struct MessageRoute {
    topic: String,
    key: Vec<u8>,
    key_field: Option<String>,
}

impl MessageRoute {
    fn from_config(config: &KafkaConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            key: config.message_key.clone().into_bytes(),
            key_field: config.key_field.clone(),
        }
    }

    /// Build the outbound message for a change event.
    ///
    /// The value is the payload verbatim. The key is extracted from the
    /// configured payload field when possible, otherwise the constant key.
    fn message_for(&self, event: &ChangeEvent) -> OutboundMessage {
        let key = self
            .key_field
            .as_deref()
            .and_then(|field| extract_key(&event.payload, field))
            .unwrap_or_else(|| self.key.clone());

        OutboundMessage::new(self.topic.clone(), key, event.payload.clone().into_bytes())
    }
}

/// Pull a keyable field out of a JSON payload.
fn extract_key(payload: &str, field: &str) -> Option<Vec<u8>> {
    let value: Value = serde_json::from_str(payload).ok()?;
    match value.get(field)? {
        Value::String(s) => Some(s.clone().into_bytes()),
        Value::Number(n) => Some(n.to_string().into_bytes()),
        _ => None,
    }
}

enum WakeReason {
    Shutdown,
    Received(Result<Option<ChangeEvent>, ListenError>),
    TaskDone,
}

/// The coordinator: one long-lived loop plus one short-lived task per
/// admitted change event.
pub struct Notifier<S> {
    source: S,
    publisher: Arc<dyn Publisher>,
    limiter: RateLimiter,
    route: MessageRoute,
    channel: String,
    drain_timeout: Duration,
    shutdown: Shutdown,
    tasks: JoinSet<()>,
}

impl<S: ChangeSource> Notifier<S> {
    /// Wire up a notifier from configuration.
    pub fn new(
        source: S,
        publisher: Arc<dyn Publisher>,
        config: &NotifierConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            source,
            publisher,
            limiter: RateLimiter::new(config.notifier.rate_limit),
            route: MessageRoute::from_config(&config.kafka),
            channel: config.notifier.channel.clone(),
            drain_timeout: config.notifier.drain_timeout(),
            shutdown,
            tasks: JoinSet::new(),
        }
    }

    /// The permit pool, for observation (tests, metrics).
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run the dispatch loop until shutdown.
    ///
    /// Returns `Ok(())` on the expected shutdown path; an error when the
    /// loop was cancelled for any other cause or the stream failed. Either
    /// way, in-flight publishes are drained and the publisher closed once.
    pub async fn run(&mut self) -> Result<(), NotifyError> {
        self.source
            .listen(&self.channel)
            .await
            .map_err(|source| NotifyError::Listen {
                channel: self.channel.clone(),
                source,
            })?;

        info!(channel = %self.channel, "listening for change notifications");

        let result = self.dispatch().await;

        self.drain().await;

        if let Err(error) = self.publisher.close().await {
            error!(error = %error, "publisher close failed");
        }

        result
    }

    async fn dispatch(&mut self) -> Result<(), NotifyError> {
        loop {
            let wake = tokio::select! {
                _ = self.shutdown.cancelled() => WakeReason::Shutdown,
                received = self.source.recv() => WakeReason::Received(received),
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => WakeReason::TaskDone,
            };

            match wake {
                WakeReason::Shutdown => match self.shutdown.reason() {
                    ShutdownReason::Signal => {
                        debug!("shutdown signal received, stopping dispatch");
                        return Ok(());
                    }
                    ShutdownReason::Fault(cause) => {
                        error!(cause = %cause, "dispatch cancelled unexpectedly");
                        return Err(NotifyError::Aborted(cause));
                    }
                },
                // Keep-alive with no payload; nothing to publish.
                WakeReason::Received(Ok(None)) => continue,
                WakeReason::Received(Ok(Some(event))) => self.spawn_publish(event),
                WakeReason::Received(Err(source)) => return Err(NotifyError::Stream(source)),
                WakeReason::TaskDone => {}
            }
        }
    }

    /// Launch the per-event task: acquire a permit, publish, log the
    /// outcome. The permit is held for the whole attempt and released on
    /// every exit path by drop.
    fn spawn_publish(&mut self, event: ChangeEvent) {
        let message = self.route.message_for(&event);
        let publisher = Arc::clone(&self.publisher);
        let limiter = self.limiter.clone();
        let cancel = self.shutdown.token().clone();
        let span = info_span!("publish_change", topic = %message.topic);
        let payload = event.payload;

        self.tasks.spawn(
            async move {
                let _permit = match limiter.acquire(&cancel).await {
                    Ok(permit) => permit,
                    Err(AcquireError::Cancelled) => {
                        warn!("admission cancelled, dropping change event");
                        return;
                    }
                };

                let mut message = message;
                telemetry::inject_trace_context(&mut message.headers);

                match publisher.write(message, &cancel).await {
                    Ok(()) => info!(payload = %payload, "change event published"),
                    Err(PublishError::Cancelled) => {
                        warn!("publish cancelled, dropping change event");
                    }
                    Err(error) => {
                        error!(error = %error, "publish failed, dropping change event");
                    }
                }
            }
            .instrument(span),
        );
    }

    /// Let in-flight publishes settle, bounded by the drain timeout; abort
    /// whatever remains.
    async fn drain(&mut self) {
        if self.tasks.is_empty() {
            return;
        }

        let timeout = self.drain_timeout;
        if !timeout.is_zero() {
            debug!(pending = self.tasks.len(), "draining in-flight publishes");
            let drained = tokio::time::timeout(timeout, async {
                while self.tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_ok() {
                return;
            }
        }

        warn!(pending = self.tasks.len(), "abandoning in-flight publishes");
        self.tasks.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Source fed from a channel; hangs forever once the sender is gone.
    struct ChannelSource {
        rx: mpsc::UnboundedReceiver<Option<ChangeEvent>>,
        listened: Arc<Mutex<Option<String>>>,
    }

    fn channel_source() -> (
        mpsc::UnboundedSender<Option<ChangeEvent>>,
        Arc<Mutex<Option<String>>>,
        ChannelSource,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listened = Arc::new(Mutex::new(None));
        let source = ChannelSource {
            rx,
            listened: Arc::clone(&listened),
        };
        (tx, listened, source)
    }

    #[async_trait]
    impl ChangeSource for ChannelSource {
        async fn listen(&mut self, channel: &str) -> Result<(), ListenError> {
            *self.listened.lock().unwrap() = Some(channel.to_string());
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<ChangeEvent>, ListenError> {
            match self.rx.recv().await {
                Some(item) => Ok(item),
                None => std::future::pending().await,
            }
        }
    }

    /// Source whose LISTEN fails.
    struct BrokenSource;

    #[async_trait]
    impl ChangeSource for BrokenSource {
        async fn listen(&mut self, _channel: &str) -> Result<(), ListenError> {
            Err(ListenError::Channel {
                channel: "user_changes".to_string(),
                source: sqlx::Error::PoolClosed,
            })
        }

        async fn recv(&mut self) -> Result<Option<ChangeEvent>, ListenError> {
            std::future::pending().await
        }
    }

    /// Sink recording writes, tracking concurrency and close calls.
    struct RecordingSink {
        messages: Mutex<Vec<OutboundMessage>>,
        write_calls: AtomicUsize,
        close_calls: AtomicUsize,
        delay: Duration,
        honor_cancel: bool,
        fail_next: AtomicBool,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(delay: Duration) -> Self {
            Self {
                messages: Mutex::new(Vec::new()),
                write_calls: AtomicUsize::new(0),
                close_calls: AtomicUsize::new(0),
                delay,
                honor_cancel: false,
                fail_next: AtomicBool::new(false),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn messages(&self) -> Vec<OutboundMessage> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Publisher for RecordingSink {
        async fn write(
            &self,
            message: OutboundMessage,
            cancel: &CancellationToken,
        ) -> Result<(), PublishError> {
            self.write_calls.fetch_add(1, Ordering::SeqCst);

            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            if !self.delay.is_zero() {
                if self.honor_cancel {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.current.fetch_sub(1, Ordering::SeqCst);
                            return Err(PublishError::Cancelled);
                        }
                        _ = tokio::time::sleep(self.delay) => {}
                    }
                } else {
                    tokio::time::sleep(self.delay).await;
                }
            }

            self.current.fetch_sub(1, Ordering::SeqCst);

            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(PublishError::Delivery(
                    rdkafka::error::KafkaError::MessageProduction(
                        rdkafka::types::RDKafkaErrorCode::MessageTimedOut,
                    ),
                ));
            }

            self.messages.lock().unwrap().push(message);
            Ok(())
        }

        async fn close(&self) -> Result<(), PublishError> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_config(rate_limit: usize, drain_timeout_secs: u64) -> NotifierConfig {
        let mut config = NotifierConfig::default();
        config.notifier.rate_limit = rate_limit;
        config.notifier.drain_timeout_secs = drain_timeout_secs;
        config
    }

    async fn wait_until(what: &str, check: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_forwards_payloads_verbatim() {
        let (tx, listened, source) = channel_source();
        let sink = Arc::new(RecordingSink::new());
        let shutdown = Shutdown::new();
        let mut notifier = Notifier::new(
            source,
            Arc::clone(&sink) as Arc<dyn Publisher>,
            &test_config(500, 5),
            shutdown.clone(),
        );

        for payload in ["e1", "e2", "e3"] {
            tx.send(Some(ChangeEvent::new(payload))).unwrap();
        }

        let handle = tokio::spawn(async move {
            let result = notifier.run().await;
            (result, notifier)
        });

        wait_until("3 messages", || sink.messages().len() == 3).await;
        shutdown.trigger(ShutdownReason::Signal);

        let (result, _notifier) = handle.await.unwrap();
        assert!(result.is_ok());

        assert_eq!(
            listened.lock().unwrap().as_deref(),
            Some("user_changes"),
            "listen must use the configured channel"
        );

        let messages = sink.messages();
        let mut values: Vec<String> = messages
            .iter()
            .map(|m| String::from_utf8(m.value.clone()).unwrap())
            .collect();
        values.sort();
        assert_eq!(values, vec!["e1", "e2", "e3"]);
        for message in &messages {
            assert_eq!(message.topic, "postgres.public.users");
            assert_eq!(message.key, b"user-event");
        }

        assert_eq!(sink.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keep_alive_is_a_no_op() {
        let (tx, _listened, source) = channel_source();
        let sink = Arc::new(RecordingSink::new());
        let shutdown = Shutdown::new();
        let mut notifier = Notifier::new(
            source,
            Arc::clone(&sink) as Arc<dyn Publisher>,
            &test_config(500, 5),
            shutdown.clone(),
        );

        // Keep-alives interleaved with one real event
        tx.send(None).unwrap();
        tx.send(None).unwrap();
        tx.send(Some(ChangeEvent::new("e1"))).unwrap();
        tx.send(None).unwrap();

        let handle = tokio::spawn(async move {
            let result = notifier.run().await;
            (result, notifier)
        });

        wait_until("1 message", || sink.messages().len() == 1).await;
        shutdown.trigger(ShutdownReason::Signal);

        let (result, notifier) = handle.await.unwrap();
        assert!(result.is_ok());

        // Keep-alives produced no writes and consumed no permits
        assert_eq!(sink.write_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            notifier.limiter().available(),
            notifier.limiter().capacity()
        );
    }

    #[tokio::test]
    async fn test_concurrent_publishes_bounded_by_rate_limit() {
        let (tx, _listened, source) = channel_source();
        let sink = Arc::new(RecordingSink::with_delay(Duration::from_millis(50)));
        let shutdown = Shutdown::new();
        let mut notifier = Notifier::new(
            source,
            Arc::clone(&sink) as Arc<dyn Publisher>,
            &test_config(2, 5),
            shutdown.clone(),
        );

        for i in 0..5 {
            tx.send(Some(ChangeEvent::new(format!("e{i}")))).unwrap();
        }

        let handle = tokio::spawn(async move { notifier.run().await });

        wait_until("5 messages", || sink.messages().len() == 5).await;
        shutdown.trigger(ShutdownReason::Signal);
        handle.await.unwrap().unwrap();

        assert!(
            sink.peak.load(Ordering::SeqCst) <= 2,
            "at most rate_limit publishes may run concurrently"
        );
    }

    #[tokio::test]
    async fn test_shutdown_before_traffic_returns_promptly() {
        let (_tx, _listened, source) = channel_source();
        let sink = Arc::new(RecordingSink::new());
        let shutdown = Shutdown::new();
        let mut notifier = Notifier::new(
            source,
            Arc::clone(&sink) as Arc<dyn Publisher>,
            &test_config(500, 5),
            shutdown.clone(),
        );

        let handle = tokio::spawn(async move { notifier.run().await });

        shutdown.trigger(ShutdownReason::Signal);

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run must return promptly after shutdown");
        assert!(result.unwrap().is_ok());
        assert_eq!(sink.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unexpected_cancellation_is_fatal() {
        let (_tx, _listened, source) = channel_source();
        let sink = Arc::new(RecordingSink::new());
        let shutdown = Shutdown::new();
        let mut notifier = Notifier::new(
            source,
            Arc::clone(&sink) as Arc<dyn Publisher>,
            &test_config(500, 5),
            shutdown.clone(),
        );

        let handle = tokio::spawn(async move { notifier.run().await });

        shutdown.trigger(ShutdownReason::Fault("storage watchdog tripped".to_string()));

        let result = handle.await.unwrap();
        match result {
            Err(NotifyError::Aborted(cause)) => {
                assert_eq!(cause, "storage watchdog tripped");
            }
            other => panic!("expected Aborted, got {other:?}"),
        }
        // Even the failure path closes the publisher exactly once
        assert_eq!(sink.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_permit_leak_on_cancellation() {
        let (tx, _listened, source) = channel_source();
        // Writes hang far longer than the drain timeout and ignore
        // cancellation, forcing the abandon path.
        let sink = Arc::new(RecordingSink::with_delay(Duration::from_secs(30)));
        let shutdown = Shutdown::new();
        let mut notifier = Notifier::new(
            source,
            Arc::clone(&sink) as Arc<dyn Publisher>,
            &test_config(1, 0),
            shutdown.clone(),
        );

        // One event publishing, two stuck in admission
        for i in 0..3 {
            tx.send(Some(ChangeEvent::new(format!("e{i}")))).unwrap();
        }

        let handle = tokio::spawn(async move {
            let result = notifier.run().await;
            (result, notifier)
        });

        wait_until("first write", || sink.write_calls.load(Ordering::SeqCst) == 1).await;
        shutdown.trigger(ShutdownReason::Signal);

        let (result, notifier) = handle.await.unwrap();
        assert!(result.is_ok());

        // Every acquired permit was released: admission-cancelled tasks held
        // nothing, the aborted publish released on drop.
        assert_eq!(notifier.limiter().available(), 1);
        assert_eq!(sink.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_publish_is_dropped_not_fatal() {
        let (tx, _listened, source) = channel_source();
        let sink = Arc::new(RecordingSink::new());
        sink.fail_next.store(true, Ordering::SeqCst);
        let shutdown = Shutdown::new();
        let mut notifier = Notifier::new(
            source,
            Arc::clone(&sink) as Arc<dyn Publisher>,
            &test_config(500, 5),
            shutdown.clone(),
        );

        tx.send(Some(ChangeEvent::new("lost"))).unwrap();
        tx.send(Some(ChangeEvent::new("kept"))).unwrap();

        let handle = tokio::spawn(async move { notifier.run().await });

        wait_until("2 write attempts", || {
            sink.write_calls.load(Ordering::SeqCst) == 2
        })
        .await;
        wait_until("surviving message", || sink.messages().len() == 1).await;
        shutdown.trigger(ShutdownReason::Signal);

        assert!(handle.await.unwrap().is_ok());

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].value, b"kept");
    }

    #[tokio::test]
    async fn test_listen_failure_is_fatal_at_startup() {
        let sink = Arc::new(RecordingSink::new());
        let shutdown = Shutdown::new();
        let mut notifier = Notifier::new(
            BrokenSource,
            Arc::clone(&sink) as Arc<dyn Publisher>,
            &test_config(500, 5),
            shutdown,
        );

        let result = notifier.run().await;
        assert!(matches!(result, Err(NotifyError::Listen { .. })));
        // Startup failure never reached the publisher
        assert_eq!(sink.close_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_message_route_constant_key() {
        let route = MessageRoute::from_config(&KafkaConfig::default());
        let message = route.message_for(&ChangeEvent::new(r#"{"id":42}"#));

        assert_eq!(message.topic, "postgres.public.users");
        assert_eq!(message.key, b"user-event");
        assert_eq!(message.value, br#"{"id":42}"#);
    }

    #[test]
    fn test_message_route_key_field() {
        let config = KafkaConfig {
            key_field: Some("id".to_string()),
            ..KafkaConfig::default()
        };
        let route = MessageRoute::from_config(&config);

        let keyed = route.message_for(&ChangeEvent::new(r#"{"id":42,"email":"a@b"}"#));
        assert_eq!(keyed.key, b"42");

        let string_keyed = route.message_for(&ChangeEvent::new(r#"{"id":"u-7"}"#));
        assert_eq!(string_keyed.key, b"u-7");

        // Field missing or payload not JSON: fall back to the constant key
        let missing = route.message_for(&ChangeEvent::new(r#"{"email":"a@b"}"#));
        assert_eq!(missing.key, b"user-event");

        let opaque = route.message_for(&ChangeEvent::new("not json"));
        assert_eq!(opaque.key, b"user-event");
    }

    #[test]
    fn test_message_value_is_verbatim() {
        let route = MessageRoute::from_config(&KafkaConfig::default());
        let payload = "  raw \u{00e9}vent bytes, not JSON  ";
        let message = route.message_for(&ChangeEvent::new(payload));
        assert_eq!(message.value, payload.as_bytes());
    }
}
