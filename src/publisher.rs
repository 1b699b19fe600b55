//! Kafka publisher for outbound change messages.
//!
//! [`KafkaPublisher`] wraps an rdkafka producer. Batching lives in the
//! client: messages buffer until the size, count, or linger threshold from
//! [`KafkaConfig`](crate::config::KafkaConfig) is hit, then flush as a
//! batch (latency traded for throughput). The producer is safe for
//! concurrent `write` calls from many publish tasks; its buffer is
//! internally synchronized.
//!
//! The [`Publisher`] trait is the seam the dispatch loop publishes through,
//! so tests can substitute an in-memory sink.

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::KafkaConfig;
use crate::event::OutboundMessage;

/// Errors delivering a message to the bus.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Producer construction failed.
    #[error("kafka producer: {0}")]
    Client(#[source] KafkaError),

    /// The broker rejected the message or the delivery timed out.
    #[error("kafka delivery: {0}")]
    Delivery(#[source] KafkaError),

    /// Flushing buffered messages at close failed.
    #[error("kafka flush: {0}")]
    Flush(#[source] KafkaError),

    /// Shutdown was triggered while waiting for delivery. Expected during
    /// teardown; callers log a warning rather than a fault.
    #[error("publish cancelled, shutdown in progress")]
    Cancelled,
}

/// Delivers outbound messages to the bus.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Enqueue a message for batched delivery.
    ///
    /// Returns once the client has accepted and reported the message (or
    /// definitively failed). Must map `cancel` firing mid-wait to
    /// [`PublishError::Cancelled`].
    async fn write(
        &self,
        message: OutboundMessage,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError>;

    /// Flush buffered messages and release the client. Called exactly once
    /// at shutdown.
    async fn close(&self) -> Result<(), PublishError>;
}

/// Bus publisher backed by an rdkafka [`FutureProducer`].
pub struct KafkaPublisher {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl KafkaPublisher {
    /// Build a producer from the Kafka configuration.
    pub fn new(config: &KafkaConfig) -> Result<Self, PublishError> {
        let producer = config
            .client_config()
            .create()
            .map_err(PublishError::Client)?;

        Ok(Self {
            producer,
            delivery_timeout: config.delivery_timeout(),
        })
    }
}

fn build_headers(pairs: &[(String, String)]) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new();
    for (key, value) in pairs {
        headers = headers.insert(Header {
            key: key.as_str(),
            value: Some(value.as_bytes()),
        });
    }
    headers
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn write(
        &self,
        message: OutboundMessage,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        let record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&message.value)
            .headers(build_headers(&message.headers));

        tokio::select! {
            _ = cancel.cancelled() => Err(PublishError::Cancelled),
            delivery = self.producer.send(record, self.delivery_timeout) => match delivery {
                Ok((partition, offset)) => {
                    debug!(
                        topic = %message.topic,
                        partition,
                        offset,
                        "message delivered"
                    );
                    Ok(())
                }
                Err((error, _)) => Err(PublishError::Delivery(error)),
            },
        }
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.producer
            .flush(self.delivery_timeout)
            .map_err(PublishError::Flush)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::Headers;

    #[test]
    fn test_build_headers_keeps_order_and_values() {
        let pairs = vec![
            ("traceparent".to_string(), "00-abc-def-01".to_string()),
            ("tracestate".to_string(), "vendor=1".to_string()),
        ];

        let headers = build_headers(&pairs);
        assert_eq!(headers.count(), 2);

        let first = headers.get(0);
        assert_eq!(first.key, "traceparent");
        assert_eq!(first.value, Some("00-abc-def-01".as_bytes()));

        let second = headers.get(1);
        assert_eq!(second.key, "tracestate");
        assert_eq!(second.value, Some("vendor=1".as_bytes()));
    }

    #[test]
    fn test_build_headers_empty() {
        let headers = build_headers(&[]);
        assert_eq!(headers.count(), 0);
    }
}
