//! Core event types for the notifier.
//!
//! A [`ChangeEvent`] is the raw notification emitted by the storage trigger;
//! its payload is an opaque string (typically JSON describing the row
//! mutation) and is forwarded to the bus byte-for-byte, never parsed or
//! rewritten by the pipeline. An [`OutboundMessage`] is the transient unit
//! handed to the bus client, one per change event.

/// A committed row mutation as delivered on the notification channel.
///
/// The payload is treated as a blob: whatever the storage trigger serialized
/// is exactly what ends up as the Kafka message value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Serialized representation of the row change, verbatim from storage.
    pub payload: String,
}

impl ChangeEvent {
    /// Create a change event from a notification payload.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// A message bound for the bus topic.
///
/// Headers carry trace-propagation pairs injected at publish time, in
/// insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Destination topic.
    pub topic: String,

    /// Partitioning key.
    pub key: Vec<u8>,

    /// Message value, the change-event payload verbatim.
    pub value: Vec<u8>,

    /// Ordered key/value header pairs.
    pub headers: Vec<(String, String)>,
}

impl OutboundMessage {
    /// Create a message with no headers.
    pub fn new(topic: impl Into<String>, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            value: value.into(),
            headers: Vec::new(),
        }
    }

    /// Append a header pair.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}
