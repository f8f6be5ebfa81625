//! Outgoing envelope and publish result types
//!
//! The envelope is deliberately generic: a byte body plus optional routing
//! hints. Serialization of the body is the caller's responsibility; the
//! messaging layer never inspects it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A single message header.
///
/// Headers are an ordered list and duplicate keys are allowed; backends that
/// cannot represent byte-valued or duplicate headers document the lossy
/// mapping on their adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Header key
    pub key: String,

    /// Header value (raw bytes)
    pub value: Vec<u8>,
}

impl Header {
    /// Create a new header from anything byte-like.
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Header value as UTF-8, lossy.
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// A message to be published.
///
/// Construct with [`OutgoingMessage::new`] and chain `with_*` methods; the
/// message is treated as immutable once handed to `publish`.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    /// Message body (opaque bytes)
    pub body: Vec<u8>,

    /// Partitioning key, honored by backends with keyed partitioning
    pub key: Option<Vec<u8>>,

    /// Ordered headers, duplicate keys allowed
    pub headers: Vec<Header>,

    /// String attributes, for backends without byte-valued headers
    pub attributes: HashMap<String, String>,

    /// Ordering key for backends with per-key ordering
    pub ordering_key: Option<String>,

    /// Deferred delivery delay; unsupported backends reject the publish
    pub delay: Option<Duration>,

    /// Backend-specific publish hints, passed through uninterpreted
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OutgoingMessage {
    /// Create a message with the given body.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Set the partitioning key.
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Append a header. Repeated calls with the same key accumulate.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }

    /// Set a string attribute, replacing any previous value for the key.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set the ordering key.
    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    /// Request deferred delivery after `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Attach a backend-specific publish hint.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Delay in whole seconds, when a delay was requested.
    pub(crate) fn delay_secs(&self) -> Option<u64> {
        self.delay.filter(|d| !d.is_zero()).map(|d| d.as_secs().max(1))
    }
}

/// Broker-assigned identifiers returned from a successful publish.
///
/// Fields are populated only where the backend supplies them.
#[derive(Debug, Clone, Default)]
pub struct PublishResult {
    /// Broker-assigned message ID
    pub message_id: Option<String>,

    /// Destination the message was published to
    pub topic: String,

    /// Assigned partition (partitioned backends)
    pub partition: Option<i32>,

    /// Assigned offset (log-structured backends)
    pub offset: Option<i64>,

    /// Assigned sequence number (stream backends)
    pub sequence: Option<u64>,

    /// Broker-side publish timestamp
    pub timestamp: Option<DateTime<Utc>>,

    /// Opaque backend-specific result payload
    pub raw: Option<serde_json::Value>,
}

impl PublishResult {
    /// Result carrying only the destination.
    pub fn for_topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_preserve_order_and_duplicates() {
        let msg = OutgoingMessage::new(b"body".to_vec())
            .with_header("trace", b"a".to_vec())
            .with_header("trace", b"b".to_vec())
            .with_header("tenant", b"t1".to_vec());

        assert_eq!(msg.headers.len(), 3);
        assert_eq!(msg.headers[0].value_str(), "a");
        assert_eq!(msg.headers[1].value_str(), "b");
        assert_eq!(msg.headers[2].key, "tenant");
    }

    #[test]
    fn test_attributes_replace_on_same_key() {
        let msg = OutgoingMessage::new("x")
            .with_attribute("source", "api")
            .with_attribute("source", "worker");

        assert_eq!(msg.attributes.get("source").map(String::as_str), Some("worker"));
    }

    #[test]
    fn test_delay_secs_rounds_up_subsecond_delays() {
        let none = OutgoingMessage::new("x");
        assert_eq!(none.delay_secs(), None);

        let zero = OutgoingMessage::new("x").with_delay(Duration::ZERO);
        assert_eq!(zero.delay_secs(), None);

        let sub = OutgoingMessage::new("x").with_delay(Duration::from_millis(200));
        assert_eq!(sub.delay_secs(), Some(1));

        let five = OutgoingMessage::new("x").with_delay(Duration::from_secs(5));
        assert_eq!(five.delay_secs(), Some(5));
    }

    #[test]
    fn test_publish_result_defaults_are_empty() {
        let res = PublishResult::for_topic("user.created");
        assert_eq!(res.topic, "user.created");
        assert!(res.message_id.is_none());
        assert!(res.partition.is_none());
        assert!(res.offset.is_none());
        assert!(res.raw.is_none());
    }
}
