//! Received-message contract
//!
//! Every backend wraps its native delivery in a type implementing
//! [`Message`]. Capabilities a backend cannot provide (negative ack, lease
//! extension, raw access) are exposed through optional accessors returning
//! `None` by default, so callers probe instead of downcasting.

use crate::envelope::Header;
use crate::error::MessagingResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Broker-agnostic view of a received message.
#[async_trait]
pub trait Message: Send + Sync {
    /// Message body (opaque bytes)
    fn body(&self) -> &[u8];

    /// Partitioning key, where the backend carries one
    fn key(&self) -> Option<&[u8]> {
        None
    }

    /// Message headers; empty on backends without wire headers
    fn headers(&self) -> Vec<Header> {
        Vec::new()
    }

    /// String attributes; empty on backends without attributes
    fn attributes(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Broker-assigned message ID
    fn id(&self) -> Option<String> {
        None
    }

    /// Topic the message was consumed from
    fn topic(&self) -> Option<String> {
        None
    }

    /// Subject the message was delivered on (subject-based backends)
    fn subject(&self) -> Option<String> {
        None
    }

    /// Broker-side timestamp
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Acknowledge the message.
    ///
    /// At most one of ack/nack ever takes effect on the broker; whichever is
    /// called first wins and later calls return `Ok(())` without side
    /// effects.
    async fn ack(&self) -> MessagingResult<()>;

    /// Negative-acknowledgement capability, if the backend has one.
    fn as_nackable(&self) -> Option<&dyn Nackable> {
        None
    }

    /// Lease-extension capability, if the backend has one.
    fn as_extendable(&self) -> Option<&dyn Extendable> {
        None
    }

    /// Backend-specific delivery metadata, if the wrapper carries any.
    fn as_metadata(&self) -> Option<&dyn MetadataCarrier> {
        None
    }

    /// Access to the native broker message, if the wrapper retains it.
    fn as_raw(&self) -> Option<&dyn RawCarrier> {
        None
    }
}

/// Negative acknowledgement: requeue or refuse a delivery.
#[async_trait]
pub trait Nackable: Send + Sync {
    /// Negatively acknowledge the message. Subject to the same
    /// first-caller-wins rule as [`Message::ack`].
    async fn nack(&self) -> MessagingResult<()>;
}

/// Lease extension for backends with a visibility/processing deadline.
#[async_trait]
pub trait Extendable: Send + Sync {
    /// Extend the processing deadline by roughly `duration`.
    async fn extend(&self, duration: std::time::Duration) -> MessagingResult<()>;
}

/// Backend-specific delivery metadata (attempt counts, delivery tags).
pub trait MetadataCarrier: Send + Sync {
    /// Metadata as loosely typed key/value pairs.
    fn metadata(&self) -> HashMap<String, serde_json::Value>;
}

/// Access to the native broker message for callers that need to escape the
/// abstraction.
pub trait RawCarrier: Send + Sync {
    /// The native message, downcastable to the backend's own type.
    fn raw(&self) -> &(dyn std::any::Any + Send + Sync);
}

/// Single-use response flag shared by every message wrapper.
///
/// The first `try_respond` wins; all later calls observe `false` and must
/// turn their ack or nack into a no-op.
#[derive(Debug, Default)]
pub struct AckState {
    responded: AtomicBool,
}

impl AckState {
    /// Fresh, unresponded state.
    pub fn new() -> Self {
        Self {
            responded: AtomicBool::new(false),
        }
    }

    /// Claim the right to respond. Returns `true` exactly once.
    pub fn try_respond(&self) -> bool {
        self.responded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether an ack or nack has already taken effect.
    pub fn responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }
}
