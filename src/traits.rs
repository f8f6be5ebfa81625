//! Messaging trait abstractions
//!
//! The outward contract is `Messaging = Publisher + Consumer + Closer`. One
//! adapter instance is shared by arbitrarily many concurrent publishers and
//! consumers; `close` stops everything the adapter owns.

use crate::envelope::{OutgoingMessage, PublishResult};
use crate::error::{MessagingError, MessagingResult};
use crate::handler::Handler;
use crate::options::ConsumeOptions;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Message publisher trait
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one message to `destination`.
    ///
    /// An empty destination is rejected before any broker I/O. A `delay` on
    /// a backend without deferred delivery returns
    /// [`MessagingError::Unsupported`] with no partial side effect.
    /// Cancelling a publish is done by dropping the returned future.
    async fn publish(
        &self,
        destination: &str,
        message: OutgoingMessage,
    ) -> MessagingResult<PublishResult>;
}

/// Message consumer trait
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Consume messages from `source` until `cancel` fires, a fatal broker
    /// error occurs, or a handler error is escalated by the backend.
    ///
    /// Required options (channel/group/subscription, depending on backend)
    /// are validated before any broker resource is created; a token that is
    /// already cancelled returns `Ok(())` without touching the broker. On
    /// every return path all subscriptions and worker tasks created by this
    /// call have been released.
    async fn consume(
        &self,
        source: &str,
        handler: Arc<dyn Handler>,
        cancel: CancellationToken,
        options: ConsumeOptions,
    ) -> MessagingResult<()>;
}

/// Connection lifecycle trait
#[async_trait]
pub trait Closer: Send + Sync {
    /// Stop all consumers and producers owned by the adapter.
    ///
    /// Idempotent: the second call returns `Ok(())` without further broker
    /// calls. After close, `publish` and `consume` fail with
    /// [`MessagingError::Closed`].
    async fn close(&self) -> MessagingResult<()>;
}

/// Full messaging contract exposed to the rest of the system.
pub trait Messaging: Publisher + Consumer + Closer {}

impl<T: Publisher + Consumer + Closer + ?Sized> Messaging for T {}

/// Reject blank identifiers before any broker interaction.
pub(crate) fn require_nonempty(what: &str, value: &str) -> MessagingResult<()> {
    if value.trim().is_empty() {
        return Err(MessagingError::Validation(format!("{what} must not be empty")));
    }
    Ok(())
}
