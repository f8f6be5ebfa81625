//! Handler callback contract

use crate::message::Message;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Caller-supplied message handler.
///
/// The handler may ack or nack the message itself; adapters detect that via
/// the wrapper's response flag and skip their own auto-response. A returned
/// error triggers the adapter's nack path (or leaves the offset uncommitted
/// on log-structured backends).
#[async_trait]
pub trait Handler: Send + Sync {
    /// Process one delivery.
    async fn handle(&self, message: Arc<dyn Message>) -> anyhow::Result<()>;
}

/// [`Handler`] built from an async closure.
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Arc<dyn Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Arc<dyn Message>) -> anyhow::Result<()> {
        (self.f)(message).await
    }
}

/// Wrap an async closure as a shareable [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Arc<dyn Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(HandlerFn { f })
}
