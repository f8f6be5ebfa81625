//! Panic-safe handler invocation
//!
//! A malformed message must never take down a worker. Every adapter routes
//! handler calls through [`invoke_handler`], which converts both returned
//! errors and panics into [`MessagingError`] values the worker loops treat
//! uniformly when deciding ack/nack.
//!
//! Containment relies on unwinding; build profiles must not set
//! `panic = "abort"`.

use crate::error::{MessagingError, MessagingResult};
use crate::handler::Handler;
use crate::message::Message;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Invoke the handler for one delivery, recovering panics.
///
/// Returns `Handler` for an error the handler returned and `HandlerPanic`
/// when the handler unwound; both are treated as processing failure by the
/// caller.
pub async fn invoke_handler(
    handler: &Arc<dyn Handler>,
    message: Arc<dyn Message>,
) -> MessagingResult<()> {
    match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(MessagingError::Handler(format!("{e:#}"))),
        Err(panic) => {
            let detail = panic_detail(panic.as_ref());
            tracing::error!(panic = %detail, "message handler panicked");
            Err(MessagingError::HandlerPanic(detail))
        }
    }
}

/// Best-effort text for a panic payload. The full backtrace, if enabled,
/// has already been printed by the process panic hook.
fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use async_trait::async_trait;

    struct EmptyMessage;

    #[async_trait]
    impl Message for EmptyMessage {
        fn body(&self) -> &[u8] {
            &[]
        }

        async fn ack(&self) -> MessagingResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let handler = handler_fn(|_msg| async { Ok(()) });
        assert!(invoke_handler(&handler, Arc::new(EmptyMessage)).await.is_ok());
    }

    #[tokio::test]
    async fn test_handler_error_is_wrapped() {
        let handler = handler_fn(|_msg| async { Err(anyhow::anyhow!("bad payload")) });
        let err = invoke_handler(&handler, Arc::new(EmptyMessage))
            .await
            .unwrap_err();
        match err {
            MessagingError::Handler(detail) => assert!(detail.contains("bad payload")),
            other => panic!("expected handler error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_str_panic_is_recovered() {
        let handler = handler_fn(|_msg| async { panic!("boom") });
        let err = invoke_handler(&handler, Arc::new(EmptyMessage))
            .await
            .unwrap_err();
        match err {
            MessagingError::HandlerPanic(detail) => assert_eq!(detail, "boom"),
            other => panic!("expected panic error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_string_panic_is_recovered() {
        let handler = handler_fn(|_msg| async move {
            panic!("failed at attempt {}", 3);
        });
        let err = invoke_handler(&handler, Arc::new(EmptyMessage))
            .await
            .unwrap_err();
        match err {
            MessagingError::HandlerPanic(detail) => assert_eq!(detail, "failed at attempt 3"),
            other => panic!("expected panic error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_handler() {
        let handler = handler_fn(|_msg| async { panic!("poisoned message") });
        // Two invocations on the same task: the first panic must not leave
        // the task unusable for the second.
        let first = invoke_handler(&handler, Arc::new(EmptyMessage)).await;
        let second = invoke_handler(&handler, Arc::new(EmptyMessage)).await;
        assert!(matches!(first, Err(MessagingError::HandlerPanic(_))));
        assert!(matches!(second, Err(MessagingError::HandlerPanic(_))));
    }
}
