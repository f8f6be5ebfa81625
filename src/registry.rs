//! Live-consumer tracking shared by all adapters
//!
//! Each `consume` call registers itself here and receives a cancellation
//! token that fires when either the caller cancels or the adapter is
//! closed. `close` flips a single-use closed flag, cancels every registered
//! loop, and waits for each one to finish so no task outlives the adapter.

use crate::error::{MessagingError, MessagingResult};
use crate::metrics::MESSAGING_METRICS;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub(crate) struct ConsumerRegistry {
    backend: &'static str,
    shutdown: CancellationToken,
    closed: AtomicBool,
    active: Mutex<Vec<ActiveConsumer>>,
}

struct ActiveConsumer {
    done: oneshot::Receiver<()>,
}

/// Held by a consume loop for its whole lifetime; dropping it marks the
/// loop finished and releases its cancellation watcher.
pub(crate) struct ConsumerGuard {
    backend: &'static str,
    cancel: CancellationToken,
    done: Option<oneshot::Sender<()>>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(tx) = self.done.take() {
            let _ = tx.send(());
        }
        MESSAGING_METRICS
            .active_consumers
            .with_label_values(&[self.backend])
            .dec();
    }
}

impl ConsumerRegistry {
    pub(crate) fn new(backend: &'static str) -> Self {
        Self {
            backend,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            active: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reject the operation once the adapter has been closed.
    pub(crate) fn ensure_open(&self) -> MessagingResult<()> {
        if self.is_closed() {
            return Err(MessagingError::Closed);
        }
        Ok(())
    }

    /// Register a new consume loop.
    ///
    /// The returned token fires when the caller's token fires or the
    /// adapter shuts down, whichever comes first. The guard must stay alive
    /// until the loop has released all its broker resources.
    pub(crate) fn register(
        &self,
        caller: &CancellationToken,
    ) -> MessagingResult<(CancellationToken, ConsumerGuard)> {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();

        {
            let mut active = self.active.lock();
            // Checked under the lock so a concurrent close cannot miss us.
            if self.is_closed() {
                return Err(MessagingError::Closed);
            }
            active.push(ActiveConsumer { done: done_rx });
        }

        let watcher_cancel = cancel.clone();
        let caller = caller.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = caller.cancelled() => {}
                _ = shutdown.cancelled() => {}
                _ = watcher_cancel.cancelled() => {}
            }
            watcher_cancel.cancel();
        });

        MESSAGING_METRICS
            .active_consumers
            .with_label_values(&[self.backend])
            .inc();

        let guard = ConsumerGuard {
            backend: self.backend,
            cancel: cancel.clone(),
            done: Some(done_tx),
        };
        Ok((cancel, guard))
    }

    /// Cancel every consume loop and wait for each to finish.
    ///
    /// Only the first call does any work; later calls return immediately.
    pub(crate) async fn shut_down(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.shutdown.cancel();
        let active = std::mem::take(&mut *self.active.lock());
        for consumer in active {
            // Err means the loop already finished and dropped its guard.
            let _ = consumer.done.await;
        }
    }
}
