//! NATS adapter
//!
//! Core NATS delivers at-most-once with no broker-side acknowledgement.
//! When a delivery carries a reply subject the wrapper answers `+ACK` or
//! `-NAK` on it (the request-reply convention used by our producers);
//! without one, ack and nack are recorded locally and nothing goes over
//! the wire. Publishes and subscription registrations are followed by an
//! explicit flush so connection errors surface synchronously.

use crate::config::NatsConfig;
use crate::envelope::{Header, OutgoingMessage, PublishResult};
use crate::error::{MessagingError, MessagingResult};
use crate::handler::Handler;
use crate::message::{AckState, Message, Nackable};
use crate::metrics::{handler_failure_kind, MESSAGING_METRICS};
use crate::options::ConsumeOptions;
use crate::recover::invoke_handler;
use crate::registry::ConsumerRegistry;
use crate::traits::{require_nonempty, Closer, Consumer, Publisher};
use async_nats::{Client, HeaderMap, Subject};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const BACKEND: &str = "nats";

const ACK_PAYLOAD: &str = "+ACK";
const NACK_PAYLOAD: &str = "-NAK";

/// Reply-subject response channel for one delivery.
#[async_trait]
trait NatsResponder: Send + Sync {
    async fn respond(&self, payload: &'static str) -> MessagingResult<()>;
}

struct ReplyResponder {
    client: Client,
    reply: Option<Subject>,
}

#[async_trait]
impl NatsResponder for ReplyResponder {
    async fn respond(&self, payload: &'static str) -> MessagingResult<()> {
        match &self.reply {
            Some(reply) => self
                .client
                .publish(reply.clone(), payload.into())
                .await
                .map_err(|e| MessagingError::AckFailed(format!("nats reply failed: {e}"))),
            None => Ok(()),
        }
    }
}

/// NATS delivery adapted to the [`Message`] contract.
pub struct NatsMessage {
    body: Vec<u8>,
    subject: String,
    headers: Vec<Header>,
    state: AckState,
    responder: Box<dyn NatsResponder>,
}

impl NatsMessage {
    fn from_native(native: async_nats::Message, client: Client) -> Self {
        let headers = native
            .headers
            .as_ref()
            .map(convert_headers)
            .unwrap_or_default();
        Self {
            body: native.payload.to_vec(),
            subject: native.subject.to_string(),
            headers,
            state: AckState::new(),
            responder: Box::new(ReplyResponder {
                client,
                reply: native.reply,
            }),
        }
    }

    fn with_responder(
        body: Vec<u8>,
        subject: &str,
        headers: Vec<Header>,
        responder: Box<dyn NatsResponder>,
    ) -> Self {
        Self {
            body,
            subject: subject.to_string(),
            headers,
            state: AckState::new(),
            responder,
        }
    }
}

#[async_trait]
impl Message for NatsMessage {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn headers(&self) -> Vec<Header> {
        self.headers.clone()
    }

    fn subject(&self) -> Option<String> {
        Some(self.subject.clone())
    }

    fn topic(&self) -> Option<String> {
        Some(self.subject.clone())
    }

    async fn ack(&self) -> MessagingResult<()> {
        if !self.state.try_respond() {
            return Ok(());
        }
        self.responder.respond(ACK_PAYLOAD).await
    }

    fn as_nackable(&self) -> Option<&dyn Nackable> {
        Some(self)
    }
}

#[async_trait]
impl Nackable for NatsMessage {
    async fn nack(&self) -> MessagingResult<()> {
        if !self.state.try_respond() {
            return Ok(());
        }
        self.responder.respond(NACK_PAYLOAD).await
    }
}

/// Flatten a NATS header map into the ordered header list, keeping
/// duplicate values per key.
fn convert_headers(headers: &HeaderMap) -> Vec<Header> {
    let mut out = Vec::new();
    for (name, values) in headers.iter() {
        for value in values {
            out.push(Header::new(name.to_string(), value.as_str().as_bytes().to_vec()));
        }
    }
    out
}

/// Build the outgoing header map: ordered headers keep duplicates,
/// attributes merge in as single-valued entries.
fn build_headers(message: &OutgoingMessage) -> Option<HeaderMap> {
    if message.headers.is_empty() && message.attributes.is_empty() {
        return None;
    }
    let mut map = HeaderMap::new();
    for header in &message.headers {
        map.append(header.key.as_str(), header.value_str().as_str());
    }
    for (key, value) in &message.attributes {
        map.insert(key.as_str(), value.as_str());
    }
    Some(map)
}

/// One worker: drain the feed, answer the reply subject per the auto-ack
/// policy, keep going after handler failures.
async fn run_worker(
    feed: Arc<Mutex<mpsc::Receiver<NatsMessage>>>,
    handler: Arc<dyn Handler>,
    auto_ack: bool,
    subject: String,
) {
    loop {
        let message = { feed.lock().await.recv().await };
        let Some(message) = message else { break };
        let message = Arc::new(message);

        MESSAGING_METRICS
            .messages_consumed
            .with_label_values(&[&subject, BACKEND])
            .inc();

        match invoke_handler(&handler, Arc::clone(&message) as Arc<dyn Message>).await {
            Ok(()) => {
                if auto_ack && !message.state.responded() {
                    if let Err(e) = message.ack().await {
                        tracing::warn!(subject = %subject, error = %e, "nats ack failed");
                    }
                }
            }
            Err(e) => {
                MESSAGING_METRICS
                    .handler_failures
                    .with_label_values(&[&subject, BACKEND, handler_failure_kind(&e)])
                    .inc();
                tracing::warn!(subject = %subject, error = %e, "nats handler failed");
                if auto_ack && !message.state.responded() {
                    if let Err(e) = message.nack().await {
                        tracing::warn!(subject = %subject, error = %e, "nats nack failed");
                    }
                }
            }
        }
    }
}

/// NATS-backed messaging client.
pub struct NatsMessaging {
    client: Client,
    registry: ConsumerRegistry,
}

impl NatsMessaging {
    /// Connect to the configured NATS servers.
    pub async fn connect(config: NatsConfig) -> MessagingResult<Self> {
        if config.servers.is_empty() {
            return Err(MessagingError::Configuration(
                "nats requires at least one server url".to_string(),
            ));
        }

        let client = async_nats::ConnectOptions::new()
            .name(&config.connection_name)
            .connect(config.servers.join(","))
            .await
            .map_err(|e| MessagingError::ConnectionFailed(format!("nats connection failed: {e}")))?;

        Ok(Self {
            client,
            registry: ConsumerRegistry::new(BACKEND),
        })
    }

    async fn publish_inner(
        &self,
        destination: &str,
        message: OutgoingMessage,
    ) -> MessagingResult<PublishResult> {
        require_nonempty("destination", destination)?;
        self.registry.ensure_open()?;

        if message.delay_secs().is_some() {
            return Err(MessagingError::Unsupported(
                "nats does not support deferred delivery".to_string(),
            ));
        }

        let timer = MESSAGING_METRICS
            .publish_latency
            .with_label_values(&[destination, BACKEND])
            .start_timer();

        let subject = destination.to_string();
        let payload = message.body.clone().into();
        match build_headers(&message) {
            Some(headers) => self
                .client
                .publish_with_headers(subject, headers, payload)
                .await
                .map_err(|e| MessagingError::PublishFailed(format!("nats publish failed: {e}")))?,
            None => self
                .client
                .publish(subject, payload)
                .await
                .map_err(|e| MessagingError::PublishFailed(format!("nats publish failed: {e}")))?,
        }

        // The client buffers writes; flush so connection errors fail this
        // publish instead of a later one.
        self.client
            .flush()
            .await
            .map_err(|e| MessagingError::PublishFailed(format!("nats flush failed: {e}")))?;

        timer.observe_duration();
        MESSAGING_METRICS
            .messages_published
            .with_label_values(&[destination, BACKEND])
            .inc();

        Ok(PublishResult::for_topic(destination))
    }
}

#[async_trait]
impl Publisher for NatsMessaging {
    async fn publish(
        &self,
        destination: &str,
        message: OutgoingMessage,
    ) -> MessagingResult<PublishResult> {
        let result = self.publish_inner(destination, message).await;
        if let Err(e) = &result {
            MESSAGING_METRICS
                .publish_failures
                .with_label_values(&[destination, BACKEND, e.kind()])
                .inc();
        }
        result
    }
}

#[async_trait]
impl Consumer for NatsMessaging {
    async fn consume(
        &self,
        source: &str,
        handler: Arc<dyn Handler>,
        cancel: CancellationToken,
        options: ConsumeOptions,
    ) -> MessagingResult<()> {
        require_nonempty("source", source)?;
        let queue_group = options.queue_group.clone().unwrap_or_default();
        require_nonempty("queue group", &queue_group)?;
        self.registry.ensure_open()?;

        if cancel.is_cancelled() {
            return Ok(());
        }

        let (token, guard) = self.registry.register(&cancel)?;

        let mut subscriber = self
            .client
            .queue_subscribe(source.to_string(), queue_group.clone())
            .await
            .map_err(|e| MessagingError::SubscribeFailed(format!("nats subscribe failed: {e}")))?;

        // Flush the SUB frame so a dead connection fails here, not on the
        // first missed delivery.
        self.client
            .flush()
            .await
            .map_err(|e| MessagingError::SubscribeFailed(format!("nats flush failed: {e}")))?;

        let workers = options.workers();
        let auto_ack = options.effective_auto_ack();
        tracing::info!(
            subject = %source,
            queue_group = %queue_group,
            workers,
            "nats consumer starting"
        );

        let (tx, rx) = mpsc::channel::<NatsMessage>(workers);
        let rx = Arc::new(Mutex::new(rx));

        let mut worker_tasks = Vec::with_capacity(workers);
        for _ in 0..workers {
            worker_tasks.push(tokio::spawn(run_worker(
                Arc::clone(&rx),
                Arc::clone(&handler),
                auto_ack,
                source.to_string(),
            )));
        }

        let dispatch_client = self.client.clone();
        let dispatch_token = token.clone();
        let dispatch = tokio::spawn(async move {
            let result = loop {
                tokio::select! {
                    _ = dispatch_token.cancelled() => break Ok(()),
                    delivery = subscriber.next() => match delivery {
                        Some(native) => {
                            let message = NatsMessage::from_native(native, dispatch_client.clone());
                            if tx.send(message).await.is_err() {
                                break Ok(());
                            }
                        }
                        None => break Err(MessagingError::ConsumeFailed(
                            "nats subscription ended".to_string(),
                        )),
                    },
                }
            };
            if let Err(e) = subscriber.unsubscribe().await {
                tracing::warn!(error = %e, "nats unsubscribe failed");
            }
            // Dropping the sender lets the workers drain and exit.
            result
        });

        let dispatch_result = match dispatch.await {
            Ok(result) => result,
            Err(e) => Err(MessagingError::ConsumeFailed(format!(
                "nats dispatch task failed: {e}"
            ))),
        };
        for task in worker_tasks {
            let _ = task.await;
        }
        drop(guard);

        if let Err(e) = &dispatch_result {
            MESSAGING_METRICS
                .consume_failures
                .with_label_values(&[source, BACKEND, e.kind()])
                .inc();
        }
        tracing::info!(subject = %source, queue_group = %queue_group, "nats consumer stopped");
        dispatch_result
    }
}

#[async_trait]
impl Closer for NatsMessaging {
    async fn close(&self) -> MessagingResult<()> {
        if self.registry.is_closed() {
            return Ok(());
        }
        self.registry.shut_down().await;
        // Every consume loop has unsubscribed by now; flush pushes any
        // buffered frames out before the connection drops with the client.
        self.client
            .flush()
            .await
            .map_err(|e| MessagingError::ConnectionFailed(format!("nats flush failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Default)]
    struct FakeResponder {
        acks: AtomicUsize,
        naks: AtomicUsize,
    }

    struct SharedResponder {
        counters: Arc<FakeResponder>,
    }

    #[async_trait]
    impl NatsResponder for SharedResponder {
        async fn respond(&self, payload: &'static str) -> MessagingResult<()> {
            match payload {
                ACK_PAYLOAD => self.counters.acks.fetch_add(1, Ordering::SeqCst),
                _ => self.counters.naks.fetch_add(1, Ordering::SeqCst),
            };
            Ok(())
        }
    }

    fn fake_message(body: &str, counters: &Arc<FakeResponder>) -> NatsMessage {
        NatsMessage::with_responder(
            body.as_bytes().to_vec(),
            "user.created",
            Vec::new(),
            Box::new(SharedResponder {
                counters: Arc::clone(counters),
            }),
        )
    }

    #[tokio::test]
    async fn test_ack_then_nack_is_single_effect() {
        let counters = Arc::new(FakeResponder::default());
        let message = fake_message("x", &counters);

        message.ack().await.unwrap();
        message.as_nackable().unwrap().nack().await.unwrap();

        assert_eq!(counters.acks.load(Ordering::SeqCst), 1);
        assert_eq!(counters.naks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_nack_then_ack_is_single_effect() {
        let counters = Arc::new(FakeResponder::default());
        let message = fake_message("x", &counters);

        message.as_nackable().unwrap().nack().await.unwrap();
        message.ack().await.unwrap();

        assert_eq!(counters.acks.load(Ordering::SeqCst), 0);
        assert_eq!(counters.naks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_acks_success_and_naks_failure() {
        let counters = Arc::new(FakeResponder::default());
        let (tx, rx) = mpsc::channel(4);
        let rx = Arc::new(Mutex::new(rx));
        let handler = handler_fn(|msg| async move {
            if msg.body() == b"bad" {
                return Err(anyhow::anyhow!("rejected"));
            }
            Ok(())
        });

        let worker = tokio::spawn(run_worker(rx, handler, true, "user.created".into()));
        tx.send(fake_message("good", &counters)).await.unwrap();
        tx.send(fake_message("bad", &counters)).await.unwrap();
        tx.send(fake_message("good", &counters)).await.unwrap();
        drop(tx);
        timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();

        // The failure sits between two successes: the worker kept going.
        assert_eq!(counters.acks.load(Ordering::SeqCst), 2);
        assert_eq!(counters.naks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_panic_naks_and_continues() {
        let counters = Arc::new(FakeResponder::default());
        let (tx, rx) = mpsc::channel(4);
        let rx = Arc::new(Mutex::new(rx));
        let handler = handler_fn(|msg| async move {
            if msg.body() == b"boom" {
                panic!("malformed payload");
            }
            Ok(())
        });

        let worker = tokio::spawn(run_worker(rx, handler, true, "user.created".into()));
        tx.send(fake_message("boom", &counters)).await.unwrap();
        tx.send(fake_message("fine", &counters)).await.unwrap();
        drop(tx);
        timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();

        assert_eq!(counters.naks.load(Ordering::SeqCst), 1);
        assert_eq!(counters.acks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_respects_manual_response() {
        let counters = Arc::new(FakeResponder::default());
        let (tx, rx) = mpsc::channel(4);
        let rx = Arc::new(Mutex::new(rx));
        let handler = handler_fn(|msg| async move {
            let nackable = msg.as_nackable().expect("nats messages are nackable");
            nackable.nack().await?;
            Ok(())
        });

        let worker = tokio::spawn(run_worker(rx, handler, true, "user.created".into()));
        tx.send(fake_message("x", &counters)).await.unwrap();
        drop(tx);
        timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();

        // The handler nacked despite returning Ok; no auto-ack may follow.
        assert_eq!(counters.acks.load(Ordering::SeqCst), 0);
        assert_eq!(counters.naks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_build_headers_keeps_duplicates_and_merges_attributes() {
        let message = OutgoingMessage::new("x")
            .with_header("trace", b"a".to_vec())
            .with_header("trace", b"b".to_vec())
            .with_attribute("tenant", "t1");

        let map = build_headers(&message).expect("headers expected");
        let converted = convert_headers(&map);

        let traces: Vec<String> = converted
            .iter()
            .filter(|h| h.key == "trace")
            .map(Header::value_str)
            .collect();
        assert_eq!(traces.len(), 2);
        assert!(traces.contains(&"a".to_string()));
        assert!(traces.contains(&"b".to_string()));
        assert!(converted.iter().any(|h| h.key == "tenant" && h.value_str() == "t1"));
    }

    #[test]
    fn test_build_headers_empty_when_nothing_to_send() {
        let message = OutgoingMessage::new("x");
        assert!(build_headers(&message).is_none());
    }
}
