//! NSQ adapter
//!
//! Producer and consumer sides are independent: publishing requires a
//! configured `producer_address`, consuming requires nsqd or nsqlookupd
//! addresses plus a channel name. The client library never auto-responds,
//! so the message wrapper fully controls finish/requeue per delivery.
//!
//! NSQ frames carry an opaque body only. Headers and attributes on an
//! outgoing message are dropped (logged at debug), and received messages
//! expose empty header views; the delivery attempt count is surfaced as
//! metadata.

use crate::config::NsqConfig;
use crate::envelope::{OutgoingMessage, PublishResult};
use crate::error::{MessagingError, MessagingResult};
use crate::handler::Handler;
use crate::message::{AckState, Extendable, Message, MetadataCarrier, Nackable};
use crate::metrics::{handler_failure_kind, MESSAGING_METRICS};
use crate::options::ConsumeOptions;
use crate::recover::invoke_handler;
use crate::registry::ConsumerRegistry;
use crate::traits::{require_nonempty, Closer, Consumer, Publisher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_nsq::{
    NSQChannel, NSQConsumerConfig, NSQConsumerConfigSources, NSQConsumerLookupConfig, NSQEvent,
    NSQProducer, NSQProducerConfig, NSQRequeueDelay, NSQTopic,
};
use tokio_util::sync::CancellationToken;

const BACKEND: &str = "nsq";

/// Broker-side response operations for one delivery.
#[async_trait]
trait NsqResponder: Send + Sync {
    async fn finish(&self) -> MessagingResult<()>;
    async fn requeue(&self) -> MessagingResult<()>;
    async fn touch(&self) -> MessagingResult<()>;
}

/// Responder backed by the native message. `finish` and `requeue` consume
/// the native value, so it lives in a take-once slot.
struct NativeResponder {
    native: Mutex<Option<tokio_nsq::NSQMessage>>,
}

#[async_trait]
impl NsqResponder for NativeResponder {
    async fn finish(&self) -> MessagingResult<()> {
        match self.native.lock().await.take() {
            Some(native) => {
                native.finish().await;
                Ok(())
            }
            None => Err(MessagingError::AckFailed(
                "nsq message already responded".to_string(),
            )),
        }
    }

    async fn requeue(&self) -> MessagingResult<()> {
        match self.native.lock().await.take() {
            Some(native) => {
                native.requeue(NSQRequeueDelay::NoDelay).await;
                Ok(())
            }
            None => Err(MessagingError::AckFailed(
                "nsq message already responded".to_string(),
            )),
        }
    }

    async fn touch(&self) -> MessagingResult<()> {
        match self.native.lock().await.as_mut() {
            Some(native) => {
                native.touch().await;
                Ok(())
            }
            None => Err(MessagingError::AckFailed(
                "nsq message already responded".to_string(),
            )),
        }
    }
}

/// NSQ delivery adapted to the [`Message`] contract.
pub struct NsqMessage {
    body: Vec<u8>,
    id: String,
    attempt: u16,
    timestamp: Option<DateTime<Utc>>,
    topic: String,
    state: AckState,
    responder: Box<dyn NsqResponder>,
}

impl NsqMessage {
    fn from_native(native: tokio_nsq::NSQMessage, topic: &str) -> Self {
        Self {
            body: native.body.clone(),
            id: String::from_utf8_lossy(&native.id).into_owned(),
            attempt: native.attempt,
            timestamp: Some(DateTime::from_timestamp_nanos(native.timestamp as i64)),
            topic: topic.to_string(),
            state: AckState::new(),
            responder: Box::new(NativeResponder {
                native: Mutex::new(Some(native)),
            }),
        }
    }

    fn with_responder(
        body: Vec<u8>,
        id: String,
        attempt: u16,
        topic: &str,
        responder: Box<dyn NsqResponder>,
    ) -> Self {
        Self {
            body,
            id,
            attempt,
            timestamp: None,
            topic: topic.to_string(),
            state: AckState::new(),
            responder,
        }
    }
}

#[async_trait]
impl Message for NsqMessage {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn id(&self) -> Option<String> {
        Some(self.id.clone())
    }

    fn topic(&self) -> Option<String> {
        Some(self.topic.clone())
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    async fn ack(&self) -> MessagingResult<()> {
        if !self.state.try_respond() {
            return Ok(());
        }
        self.responder.finish().await
    }

    fn as_nackable(&self) -> Option<&dyn Nackable> {
        Some(self)
    }

    fn as_extendable(&self) -> Option<&dyn Extendable> {
        Some(self)
    }

    fn as_metadata(&self) -> Option<&dyn MetadataCarrier> {
        Some(self)
    }
}

#[async_trait]
impl Nackable for NsqMessage {
    async fn nack(&self) -> MessagingResult<()> {
        if !self.state.try_respond() {
            return Ok(());
        }
        self.responder.requeue().await
    }
}

#[async_trait]
impl Extendable for NsqMessage {
    async fn extend(&self, _duration: std::time::Duration) -> MessagingResult<()> {
        // TOUCH resets the server-side timeout; the extension length is not
        // adjustable per call.
        self.responder.touch().await
    }
}

impl MetadataCarrier for NsqMessage {
    fn metadata(&self) -> HashMap<String, serde_json::Value> {
        HashMap::from([("attempt".to_string(), serde_json::json!(self.attempt))])
    }
}

struct ProducerState {
    producer: Option<NSQProducer>,
    healthy: bool,
}

/// NSQ-backed messaging client.
pub struct NsqMessaging {
    config: NsqConfig,
    producer: Option<Mutex<ProducerState>>,
    registry: ConsumerRegistry,
}

impl NsqMessaging {
    /// Create a new NSQ client.
    ///
    /// The producer connection is established in the background when
    /// `producer_address` is set; the first publish waits for it to become
    /// healthy. Without a producer address every publish fails with
    /// [`MessagingError::ProducerNotConfigured`].
    pub fn new(config: NsqConfig) -> Self {
        let producer = config.producer_address.as_ref().map(|addr| {
            Mutex::new(ProducerState {
                producer: Some(NSQProducerConfig::new(addr.as_str()).build()),
                healthy: false,
            })
        });

        Self {
            config,
            producer,
            registry: ConsumerRegistry::new(BACKEND),
        }
    }

    async fn publish_inner(
        &self,
        destination: &str,
        message: OutgoingMessage,
    ) -> MessagingResult<PublishResult> {
        require_nonempty("destination", destination)?;
        self.registry.ensure_open()?;

        let slot = self.producer.as_ref().ok_or_else(|| {
            MessagingError::ProducerNotConfigured(
                "nsq publish requires a producer address".to_string(),
            )
        })?;

        let topic = NSQTopic::new(destination).ok_or_else(|| {
            MessagingError::Validation(format!("invalid nsq topic name: {destination}"))
        })?;

        if !message.headers.is_empty() || !message.attributes.is_empty() {
            tracing::debug!(
                topic = %destination,
                "nsq carries no wire headers; headers and attributes are dropped"
            );
        }

        let delay_secs = message.delay_secs();
        let body = message.body;

        let timer = MESSAGING_METRICS
            .publish_latency
            .with_label_values(&[destination, BACKEND])
            .start_timer();

        // Publishes are serialized: the producer event stream pairs one Ok
        // with one in-flight publish.
        let mut slot_guard = slot.lock().await;
        let state = &mut *slot_guard;
        let producer = state.producer.as_mut().ok_or(MessagingError::Closed)?;
        if !state.healthy {
            wait_healthy(producer).await?;
            state.healthy = true;
        }

        match delay_secs {
            Some(secs) => producer
                .publish_deferred(&topic, body, secs as u32)
                .await
                .map_err(|e| {
                    MessagingError::PublishFailed(format!("nsq deferred publish failed: {e}"))
                })?,
            None => producer.publish(&topic, body).await.map_err(|e| {
                MessagingError::PublishFailed(format!("nsq publish failed: {e}"))
            })?,
        }

        wait_publish_ok(producer).await?;
        drop(slot_guard);

        timer.observe_duration();
        MESSAGING_METRICS
            .messages_published
            .with_label_values(&[destination, BACKEND])
            .inc();

        Ok(PublishResult::for_topic(destination))
    }
}

/// Drive producer events until the connection reports healthy.
async fn wait_healthy(producer: &mut NSQProducer) -> MessagingResult<()> {
    loop {
        match producer.consume().await {
            Some(NSQEvent::Healthy()) => return Ok(()),
            Some(_) => continue,
            None => {
                return Err(MessagingError::ConnectionFailed(
                    "nsq producer event stream ended".to_string(),
                ))
            }
        }
    }
}

/// Wait for the broker to acknowledge the most recent publish.
async fn wait_publish_ok(producer: &mut NSQProducer) -> MessagingResult<()> {
    loop {
        match producer.consume().await {
            Some(NSQEvent::Ok()) => return Ok(()),
            Some(_) => continue,
            None => {
                return Err(MessagingError::PublishFailed(
                    "nsq producer event stream ended".to_string(),
                ))
            }
        }
    }
}

/// One worker: drain the feed until it closes, responding per the auto-ack
/// policy unless the handler already responded.
async fn run_worker(
    feed: Arc<Mutex<mpsc::Receiver<NsqMessage>>>,
    handler: Arc<dyn Handler>,
    auto_ack: bool,
    topic: String,
) {
    loop {
        let message = { feed.lock().await.recv().await };
        let Some(message) = message else { break };
        let message = Arc::new(message);

        MESSAGING_METRICS
            .messages_consumed
            .with_label_values(&[&topic, BACKEND])
            .inc();

        match invoke_handler(&handler, Arc::clone(&message) as Arc<dyn Message>).await {
            Ok(()) => {
                if auto_ack && !message.state.responded() {
                    if let Err(e) = message.ack().await {
                        tracing::warn!(topic = %topic, error = %e, "nsq finish failed");
                    }
                }
            }
            Err(e) => {
                MESSAGING_METRICS
                    .handler_failures
                    .with_label_values(&[&topic, BACKEND, handler_failure_kind(&e)])
                    .inc();
                tracing::warn!(topic = %topic, error = %e, "nsq handler failed, requeueing");
                if auto_ack && !message.state.responded() {
                    if let Err(e) = message.nack().await {
                        tracing::warn!(topic = %topic, error = %e, "nsq requeue failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Publisher for NsqMessaging {
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
impl Consumer for NsqMessaging {
    async fn consume(
        &self,
        source: &str,
        handler: Arc<dyn Handler>,
        cancel: CancellationToken,
        options: ConsumeOptions,
    ) -> MessagingResult<()> {
        require_nonempty("source", source)?;
        let channel_name = options.channel.clone().unwrap_or_default();
        require_nonempty("channel", &channel_name)?;
        self.registry.ensure_open()?;

        if cancel.is_cancelled() {
            return Ok(());
        }

        let topic = NSQTopic::new(source).ok_or_else(|| {
            MessagingError::Validation(format!("invalid nsq topic name: {source}"))
        })?;
        let channel = NSQChannel::new(channel_name.as_str()).ok_or_else(|| {
            MessagingError::Validation(format!("invalid nsq channel name: {channel_name}"))
        })?;

        let sources = if !self.config.lookupd_addresses.is_empty() {
            NSQConsumerConfigSources::Lookup(
                NSQConsumerLookupConfig::new()
                    .set_addresses(self.config.lookupd_addresses.iter().cloned().collect()),
            )
        } else if !self.config.nsqd_addresses.is_empty() {
            NSQConsumerConfigSources::Daemons(self.config.nsqd_addresses.clone())
        } else {
            return Err(MessagingError::Validation(
                "nsq consume requires nsqd or nsqlookupd addresses".to_string(),
            ));
        };

        let (token, guard) = self.registry.register(&cancel)?;

        let mut native_consumer = NSQConsumerConfig::new(topic, channel)
            .set_max_in_flight(options.effective_max_in_flight() as u32)
            .set_sources(sources)
            .build();

        let workers = options.workers();
        let auto_ack = options.effective_auto_ack();
        tracing::info!(
            topic = %source,
            channel = %channel_name,
            workers,
            "nsq consumer starting"
        );

        let (tx, rx) = mpsc::channel::<NsqMessage>(workers);
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

        let fetch_token = token.clone();
        let fetch_topic = source.to_string();
        let fetch = tokio::spawn(async move {
            let result = loop {
                tokio::select! {
                    _ = fetch_token.cancelled() => break Ok(()),
                    fetched = native_consumer.consume_filtered() => match fetched {
                        Some(native) => {
                            let message = NsqMessage::from_native(native, &fetch_topic);
                            if tx.send(message).await.is_err() {
                                break Ok(());
                            }
                        }
                        None => break Err(MessagingError::ConsumeFailed(
                            "nsq consumer event stream ended".to_string(),
                        )),
                    },
                }
            };
            // Dropping the sender lets the workers drain and exit.
            result
        });

        let fetch_result = match fetch.await {
            Ok(result) => result,
            Err(e) => Err(MessagingError::ConsumeFailed(format!(
                "nsq fetch task failed: {e}"
            ))),
        };
        for task in worker_tasks {
            let _ = task.await;
        }
        drop(guard);

        if let Err(e) = &fetch_result {
            MESSAGING_METRICS
                .consume_failures
                .with_label_values(&[source, BACKEND, e.kind()])
                .inc();
        }
        tracing::info!(topic = %source, channel = %channel_name, "nsq consumer stopped");
        fetch_result
    }
}

#[async_trait]
impl Closer for NsqMessaging {
    async fn close(&self) -> MessagingResult<()> {
        if self.registry.is_closed() {
            return Ok(());
        }
        self.registry.shut_down().await;
        if let Some(slot) = &self.producer {
            // Dropping the producer closes its connection.
            slot.lock().await.producer = None;
        }
        Ok(())
    }
}
