//! Kafka adapter
//!
//! Publishing uses one lazily created producer shared across topics; the
//! broker-assigned partition and offset are returned to the caller.
//! Consuming runs a fetch task that pulls records into a rendezvous
//! channel drained by a bounded worker pool. Offsets are committed
//! per message on ack; a handler error stops the whole consume call and
//! leaves the failing offset uncommitted, so redelivery happens on
//! restart or rebalance. There is no broker-side negative ack and no
//! lease to extend.

use crate::config::KafkaConfig;
use crate::envelope::{Header, OutgoingMessage, PublishResult};
use crate::error::{MessagingError, MessagingResult};
use crate::handler::Handler;
use crate::message::{AckState, Message, MetadataCarrier, Nackable};
use crate::metrics::{handler_failure_kind, MESSAGING_METRICS};
use crate::options::ConsumeOptions;
use crate::recover::invoke_handler;
use crate::registry::ConsumerRegistry;
use crate::traits::{require_nonempty, Closer, Consumer, Publisher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as RdConsumer, StreamConsumer};
use rdkafka::message::{Header as KafkaHeader, Headers as RdHeaders, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::Message as RdMessage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const BACKEND: &str = "kafka";

/// Offset sink for one consume call.
///
/// `offset` is the offset to commit, one past the delivered message.
#[async_trait]
trait KafkaCommitter: Send + Sync {
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> MessagingResult<()>;
}

struct StreamCommitter {
    consumer: Arc<StreamConsumer>,
}

#[async_trait]
impl KafkaCommitter for StreamCommitter {
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> MessagingResult<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset))
            .map_err(|e| MessagingError::AckFailed(format!("kafka commit list failed: {e}")))?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| MessagingError::AckFailed(format!("kafka commit failed: {e}")))?;
        Ok(())
    }
}

/// Kafka record adapted to the [`Message`] contract.
pub struct KafkaMessage {
    native: OwnedMessage,
    group: String,
    state: AckState,
    committer: Arc<dyn KafkaCommitter>,
}

impl KafkaMessage {
    fn new(native: OwnedMessage, group: String, committer: Arc<dyn KafkaCommitter>) -> Self {
        Self {
            native,
            group,
            state: AckState::new(),
            committer,
        }
    }
}

#[async_trait]
impl Message for KafkaMessage {
    fn body(&self) -> &[u8] {
        self.native.payload().unwrap_or(&[])
    }

    fn key(&self) -> Option<&[u8]> {
        self.native.key()
    }

    fn headers(&self) -> Vec<Header> {
        match self.native.headers() {
            Some(headers) => headers
                .iter()
                .map(|h| Header::new(h.key, h.value.unwrap_or(&[]).to_vec()))
                .collect(),
            None => Vec::new(),
        }
    }

    fn topic(&self) -> Option<String> {
        Some(self.native.topic().to_string())
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.native
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis)
    }

    async fn ack(&self) -> MessagingResult<()> {
        if !self.state.try_respond() {
            return Ok(());
        }
        self.committer
            .commit(
                self.native.topic(),
                self.native.partition(),
                self.native.offset() + 1,
            )
            .await
    }

    fn as_nackable(&self) -> Option<&dyn Nackable> {
        Some(self)
    }

    fn as_metadata(&self) -> Option<&dyn MetadataCarrier> {
        Some(self)
    }
}

#[async_trait]
impl Nackable for KafkaMessage {
    /// Kafka has no negative-ack wire operation: not committing is the
    /// nack. This only claims the response flag so nothing commits the
    /// offset later; redelivery happens on restart or rebalance.
    async fn nack(&self) -> MessagingResult<()> {
        self.state.try_respond();
        Ok(())
    }
}

impl MetadataCarrier for KafkaMessage {
    fn metadata(&self) -> HashMap<String, serde_json::Value> {
        HashMap::from([
            ("partition".to_string(), serde_json::json!(self.native.partition())),
            ("offset".to_string(), serde_json::json!(self.native.offset())),
            ("group".to_string(), serde_json::json!(self.group)),
        ])
    }
}

fn base_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("client.id", &config.client_id);

    if config.enable_sasl {
        if let (Some(mechanism), Some(username), Some(password)) = (
            &config.sasl_mechanism,
            &config.sasl_username,
            &config.sasl_password,
        ) {
            client_config
                .set("security.protocol", "SASL_SSL")
                .set("sasl.mechanism", mechanism)
                .set("sasl.username", username)
                .set("sasl.password", password);
        }
    } else if config.enable_ssl {
        client_config.set("security.protocol", "ssl");
    }

    client_config
}

/// Kafka-backed messaging client.
pub struct KafkaMessaging {
    config: KafkaConfig,
    producer: Mutex<Option<FutureProducer>>,
    registry: ConsumerRegistry,
}

impl KafkaMessaging {
    /// Create a new Kafka client. Connections are established lazily on
    /// first use.
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            producer: Mutex::new(None),
            registry: ConsumerRegistry::new(BACKEND),
        }
    }

    async fn producer(&self) -> MessagingResult<FutureProducer> {
        let mut slot = self.producer.lock().await;
        if let Some(producer) = slot.as_ref() {
            return Ok(producer.clone());
        }
        let producer: FutureProducer = base_client_config(&self.config)
            .set("message.timeout.ms", self.config.message_timeout_ms.to_string())
            .create()
            .map_err(|e| {
                MessagingError::ConnectionFailed(format!("kafka producer creation failed: {e}"))
            })?;
        *slot = Some(producer.clone());
        Ok(producer)
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
                "kafka does not support deferred delivery".to_string(),
            ));
        }

        let producer = self.producer().await?;

        // The record key prefers the explicit partitioning key and falls
        // back to the ordering key, which gives per-key ordering through
        // keyed partitioning.
        let key_bytes = message
            .key
            .clone()
            .or_else(|| message.ordering_key.as_ref().map(|k| k.clone().into_bytes()));

        let mut headers = OwnedHeaders::new();
        for header in &message.headers {
            headers = headers.insert(KafkaHeader {
                key: &header.key,
                value: Some(&header.value),
            });
        }
        for (key, value) in &message.attributes {
            headers = headers.insert(KafkaHeader {
                key,
                value: Some(value.as_bytes()),
            });
        }

        let mut record: FutureRecord<'_, Vec<u8>, Vec<u8>> =
            FutureRecord::to(destination).payload(&message.body);
        if let Some(key) = &key_bytes {
            record = record.key(key);
        }
        if !message.headers.is_empty() || !message.attributes.is_empty() {
            record = record.headers(headers);
        }

        let timer = MESSAGING_METRICS
            .publish_latency
            .with_label_values(&[destination, BACKEND])
            .start_timer();

        let (partition, offset) = producer
            .send(record, Duration::from_millis(self.config.message_timeout_ms))
            .await
            .map_err(|(e, _)| MessagingError::PublishFailed(format!("kafka publish failed: {e}")))?;

        timer.observe_duration();
        MESSAGING_METRICS
            .messages_published
            .with_label_values(&[destination, BACKEND])
            .inc();

        Ok(PublishResult {
            topic: destination.to_string(),
            partition: Some(partition),
            offset: Some(offset),
            ..Default::default()
        })
    }
}

/// One worker: drain the feed, commit on success, escalate the first
/// handler error and stop the whole consume call.
async fn run_worker(
    feed: Arc<Mutex<mpsc::Receiver<KafkaMessage>>>,
    handler: Arc<dyn Handler>,
    auto_ack: bool,
    topic: String,
    stop: CancellationToken,
    errors: mpsc::Sender<MessagingError>,
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
                        tracing::warn!(topic = %topic, error = %e, "kafka commit failed");
                    }
                }
            }
            Err(e) => {
                MESSAGING_METRICS
                    .handler_failures
                    .with_label_values(&[&topic, BACKEND, handler_failure_kind(&e)])
                    .inc();
                tracing::warn!(topic = %topic, error = %e, "kafka handler failed, stopping consumer");
                // Responded-but-uncommitted: the offset stays put so the
                // message comes back after restart or rebalance.
                message.state.try_respond();
                let _ = errors.try_send(e);
                stop.cancel();
                break;
            }
        }
    }
}

#[async_trait]
impl Publisher for KafkaMessaging {
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
impl Consumer for KafkaMessaging {
    async fn consume(
        &self,
        source: &str,
        handler: Arc<dyn Handler>,
        cancel: CancellationToken,
        options: ConsumeOptions,
    ) -> MessagingResult<()> {
        require_nonempty("source", source)?;
        let group = options.group.clone().unwrap_or_default();
        require_nonempty("group", &group)?;
        self.registry.ensure_open()?;

        if cancel.is_cancelled() {
            return Ok(());
        }

        let (token, guard) = self.registry.register(&cancel)?;

        let consumer: StreamConsumer = {
            let mut client_config = base_client_config(&self.config);
            client_config
                .set("group.id", &group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.config.auto_offset_reset)
                .set("session.timeout.ms", self.config.session_timeout_ms.to_string());
            client_config.create().map_err(|e| {
                MessagingError::ConnectionFailed(format!("kafka consumer creation failed: {e}"))
            })?
        };
        let consumer = Arc::new(consumer);

        consumer.subscribe(&[source]).map_err(|e| {
            MessagingError::SubscribeFailed(format!("kafka subscribe failed: {e}"))
        })?;

        let committer: Arc<dyn KafkaCommitter> = Arc::new(StreamCommitter {
            consumer: Arc::clone(&consumer),
        });

        let workers = options.workers();
        let auto_ack = options.effective_auto_ack();
        tracing::info!(topic = %source, group = %group, workers, "kafka consumer starting");

        // Rendezvous-style feed: the fetch task holds at most one record
        // beyond what the workers are processing.
        let (tx, rx) = mpsc::channel::<KafkaMessage>(1);
        let rx = Arc::new(Mutex::new(rx));
        let (err_tx, mut err_rx) = mpsc::channel::<MessagingError>(1);

        let mut worker_tasks = Vec::with_capacity(workers);
        for _ in 0..workers {
            worker_tasks.push(tokio::spawn(run_worker(
                Arc::clone(&rx),
                Arc::clone(&handler),
                auto_ack,
                source.to_string(),
                token.clone(),
                err_tx.clone(),
            )));
        }

        let fetch_consumer = Arc::clone(&consumer);
        let fetch_token = token.clone();
        let fetch_group = group.clone();
        let fetch_err_tx = err_tx.clone();
        let fetch = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = fetch_token.cancelled() => break,
                    fetched = fetch_consumer.recv() => match fetched {
                        Ok(borrowed) => {
                            let message = KafkaMessage::new(
                                borrowed.detach(),
                                fetch_group.clone(),
                                Arc::clone(&committer),
                            );
                            if tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = fetch_err_tx.try_send(MessagingError::ConsumeFailed(
                                format!("kafka fetch failed: {e}"),
                            ));
                            fetch_token.cancel();
                            break;
                        }
                    },
                }
            }
            // Dropping the sender lets the workers drain and exit.
        });
        drop(err_tx);

        let _ = fetch.await;
        for task in worker_tasks {
            let _ = task.await;
        }
        consumer.unsubscribe();
        drop(guard);

        let result = match err_rx.try_recv() {
            Ok(e) => Err(e),
            Err(_) => Ok(()),
        };
        if let Err(e) = &result {
            MESSAGING_METRICS
                .consume_failures
                .with_label_values(&[source, BACKEND, e.kind()])
                .inc();
        }
        tracing::info!(topic = %source, group = %group, "kafka consumer stopped");
        result
    }
}

#[async_trait]
impl Closer for KafkaMessaging {
    async fn close(&self) -> MessagingResult<()> {
        if self.registry.is_closed() {
            return Ok(());
        }
        self.registry.shut_down().await;
        // The producer flushes outstanding deliveries on drop.
        self.producer.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use rdkafka::Timestamp;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Default)]
    struct FakeCommitter {
        commits: parking_lot::Mutex<Vec<(String, i32, i64)>>,
    }

    #[async_trait]
    impl KafkaCommitter for FakeCommitter {
        async fn commit(&self, topic: &str, partition: i32, offset: i64) -> MessagingResult<()> {
            self.commits.lock().push((topic.to_string(), partition, offset));
            Ok(())
        }
    }

    fn fake_message(offset: i64, committer: &Arc<FakeCommitter>) -> KafkaMessage {
        let native = OwnedMessage::new(
            Some(format!("payload-{offset}").into_bytes()),
            Some(b"user-1".to_vec()),
            "user.created".to_string(),
            Timestamp::CreateTime(1_700_000_000_000),
            0,
            offset,
            None,
        );
        KafkaMessage::new(
            native,
            "notifier".to_string(),
            Arc::clone(committer) as Arc<dyn KafkaCommitter>,
        )
    }

    #[tokio::test]
    async fn test_ack_commits_one_past_the_offset() {
        let committer = Arc::new(FakeCommitter::default());
        let message = fake_message(41, &committer);

        message.ack().await.unwrap();
        assert_eq!(
            committer.commits.lock().as_slice(),
            &[("user.created".to_string(), 0, 42)]
        );
    }

    #[tokio::test]
    async fn test_nack_never_touches_the_broker() {
        let committer = Arc::new(FakeCommitter::default());
        let message = fake_message(7, &committer);

        message.as_nackable().unwrap().nack().await.unwrap();
        // The nack claimed the response, so a later ack is a no-op too.
        message.ack().await.unwrap();
        assert!(committer.commits.lock().is_empty());
    }

    #[tokio::test]
    async fn test_ack_twice_commits_once() {
        let committer = Arc::new(FakeCommitter::default());
        let message = fake_message(3, &committer);

        message.ack().await.unwrap();
        message.ack().await.unwrap();
        assert_eq!(committer.commits.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_headers_keep_duplicate_keys() {
        let headers = OwnedHeaders::new()
            .insert(KafkaHeader { key: "trace", value: Some(b"a".as_slice()) })
            .insert(KafkaHeader { key: "trace", value: Some(b"b".as_slice()) });
        let native = OwnedMessage::new(
            Some(b"x".to_vec()),
            None,
            "user.created".to_string(),
            Timestamp::NotAvailable,
            0,
            1,
            Some(headers),
        );
        let committer = Arc::new(FakeCommitter::default());
        let message = KafkaMessage::new(
            native,
            "notifier".to_string(),
            Arc::clone(&committer) as Arc<dyn KafkaCommitter>,
        );

        let headers = Message::headers(&message);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].key, "trace");
        assert_eq!(headers[0].value_str(), "a");
        assert_eq!(headers[1].value_str(), "b");
    }

    #[tokio::test]
    async fn test_metadata_exposes_partition_offset_group() {
        let committer = Arc::new(FakeCommitter::default());
        let message = fake_message(12, &committer);
        let metadata = message.as_metadata().unwrap().metadata();
        assert_eq!(metadata.get("offset"), Some(&serde_json::json!(12)));
        assert_eq!(metadata.get("group"), Some(&serde_json::json!("notifier")));
    }

    /// Handler fails exactly on the fifth message: offsets for the first
    /// four are committed, the fifth stays uncommitted, and the error is
    /// escalated while the shared stop token fires.
    #[tokio::test]
    async fn test_worker_stops_on_fifth_message_failure() {
        let committer = Arc::new(FakeCommitter::default());
        let (tx, rx) = mpsc::channel(1);
        let rx = Arc::new(Mutex::new(rx));
        let (err_tx, mut err_rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let handler = handler_fn(|msg| async move {
            if msg.body() == b"payload-5" {
                return Err(anyhow::anyhow!("validation failed"));
            }
            Ok(())
        });

        let worker = tokio::spawn(run_worker(
            rx,
            handler,
            true,
            "user.created".into(),
            stop.clone(),
            err_tx,
        ));

        let feeder = {
            let committer = Arc::clone(&committer);
            tokio::spawn(async move {
                for offset in 1..=5 {
                    if tx.send(fake_message(offset, &committer)).await.is_err() {
                        break;
                    }
                }
            })
        };

        timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
        feeder.await.unwrap();

        let commits = committer.commits.lock().clone();
        let offsets: Vec<i64> = commits.iter().map(|(_, _, o)| *o).collect();
        assert_eq!(offsets, vec![2, 3, 4, 5]);
        assert!(stop.is_cancelled());
        let err = err_rx.try_recv().expect("first error must be captured");
        assert!(matches!(err, MessagingError::Handler(_)));
    }

    #[tokio::test]
    async fn test_worker_panic_escalates_like_error() {
        let committer = Arc::new(FakeCommitter::default());
        let (tx, rx) = mpsc::channel(1);
        let rx = Arc::new(Mutex::new(rx));
        let (err_tx, mut err_rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let handler = handler_fn(|_msg| async { panic!("poisoned record") });

        let worker = tokio::spawn(run_worker(
            rx,
            handler,
            true,
            "user.created".into(),
            stop.clone(),
            err_tx,
        ));
        tx.send(fake_message(1, &committer)).await.unwrap();
        drop(tx);
        timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();

        assert!(committer.commits.lock().is_empty());
        assert!(stop.is_cancelled());
        assert!(matches!(
            err_rx.try_recv().unwrap(),
            MessagingError::HandlerPanic(_)
        ));
    }

    #[tokio::test]
    async fn test_publish_with_delay_is_unsupported() {
        let messaging = KafkaMessaging::new(KafkaConfig::default());
        let err = messaging
            .publish(
                "user.created",
                OutgoingMessage::new("x").with_delay(Duration::from_secs(30)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Unsupported(_)));
        // Rejected before the lazy producer was ever built.
        assert!(messaging.producer.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_empty_destination_is_rejected() {
        let messaging = KafkaMessaging::new(KafkaConfig::default());
        let err = messaging
            .publish("", OutgoingMessage::new("x"))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_consume_requires_group() {
        let messaging = KafkaMessaging::new(KafkaConfig::default());
        let handler = handler_fn(|_msg| async { Ok(()) });
        let err = messaging
            .consume(
                "user.created",
                handler,
                CancellationToken::new(),
                ConsumeOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("group"));
    }

    #[tokio::test]
    async fn test_consume_with_cancelled_token_returns_ok() {
        let messaging = KafkaMessaging::new(KafkaConfig::default());
        let handler = handler_fn(|_msg| async { Ok(()) });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = messaging
            .consume(
                "user.created",
                handler,
                cancel,
                ConsumeOptions::new().with_group("notifier"),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_further_use() {
        let messaging = KafkaMessaging::new(KafkaConfig::default());
        messaging.close().await.unwrap();
        messaging.close().await.unwrap();

        let err = messaging
            .publish("user.created", OutgoingMessage::new("x"))
            .await
            .unwrap_err();
        assert!(err.is_closed());
    }
}
