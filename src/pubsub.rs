//! Google Cloud Pub/Sub adapter
//!
//! Publishing goes through per-topic publishers that are created on first
//! use and cached. Consuming delegates fan-out to the client library's
//! streaming pull: `concurrency` maps to its worker count and
//! `max_in_flight` to its outstanding-message cap, so there is no
//! adapter-owned worker pool here. Ack deadlines are extended by the
//! client library while a handler runs, which is why the wrapper exposes
//! no manual lease extension.
//!
//! Pub/Sub carries string attributes rather than byte headers: ordered
//! headers collapse to last-value-wins on publish, with explicit
//! attributes taking precedence.

use crate::config::PubsubConfig;
use crate::envelope::{OutgoingMessage, PublishResult};
use crate::error::{MessagingError, MessagingResult};
use crate::handler::Handler;
use crate::message::{AckState, Message, MetadataCarrier, Nackable, RawCarrier};
use crate::metrics::{handler_failure_kind, MESSAGING_METRICS};
use crate::options::ConsumeOptions;
use crate::recover::invoke_handler;
use crate::registry::ConsumerRegistry;
use crate::traits::{require_nonempty, Closer, Consumer, Publisher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_cloud_googleapis::pubsub::v1::PubsubMessage;
use google_cloud_pubsub::client::{Client, ClientConfig};
use google_cloud_pubsub::publisher::Publisher as TopicPublisher;
use google_cloud_pubsub::subscriber::{ReceivedMessage, SubscriberConfig};
use google_cloud_pubsub::subscription::ReceiveConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const BACKEND: &str = "google-pubsub";

/// Pub/Sub delivery adapted to the [`Message`] contract.
pub struct GcpPubsubMessage {
    native: ReceivedMessage,
    source: String,
    subscription: String,
    state: AckState,
}

#[async_trait]
impl Message for GcpPubsubMessage {
    fn body(&self) -> &[u8] {
        &self.native.message.data
    }

    fn attributes(&self) -> HashMap<String, String> {
        self.native.message.attributes.clone()
    }

    fn id(&self) -> Option<String> {
        Some(self.native.message.message_id.clone())
    }

    fn topic(&self) -> Option<String> {
        Some(self.source.clone())
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.native
            .message
            .publish_time
            .as_ref()
            .and_then(|t| DateTime::from_timestamp(t.seconds, t.nanos as u32))
    }

    async fn ack(&self) -> MessagingResult<()> {
        if !self.state.try_respond() {
            return Ok(());
        }
        self.native
            .ack()
            .await
            .map_err(|e| MessagingError::AckFailed(format!("pubsub ack failed: {e}")))
    }

    fn as_nackable(&self) -> Option<&dyn Nackable> {
        Some(self)
    }

    fn as_metadata(&self) -> Option<&dyn MetadataCarrier> {
        Some(self)
    }

    fn as_raw(&self) -> Option<&dyn RawCarrier> {
        Some(self)
    }
}

#[async_trait]
impl Nackable for GcpPubsubMessage {
    async fn nack(&self) -> MessagingResult<()> {
        if !self.state.try_respond() {
            return Ok(());
        }
        self.native
            .nack()
            .await
            .map_err(|e| MessagingError::AckFailed(format!("pubsub nack failed: {e}")))
    }
}

impl MetadataCarrier for GcpPubsubMessage {
    fn metadata(&self) -> HashMap<String, serde_json::Value> {
        HashMap::from([
            ("subscription".to_string(), serde_json::json!(self.subscription)),
            ("ordering_key".to_string(), serde_json::json!(self.native.message.ordering_key)),
        ])
    }
}

impl RawCarrier for GcpPubsubMessage {
    fn raw(&self) -> &(dyn std::any::Any + Send + Sync) {
        &self.native
    }
}

/// Pub/Sub carries string attributes only: ordered headers collapse to
/// last-value-wins, then explicit attributes override.
fn collapse_attributes(message: &OutgoingMessage) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for header in &message.headers {
        out.insert(header.key.clone(), header.value_str());
    }
    for (key, value) in &message.attributes {
        out.insert(key.clone(), value.clone());
    }
    out
}

fn to_pubsub_message(message: &OutgoingMessage) -> PubsubMessage {
    PubsubMessage {
        data: message.body.clone().into(),
        attributes: collapse_attributes(message),
        ordering_key: message.ordering_key.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// How `source` maps to a subscription: an explicit `subscription` option
/// wins (then `source` is just the topic name), a `group` doubles as the
/// subscription name, and with neither `source` itself is the
/// subscription.
fn resolve_subscription<'a>(source: &'a str, options: &'a ConsumeOptions) -> &'a str {
    if let Some(subscription) = options.subscription.as_deref() {
        if !subscription.trim().is_empty() {
            return subscription;
        }
    }
    if let Some(group) = options.group.as_deref() {
        if !group.trim().is_empty() {
            return group;
        }
    }
    source
}

async fn process_delivery(
    native: ReceivedMessage,
    handler: Arc<dyn Handler>,
    auto_ack: bool,
    source: String,
    subscription: String,
) {
    MESSAGING_METRICS
        .messages_consumed
        .with_label_values(&[&source, BACKEND])
        .inc();

    let message = Arc::new(GcpPubsubMessage {
        native,
        source: source.clone(),
        subscription,
        state: AckState::new(),
    });

    match invoke_handler(&handler, Arc::clone(&message) as Arc<dyn Message>).await {
        Ok(()) => {
            if auto_ack && !message.state.responded() {
                if let Err(e) = message.ack().await {
                    tracing::warn!(topic = %source, error = %e, "pubsub ack failed");
                }
            }
        }
        Err(e) => {
            MESSAGING_METRICS
                .handler_failures
                .with_label_values(&[&source, BACKEND, handler_failure_kind(&e)])
                .inc();
            tracing::warn!(topic = %source, error = %e, "pubsub handler failed");
            if auto_ack && !message.state.responded() {
                if let Err(e) = message.nack().await {
                    tracing::warn!(topic = %source, error = %e, "pubsub nack failed");
                }
            }
        }
    }
}

/// Google Cloud Pub/Sub messaging client.
pub struct GcpPubsubMessaging {
    client: Client,
    publishers: Mutex<HashMap<String, TopicPublisher>>,
    registry: ConsumerRegistry,
}

impl GcpPubsubMessaging {
    /// Create a new Pub/Sub client.
    ///
    /// With an endpoint override the client talks to it unauthenticated
    /// (emulators); otherwise application-default credentials are resolved
    /// here and the call fails without them.
    pub async fn connect(config: PubsubConfig) -> MessagingResult<Self> {
        let mut client_config = ClientConfig::default();
        if !config.project_id.is_empty() {
            client_config.project_id = Some(config.project_id.clone());
        }
        let client_config = match &config.endpoint {
            Some(endpoint) => {
                client_config.endpoint = endpoint.clone();
                client_config
            }
            None => client_config.with_auth().await.map_err(|e| {
                MessagingError::ConnectionFailed(format!("pubsub auth failed: {e}"))
            })?,
        };

        let client = Client::new(client_config)
            .await
            .map_err(|e| MessagingError::ConnectionFailed(format!("pubsub connection failed: {e}")))?;

        Ok(Self {
            client,
            publishers: Mutex::new(HashMap::new()),
            registry: ConsumerRegistry::new(BACKEND),
        })
    }

    async fn publisher_for(&self, topic_id: &str) -> TopicPublisher {
        let mut cache = self.publishers.lock().await;
        if let Some(existing) = cache.get(topic_id) {
            return existing.clone();
        }
        let publisher = self.client.topic(topic_id).new_publisher(None);
        cache.insert(topic_id.to_string(), publisher.clone());
        publisher
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
                "google pubsub does not support per-message delivery delay".to_string(),
            ));
        }

        let timer = MESSAGING_METRICS
            .publish_latency
            .with_label_values(&[destination, BACKEND])
            .start_timer();

        let publisher = self.publisher_for(destination).await;
        let awaiter = publisher.publish(to_pubsub_message(&message)).await;
        let message_id = awaiter
            .get()
            .await
            .map_err(|e| MessagingError::PublishFailed(format!("pubsub publish failed: {e}")))?;

        timer.observe_duration();
        MESSAGING_METRICS
            .messages_published
            .with_label_values(&[destination, BACKEND])
            .inc();

        Ok(PublishResult {
            message_id: Some(message_id),
            ..PublishResult::for_topic(destination)
        })
    }
}

#[async_trait]
impl Publisher for GcpPubsubMessaging {
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
impl Consumer for GcpPubsubMessaging {
    async fn consume(
        &self,
        source: &str,
        handler: Arc<dyn Handler>,
        cancel: CancellationToken,
        options: ConsumeOptions,
    ) -> MessagingResult<()> {
        require_nonempty("source", source)?;
        self.registry.ensure_open()?;

        if cancel.is_cancelled() {
            return Ok(());
        }

        let subscription_id = resolve_subscription(source, &options).to_string();
        let (token, guard) = self.registry.register(&cancel)?;

        let subscription = self.client.subscription(&subscription_id);
        let receive_config = ReceiveConfig {
            worker_count: options.workers(),
            subscriber_config: Some(SubscriberConfig {
                max_outstanding_messages: options.effective_max_in_flight() as i64,
                ..Default::default()
            }),
            ..Default::default()
        };
        let auto_ack = options.effective_auto_ack();
        tracing::info!(
            topic = %source,
            subscription = %subscription_id,
            workers = options.workers(),
            "pubsub consumer starting"
        );

        let callback = {
            let handler = Arc::clone(&handler);
            let source = source.to_string();
            let subscription_id = subscription_id.clone();
            move |native: ReceivedMessage, _ctx: CancellationToken| {
                let handler = Arc::clone(&handler);
                let source = source.clone();
                let subscription_id = subscription_id.clone();
                async move {
                    process_delivery(native, handler, auto_ack, source, subscription_id).await;
                }
            }
        };

        let result = subscription
            .receive(callback, token.clone(), Some(receive_config))
            .await
            .map_err(|e| MessagingError::ConsumeFailed(format!("pubsub receive failed: {e}")));
        drop(guard);

        if let Err(e) = &result {
            MESSAGING_METRICS
                .consume_failures
                .with_label_values(&[source, BACKEND, e.kind()])
                .inc();
        }
        tracing::info!(topic = %source, subscription = %subscription_id, "pubsub consumer stopped");
        result
    }
}

#[async_trait]
impl Closer for GcpPubsubMessaging {
    async fn close(&self) -> MessagingResult<()> {
        if self.registry.is_closed() {
            return Ok(());
        }
        self.registry.shut_down().await;

        let publishers: Vec<TopicPublisher> = {
            let mut cache = self.publishers.lock().await;
            cache.drain().map(|(_, publisher)| publisher).collect()
        };
        // Shutdown flushes each publisher's batch queue before dropping it.
        for mut publisher in publishers {
            publisher.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_subscription_prefers_explicit_option() {
        let options = ConsumeOptions {
            subscription: Some("user-events-sub".to_string()),
            group: Some("notifications".to_string()),
            ..Default::default()
        };
        assert_eq!(resolve_subscription("user-events", &options), "user-events-sub");
    }

    #[test]
    fn test_resolve_subscription_falls_back_to_group() {
        let options = ConsumeOptions {
            group: Some("notifications".to_string()),
            ..Default::default()
        };
        assert_eq!(resolve_subscription("user-events", &options), "notifications");
    }

    #[test]
    fn test_resolve_subscription_defaults_to_source() {
        let options = ConsumeOptions::default();
        assert_eq!(resolve_subscription("user-events-sub", &options), "user-events-sub");

        let blank = ConsumeOptions {
            subscription: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(resolve_subscription("user-events-sub", &blank), "user-events-sub");
    }

    #[test]
    fn test_attributes_collapse_headers_last_value_wins() {
        let message = OutgoingMessage::new("x")
            .with_header("trace", b"a".to_vec())
            .with_header("trace", b"b".to_vec())
            .with_header("tenant", b"t1".to_vec());

        let attributes = collapse_attributes(&message);
        assert_eq!(attributes.get("trace").map(String::as_str), Some("b"));
        assert_eq!(attributes.get("tenant").map(String::as_str), Some("t1"));
    }

    #[test]
    fn test_attributes_override_collapsed_headers() {
        let message = OutgoingMessage::new("x")
            .with_header("tenant", b"from-header".to_vec())
            .with_attribute("tenant", "from-attribute");

        let attributes = collapse_attributes(&message);
        assert_eq!(
            attributes.get("tenant").map(String::as_str),
            Some("from-attribute")
        );
    }

    #[test]
    fn test_outgoing_message_maps_to_pubsub_fields() {
        let message = OutgoingMessage::new(b"evt".to_vec())
            .with_attribute("source", "api")
            .with_ordering_key("tenant-1");

        let mapped = to_pubsub_message(&message);
        assert_eq!(&mapped.data[..], b"evt".as_slice());
        assert_eq!(mapped.ordering_key, "tenant-1");
        assert_eq!(mapped.attributes.get("source").map(String::as_str), Some("api"));
    }

    #[test]
    fn test_outgoing_message_without_ordering_key_is_unordered() {
        let mapped = to_pubsub_message(&OutgoingMessage::new("evt"));
        assert!(mapped.ordering_key.is_empty());
    }
}
