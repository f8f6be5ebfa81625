//! Broker-agnostic messaging for event-driven services
//!
//! This crate provides one publish/consume contract over four message
//! brokers, so application code binds to a trait object and the broker
//! becomes a deployment decision.
//!
//! # Features
//!
//! - **Single Contract**: `Messaging` = `Publisher` + `Consumer` + `Closer`
//! - **Four Backends**: NSQ, Apache Kafka, core NATS, Google Cloud Pub/Sub
//! - **Worker Pools**: per-consume bounded concurrency with cooperative cancellation
//! - **Panic Containment**: handler panics become errors, never process aborts
//! - **Capability Probing**: nack/extend/metadata exposed only where a broker has them
//! - **Metrics Integration**: Prometheus counters and histograms for monitoring
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              Application Code                    │
//! ├─────────────────────────────────────────────────┤
//! │  - publish()      - consume()      - close()    │
//! └─────────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────────────┐
//! │          Messaging Abstraction                   │
//! ├─────────────────────────────────────────────────┤
//! │  - Publisher / Consumer / Closer traits          │
//! │  - Message + capability traits                   │
//! │  - Handler with panic recovery                   │
//! └─────────────────────────────────────────────────┘
//!      │           │           │           │
//!      ▼           ▼           ▼           ▼
//! ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌───────────┐
//! │   NSQ   │ │  Kafka  │ │  NATS   │ │  Pub/Sub  │
//! ├─────────┤ ├─────────┤ ├─────────┤ ├───────────┤
//! │ queue   │ │ part.   │ │ subject │ │ managed   │
//! │ requeue │ │ log     │ │ fan-out │ │ streaming │
//! │ touch   │ │ commits │ │ queues  │ │ pull      │
//! └─────────┘ └─────────┘ └─────────┘ └───────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use crossmq::{connect, MessagingConfig, OutgoingMessage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MessagingConfig {
//!         driver: "nats".to_string(),
//!         ..Default::default()
//!     };
//!     let messaging = connect(config).await?;
//!
//!     let message = OutgoingMessage::new(br#"{"user_id":42}"#.to_vec())
//!         .with_attribute("event", "user.created");
//!     messaging.publish("user.created", message).await?;
//!
//!     messaging.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! Consuming runs a handler against every delivery until the cancellation
//! token fires or the adapter is closed:
//!
//! ```no_run
//! use crossmq::{connect, handler_fn, ConsumeOptions, MessagingConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let messaging = connect(MessagingConfig::default()).await?;
//! let cancel = CancellationToken::new();
//!
//! let handler = handler_fn(|message| async move {
//!     tracing::info!(bytes = message.body().len(), "delivery received");
//!     Ok(())
//! });
//!
//! let options = ConsumeOptions::new()
//!     .with_concurrency(4)
//!     .with_queue_group("notifier");
//! messaging.consume("user.created", handler, cancel, options).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod kafka;
pub mod message;
pub mod metrics;
pub mod nats;
pub mod nsq;
pub mod options;
pub mod pubsub;
pub mod traits;

mod recover;
mod registry;

pub use config::{KafkaConfig, MessagingConfig, NatsConfig, NsqConfig, PubsubConfig};
pub use driver::{connect, Driver};
pub use envelope::{Header, OutgoingMessage, PublishResult};
pub use error::{MessagingError, MessagingResult};
pub use handler::{handler_fn, Handler, HandlerFn};
pub use kafka::KafkaMessaging;
pub use message::{AckState, Extendable, Message, MetadataCarrier, Nackable, RawCarrier};
pub use metrics::{init_messaging_metrics, MESSAGING_METRICS};
pub use nats::NatsMessaging;
pub use nsq::NsqMessaging;
pub use options::ConsumeOptions;
pub use pubsub::GcpPubsubMessaging;
pub use traits::{Closer, Consumer, Messaging, Publisher};
