//! Driver selection
//!
//! Configuration names its backend with a driver string; [`connect`]
//! resolves the string to the matching adapter and hands back the unified
//! [`Messaging`] handle.

use crate::config::MessagingConfig;
use crate::error::{MessagingError, MessagingResult};
use crate::kafka::KafkaMessaging;
use crate::metrics::init_messaging_metrics;
use crate::nats::NatsMessaging;
use crate::nsq::NsqMessaging;
use crate::pubsub::GcpPubsubMessaging;
use crate::traits::Messaging;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Driver {
    /// NSQ (`"nsq"`)
    Nsq,
    /// Apache Kafka (`"kafka"`)
    Kafka,
    /// Core NATS (`"nats"`)
    Nats,
    /// Google Cloud Pub/Sub (`"google-pubsub"`)
    GooglePubsub,
}

impl Driver {
    /// Canonical configuration string for this driver.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nsq => "nsq",
            Self::Kafka => "kafka",
            Self::Nats => "nats",
            Self::GooglePubsub => "google-pubsub",
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Driver {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nsq" => Ok(Self::Nsq),
            "kafka" => Ok(Self::Kafka),
            "nats" => Ok(Self::Nats),
            "google-pubsub" => Ok(Self::GooglePubsub),
            other => Err(MessagingError::UnknownDriver(other.to_string())),
        }
    }
}

/// Build the adapter selected by `config.driver`.
///
/// NSQ and Kafka construct immediately and connect lazily on first use;
/// NATS and Pub/Sub establish their connection here and fail fast.
pub async fn connect(config: MessagingConfig) -> MessagingResult<Arc<dyn Messaging>> {
    init_messaging_metrics();

    let driver: Driver = config.driver.parse()?;
    tracing::info!(driver = %driver, "connecting messaging backend");

    let messaging: Arc<dyn Messaging> = match driver {
        Driver::Nsq => Arc::new(NsqMessaging::new(config.nsq)),
        Driver::Kafka => Arc::new(KafkaMessaging::new(config.kafka)),
        Driver::Nats => Arc::new(NatsMessaging::connect(config.nats).await?),
        Driver::GooglePubsub => Arc::new(GcpPubsubMessaging::connect(config.pubsub).await?),
    };

    Ok(messaging)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_parses_canonical_names() {
        assert_eq!("nsq".parse::<Driver>().unwrap(), Driver::Nsq);
        assert_eq!("kafka".parse::<Driver>().unwrap(), Driver::Kafka);
        assert_eq!("nats".parse::<Driver>().unwrap(), Driver::Nats);
        assert_eq!("google-pubsub".parse::<Driver>().unwrap(), Driver::GooglePubsub);
        assert_eq!("  KAFKA ".parse::<Driver>().unwrap(), Driver::Kafka);
    }

    #[test]
    fn test_unknown_driver_is_distinguished() {
        let err = "rabbitmq".parse::<Driver>().unwrap_err();
        assert!(matches!(err, MessagingError::UnknownDriver(ref name) if name == "rabbitmq"));
        assert_eq!(err.kind(), "unknown_driver");
    }

    #[test]
    fn test_driver_display_round_trips() {
        for driver in [Driver::Nsq, Driver::Kafka, Driver::Nats, Driver::GooglePubsub] {
            assert_eq!(driver.to_string().parse::<Driver>().unwrap(), driver);
        }
    }

    #[tokio::test]
    async fn test_connect_builds_lazy_backends() {
        let config = MessagingConfig {
            driver: "nsq".to_string(),
            ..Default::default()
        };
        let messaging = connect(config).await;
        assert!(messaging.is_ok());
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_driver() {
        let config = MessagingConfig {
            driver: "zeromq".to_string(),
            ..Default::default()
        };
        let err = connect(config).await.unwrap_err();
        assert!(matches!(err, MessagingError::UnknownDriver(_)));
    }
}
