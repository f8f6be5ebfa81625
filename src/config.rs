//! Backend configuration
//!
//! Plain deserializable structs; loading them from files or the environment
//! is the embedding application's concern.

use serde::{Deserialize, Serialize};

/// NSQ configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NsqConfig {
    /// nsqd address used for publishing; publishing is disabled when unset
    pub producer_address: Option<String>,

    /// Direct nsqd addresses for consuming
    pub nsqd_addresses: Vec<String>,

    /// nsqlookupd addresses; preferred over direct addresses when non-empty
    pub lookupd_addresses: Vec<String>,
}

impl Default for NsqConfig {
    fn default() -> Self {
        Self {
            producer_address: Some("127.0.0.1:4150".to_string()),
            nsqd_addresses: vec!["127.0.0.1:4150".to_string()],
            lookupd_addresses: Vec::new(),
        }
    }
}

/// Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,

    /// Client ID
    pub client_id: String,

    /// Session timeout in milliseconds
    pub session_timeout_ms: u64,

    /// Producer delivery timeout in milliseconds
    pub message_timeout_ms: u64,

    /// Start position for groups without a committed offset
    /// ("earliest" or "latest")
    pub auto_offset_reset: String,

    /// Enable SASL authentication
    pub enable_sasl: bool,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    /// SASL username
    pub sasl_username: Option<String>,

    /// SASL password
    pub sasl_password: Option<String>,

    /// Enable SSL/TLS
    pub enable_ssl: bool,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "crossmq".to_string(),
            session_timeout_ms: 30000,
            message_timeout_ms: 30000,
            auto_offset_reset: "earliest".to_string(),
            enable_sasl: false,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            enable_ssl: false,
        }
    }
}

/// NATS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URLs
    pub servers: Vec<String>,

    /// Connection name
    pub connection_name: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            connection_name: "crossmq".to_string(),
        }
    }
}

/// Google Cloud Pub/Sub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubsubConfig {
    /// GCP project ID; empty falls back to the client's own resolution
    /// (environment, metadata server)
    pub project_id: String,

    /// Emulator or alternative endpoint; empty uses the production endpoint
    pub endpoint: Option<String>,
}

impl Default for PubsubConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            endpoint: None,
        }
    }
}

/// Main messaging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Driver name: "nsq", "kafka", "nats", or "google-pubsub"
    pub driver: String,

    /// NSQ configuration
    #[serde(default)]
    pub nsq: NsqConfig,

    /// Kafka configuration
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// NATS configuration
    #[serde(default)]
    pub nats: NatsConfig,

    /// Google Cloud Pub/Sub configuration
    #[serde(default)]
    pub pubsub: PubsubConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            driver: "nats".to_string(),
            nsq: NsqConfig::default(),
            kafka: KafkaConfig::default(),
            nats: NatsConfig::default(),
            pubsub: PubsubConfig::default(),
        }
    }
}
