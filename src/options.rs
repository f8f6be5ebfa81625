//! Consume options
//!
//! One options struct serves all backends; each adapter reads the fields it
//! understands and validates the ones it requires. `params` is the escape
//! hatch for backend-specific knobs that do not deserve a first-class field.

use std::collections::HashMap;

/// Options governing a single `consume` call.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Number of concurrent handler workers
    pub concurrency: usize,

    /// Acknowledge automatically on handler success, nack on failure
    pub auto_ack: bool,

    /// Consumer group (log-structured backends)
    pub group: Option<String>,

    /// Channel name (queue backends)
    pub channel: Option<String>,

    /// Queue group (subject-based backends)
    pub queue_group: Option<String>,

    /// Subscription name (cloud pub/sub backends)
    pub subscription: Option<String>,

    /// Cap on concurrently unacknowledged messages; 0 means derive from
    /// `concurrency`
    pub max_in_flight: usize,

    /// Free-form backend-specific parameters
    pub params: HashMap<String, String>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            auto_ack: true,
            group: None,
            channel: None,
            queue_group: None,
            subscription: None,
            max_in_flight: 0,
            params: HashMap::new(),
        }
    }
}

impl ConsumeOptions {
    /// Options with defaults: one worker, auto-ack on.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Toggle automatic ack/nack after the handler returns.
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Set the consumer group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the channel name.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Set the queue group.
    pub fn with_queue_group(mut self, queue_group: impl Into<String>) -> Self {
        self.queue_group = Some(queue_group.into());
        self
    }

    /// Set the subscription name.
    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = Some(subscription.into());
        self
    }

    /// Set the in-flight cap.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Set a backend-specific parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Worker count, never below one.
    pub fn workers(&self) -> usize {
        self.concurrency.max(1)
    }

    /// In-flight cap, never below the worker count.
    pub fn effective_max_in_flight(&self) -> usize {
        self.max_in_flight.max(self.workers())
    }

    /// Auto-ack setting, honoring a parseable `auto_ack` params override.
    pub fn effective_auto_ack(&self) -> bool {
        match self.params.get("auto_ack").map(|v| v.parse::<bool>()) {
            Some(Ok(value)) => value,
            _ => self.auto_ack,
        }
    }
}
