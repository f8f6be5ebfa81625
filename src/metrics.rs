//! Prometheus metrics for messaging

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec,
};

/// Messaging metrics
pub struct MessagingMetrics {
    /// Messages published counter
    pub messages_published: CounterVec,

    /// Messages consumed counter
    pub messages_consumed: CounterVec,

    /// Message publish failures
    pub publish_failures: CounterVec,

    /// Message consume failures
    pub consume_failures: CounterVec,

    /// Handler failures, split by error vs. panic
    pub handler_failures: CounterVec,

    /// Active consume loops gauge
    pub active_consumers: GaugeVec,

    /// Message publish latency
    pub publish_latency: HistogramVec,
}

lazy_static! {
    pub static ref MESSAGING_METRICS: MessagingMetrics = MessagingMetrics {
        messages_published: register_counter_vec!(
            "messaging_messages_published_total",
            "Total number of messages published",
            &["topic", "backend"]
        )
        .unwrap(),

        messages_consumed: register_counter_vec!(
            "messaging_messages_consumed_total",
            "Total number of messages consumed",
            &["topic", "backend"]
        )
        .unwrap(),

        publish_failures: register_counter_vec!(
            "messaging_publish_failures_total",
            "Total number of publish failures",
            &["topic", "backend", "error"]
        )
        .unwrap(),

        consume_failures: register_counter_vec!(
            "messaging_consume_failures_total",
            "Total number of consume failures",
            &["topic", "backend", "error"]
        )
        .unwrap(),

        handler_failures: register_counter_vec!(
            "messaging_handler_failures_total",
            "Total number of handler failures",
            &["topic", "backend", "kind"]
        )
        .unwrap(),

        active_consumers: register_gauge_vec!(
            "messaging_active_consumers",
            "Number of active consume loops",
            &["backend"]
        )
        .unwrap(),

        publish_latency: register_histogram_vec!(
            "messaging_publish_latency_seconds",
            "Message publish latency in seconds",
            &["topic", "backend"]
        )
        .unwrap(),
    };
}

/// Initialize messaging metrics
pub fn init_messaging_metrics() {
    lazy_static::initialize(&MESSAGING_METRICS);
}

/// Label value for the handler failure counter.
pub(crate) fn handler_failure_kind(err: &crate::error::MessagingError) -> &'static str {
    match err {
        crate::error::MessagingError::HandlerPanic(_) => "panic",
        _ => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        init_messaging_metrics();
        init_messaging_metrics();

        MESSAGING_METRICS
            .messages_published
            .with_label_values(&["user.created", "nats"])
            .inc();
        MESSAGING_METRICS
            .handler_failures
            .with_label_values(&["user.created", "nats", "panic"])
            .inc();

        let published = MESSAGING_METRICS
            .messages_published
            .with_label_values(&["user.created", "nats"])
            .get();
        assert!(published >= 1.0);
    }
}
