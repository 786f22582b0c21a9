/// Metrics and telemetry for the eventhook engine
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - Events enqueued and consumed
/// - Distribution items fanned out per subscription
/// - Callback deliveries, failures and latencies
/// - Degraded ordering (wait timeouts) and lock contention
/// - Worker restarts and active distributors

use crate::distribution::SequenceScope;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // ========== Event Stream Metrics ==========

    /// Events pushed on the global queue by event type
    pub static ref EVENTS_ENQUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "eventhook_events_enqueued_total",
        "Total number of events enqueued on the global queue",
        &["event_type"]
    )
    .unwrap();

    /// Events popped by the sequential consumer by outcome
    pub static ref EVENTS_CONSUMED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "eventhook_events_consumed_total",
        "Total number of events popped by the sequential consumer",
        &["outcome"]
    )
    .unwrap();

    /// Distribution items created per subscription
    pub static ref DISTRIBUTIONS_CREATED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "eventhook_distributions_created_total",
        "Total number of distribution items fanned out",
        &["subscription_id"]
    )
    .unwrap();

    // ========== Delivery Metrics ==========

    /// Callback attempts per subscription
    pub static ref DELIVERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "eventhook_deliveries_total",
        "Total number of callback deliveries attempted",
        &["subscription_id"]
    )
    .unwrap();

    /// Failed callbacks per subscription and reason
    pub static ref DELIVERIES_FAILED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "eventhook_deliveries_failed_total",
        "Total number of callback deliveries that failed",
        &["subscription_id", "reason"]
    )
    .unwrap();

    /// Callback latency in seconds
    pub static ref DELIVERY_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "eventhook_delivery_duration_seconds",
        "Callback delivery latencies in seconds",
        &["subscription_id"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();

    // ========== Ordering Metrics ==========

    /// Predecessor waits that hit the timeout
    pub static ref ORDERING_TIMEOUTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "eventhook_ordering_timeouts_total",
        "Total number of waits on a previous sequence that timed out",
        &["scope"]
    )
    .unwrap();

    /// Running marker acquisitions that found the marker already held
    pub static ref LOCK_CONTENTION_TOTAL: IntCounterVec = register_int_counter_vec!(
        "eventhook_lock_contention_total",
        "Total number of sequence numbers skipped because another worker held them",
        &["scope"]
    )
    .unwrap();

    // ========== Worker Metrics ==========

    /// Worker restarts after a panic
    pub static ref WORKER_RESTARTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "eventhook_worker_restarts_total",
        "Total number of worker restarts after a panic",
        &["worker"]
    )
    .unwrap();

    /// Live per-subscription distributors
    pub static ref ACTIVE_DISTRIBUTORS: IntGauge = register_int_gauge!(
        "eventhook_active_distributors",
        "Number of per-subscription distributors currently running"
    )
    .unwrap();
}

/// Render all metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

fn scope_kind(scope: &SequenceScope) -> &'static str {
    match scope {
        SequenceScope::Events => "events",
        SequenceScope::Distribution(_) => "distribution",
    }
}

/// Record an event pushed on the global queue
pub fn record_event_enqueued(event_type: &str) {
    EVENTS_ENQUEUED_TOTAL.with_label_values(&[event_type]).inc();
}

/// Record an event popped by the consumer ("fanned_out", "skipped", "dropped")
pub fn record_event_consumed(outcome: &str) {
    EVENTS_CONSUMED_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a distribution item pushed on a subscription queue
pub fn record_distribution_created(subscription_id: i64) {
    DISTRIBUTIONS_CREATED_TOTAL
        .with_label_values(&[&subscription_id.to_string()])
        .inc();
}

/// Record a callback attempt
pub fn record_delivery(subscription_id: i64) {
    DELIVERIES_TOTAL
        .with_label_values(&[&subscription_id.to_string()])
        .inc();
}

/// Record a failed callback ("build", "transport", "confirm")
pub fn record_delivery_failure(subscription_id: i64, reason: &str) {
    DELIVERIES_FAILED_TOTAL
        .with_label_values(&[&subscription_id.to_string(), reason])
        .inc();
}

/// Record callback latency
pub fn record_delivery_duration(subscription_id: i64, duration: f64) {
    DELIVERY_DURATION_SECONDS
        .with_label_values(&[&subscription_id.to_string()])
        .observe(duration);
}

/// Record a predecessor wait that hit its timeout
pub fn record_ordering_timeout(scope: &SequenceScope) {
    ORDERING_TIMEOUTS_TOTAL
        .with_label_values(&[scope_kind(scope)])
        .inc();
}

/// Record a running marker already held by another worker
pub fn record_lock_contention(scope: &SequenceScope) {
    LOCK_CONTENTION_TOTAL
        .with_label_values(&[scope_kind(scope)])
        .inc();
}

/// Record a worker restart
pub fn record_worker_restart(worker: &str) {
    WORKER_RESTARTS_TOTAL.with_label_values(&[worker]).inc();
}

/// Total callback attempts recorded for a subscription
pub fn delivery_count(subscription_id: i64) -> u64 {
    DELIVERIES_TOTAL
        .with_label_values(&[&subscription_id.to_string()])
        .get()
}

/// Failed callbacks recorded for a subscription across all reasons
pub fn delivery_failure_count(subscription_id: i64) -> u64 {
    let id = subscription_id.to_string();
    ["build", "transport", "confirm"]
        .iter()
        .map(|reason| {
            DELIVERIES_FAILED_TOTAL
                .with_label_values(&[&id, reason])
                .get()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_delivery_counters() {
        record_delivery(90_001);
        record_delivery(90_001);
        record_delivery_failure(90_001, "confirm");

        assert_eq!(delivery_count(90_001), 2);
        assert_eq!(delivery_failure_count(90_001), 1);
    }

    #[test]
    fn test_record_ordering_metrics() {
        record_ordering_timeout(&SequenceScope::Events);
        record_lock_contention(&SequenceScope::Distribution(4));
        let metrics = render_metrics();
        assert!(metrics.contains("eventhook_ordering_timeouts_total"));
        assert!(metrics.contains("eventhook_lock_contention_total"));
    }

    #[test]
    fn test_metrics_rendering() {
        record_event_enqueued("hostcreate");
        record_event_consumed("fanned_out");
        record_distribution_created(90_002);
        record_delivery_duration(90_002, 0.05);

        let metrics = render_metrics();
        assert!(metrics.contains("# HELP"));
        assert!(metrics.contains("eventhook_events_enqueued_total"));
        assert!(metrics.contains("eventhook_distributions_created_total"));
        assert!(metrics.contains("eventhook_delivery_duration_seconds"));
    }
}
