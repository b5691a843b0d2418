//! Prometheus metrics instrumentation for lanes.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `lanes_messages_sent_total` - Messages written to the store
//! - `lanes_messages_claimed_total` - Messages claimed by a receiver
//! - `lanes_partitions_skipped_total` - Partitions skipped during a poll
//! - `lanes_messages_acked_total` - Messages finished by a worker, by outcome
//!
//! ## Gauges
//! - `lanes_queue_depth` - Rows per partition and state
//!
//! ## Histograms
//! - `lanes_handle_duration_seconds` - Handler execution time
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for lanes metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `queue_name`, `message_type`.
pub static MESSAGES_SENT_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("lanes_messages_sent_total", "Total number of messages sent");
    CounterVec::new(opts, &["queue_name", "message_type"])
        .expect("lanes_messages_sent_total metric creation failed")
});

/// Labels: `queue_name`, `message_type`.
pub static MESSAGES_CLAIMED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "lanes_messages_claimed_total",
        "Total number of messages claimed by receivers",
    );
    CounterVec::new(opts, &["queue_name", "message_type"])
        .expect("lanes_messages_claimed_total metric creation failed")
});

/// Labels: `reason` (locked, empty, error).
pub static PARTITIONS_SKIPPED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "lanes_partitions_skipped_total",
        "Total number of partitions skipped during polling",
    );
    CounterVec::new(opts, &["reason"])
        .expect("lanes_partitions_skipped_total metric creation failed")
});

/// Labels: `message_type`, `outcome` (acked, retried, dead_lettered).
pub static MESSAGES_ACKED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "lanes_messages_acked_total",
        "Total number of messages finished by workers",
    );
    CounterVec::new(opts, &["message_type", "outcome"])
        .expect("lanes_messages_acked_total metric creation failed")
});

/// Labels: `queue_name`, `state` (ready, delivered, delayed).
pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("lanes_queue_depth", "Current number of rows per partition");
    GaugeVec::new(opts, &["queue_name", "state"])
        .expect("lanes_queue_depth metric creation failed")
});

/// Labels: `message_type`, `outcome`.
pub static HANDLE_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 20).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "lanes_handle_duration_seconds",
        "Message handler duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["message_type", "outcome"])
        .expect("lanes_handle_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(MESSAGES_SENT_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(MESSAGES_CLAIMED_TOTAL.clone()),
        Box::new(PARTITIONS_SKIPPED_TOTAL.clone()),
        Box::new(MESSAGES_ACKED_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(HANDLE_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_message_sent(queue_name: &str, message_type: &str) {
    MESSAGES_SENT_TOTAL
        .with_label_values(&[queue_name, message_type])
        .inc();
}

pub fn record_message_claimed(queue_name: &str, message_type: &str) {
    MESSAGES_CLAIMED_TOTAL
        .with_label_values(&[queue_name, message_type])
        .inc();
}

pub fn record_partition_skipped(reason: &str) {
    PARTITIONS_SKIPPED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_message_finished(message_type: &str, outcome: &str) {
    MESSAGES_ACKED_TOTAL
        .with_label_values(&[message_type, outcome])
        .inc();
}

pub fn set_queue_depth(queue_name: &str, state: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[queue_name, state]).set(depth);
}

pub fn observe_handle_duration(message_type: &str, outcome: &str, duration_secs: f64) {
    HANDLE_DURATION_SECONDS
        .with_label_values(&[message_type, outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
