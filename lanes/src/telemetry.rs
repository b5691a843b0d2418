//! Tracing and telemetry instrumentation for lanes.
//!
//! Span constructors for the claim, handle and send paths, and `record_*`
//! helpers that log an event and, with the `metrics` feature, bump the
//! matching Prometheus series.

use std::future::Future;
use tracing::{info_span, Instrument, Span};

use crate::store::QueueSnapshot;

/// Span around one receiver poll of a single partition.
#[must_use]
pub fn claim_span(queue_name: impl AsRef<str>) -> Span {
    info_span!("lanes.claim", queue_name = %queue_name.as_ref())
}

/// Span around handler execution for one claimed message.
#[must_use]
pub fn handle_span(message_id: impl AsRef<str>, message_type: impl AsRef<str>) -> Span {
    info_span!(
        "lanes.handle",
        message_id = %message_id.as_ref(),
        message_type = %message_type.as_ref(),
    )
}

#[must_use]
pub fn send_span(queue_name: impl AsRef<str>, message_type: impl AsRef<str>) -> Span {
    info_span!(
        "lanes.send",
        queue_name = %queue_name.as_ref(),
        message_type = %message_type.as_ref(),
    )
}

/// Attach a handle span to a future.
pub fn instrument_handle<F>(
    message_id: impl AsRef<str>,
    message_type: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(handle_span(message_id, message_type))
}

pub fn record_message_sent(queue_name: impl AsRef<str>, message_type: impl AsRef<str>) {
    tracing::debug!(
        queue_name = %queue_name.as_ref(),
        message_type = %message_type.as_ref(),
        "message sent"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_message_sent(queue_name.as_ref(), message_type.as_ref());
}

pub fn record_message_claimed(queue_name: impl AsRef<str>, message_type: impl AsRef<str>) {
    tracing::debug!(
        queue_name = %queue_name.as_ref(),
        message_type = %message_type.as_ref(),
        "message claimed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_message_claimed(queue_name.as_ref(), message_type.as_ref());
}

/// Reasons: `locked`, `empty`, `error`.
pub fn record_partition_skipped(queue_name: impl AsRef<str>, reason: &'static str) {
    tracing::debug!(queue_name = %queue_name.as_ref(), reason, "partition skipped");

    #[cfg(feature = "metrics")]
    crate::metrics::record_partition_skipped(reason);
}

/// Outcomes: `acked`, `retried`, `dead_lettered`.
pub fn record_message_finished(
    message_type: impl AsRef<str>,
    outcome: impl AsRef<str>,
    duration_secs: f64,
) {
    tracing::info!(
        message_type = %message_type.as_ref(),
        outcome = %outcome.as_ref(),
        duration_secs,
        "message finished"
    );

    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_message_finished(message_type.as_ref(), outcome.as_ref());
        crate::metrics::observe_handle_duration(
            message_type.as_ref(),
            outcome.as_ref(),
            duration_secs,
        );
    }
}

/// Publish per-partition depth from a store snapshot.
pub fn record_queue_depth(snapshot: &QueueSnapshot) {
    for (queue_name, entry) in &snapshot.queues {
        tracing::debug!(
            queue_name = %queue_name,
            ready = entry.ready_count,
            delivered = entry.delivered_count,
            delayed = entry.delayed_count,
            "queue depth"
        );

        #[cfg(feature = "metrics")]
        {
            crate::metrics::set_queue_depth(queue_name, "ready", entry.ready_count as f64);
            crate::metrics::set_queue_depth(queue_name, "delivered", entry.delivered_count as f64);
            crate::metrics::set_queue_depth(queue_name, "delayed", entry.delayed_count as f64);
        }
    }
}
