//! Prometheus metrics for the Tally service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `tally_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded; room ids and participant names are never labels.
//! - `reason`: teardown reasons and subscriber drop reasons (2-3 values each)
//! - `operation`: bounded by the room operations (~10 values)
//! - `status`: HTTP status codes produced by `TallyError` (~8 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Room lifetimes range from seconds to hours
        .set_buckets_for_metric(
            Matcher::Full("tally_room_lifetime_seconds".to_string()),
            &[
                1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0,
            ],
        )
        .map_err(|e| format!("Failed to set room lifetime buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Room Gauges
// ============================================================================

/// Set the number of active (not torn down) rooms.
///
/// Metric: `tally_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("tally_rooms_active").set(count as f64);
}

/// Set the number of live subscriber sessions across all rooms.
///
/// Metric: `tally_subscribers_active`
pub fn set_subscribers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("tally_subscribers_active").set(count as f64);
}

// ============================================================================
// Room Lifecycle Counters
// ============================================================================

/// Metric: `tally_rooms_created_total`
pub fn record_room_created() {
    counter!("tally_rooms_created_total").increment(1);
}

/// Record a room teardown and how long the room lived.
///
/// Metrics: `tally_rooms_torn_down_total`, `tally_room_lifetime_seconds`
/// Labels: `reason` (facilitator_left, shutdown)
pub fn record_room_torn_down(reason: &str, lifetime: Duration) {
    counter!("tally_rooms_torn_down_total", "reason" => reason.to_string()).increment(1);
    histogram!("tally_room_lifetime_seconds").record(lifetime.as_secs_f64());
}

/// Metric: `tally_rooms_reaped_total`
pub fn record_rooms_reaped(count: usize) {
    counter!("tally_rooms_reaped_total").increment(count as u64);
}

// ============================================================================
// Fan-out Counters
// ============================================================================

/// Record notifications handed to subscriber sinks by one pulse.
///
/// Metric: `tally_pulses_relayed_total`
pub fn record_pulses_relayed(count: usize) {
    counter!("tally_pulses_relayed_total").increment(count as u64);
}

/// Record a subscriber removed by the broadcaster without an unsubscribe.
///
/// Metric: `tally_subscribers_dropped_total`
/// Labels: `reason` (overflow, closed)
pub fn record_subscriber_dropped(reason: &str) {
    counter!("tally_subscribers_dropped_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Operation Counters
// ============================================================================

/// Record the outcome of a room operation.
///
/// Metric: `tally_operations_total`
/// Labels: `operation`, `status` (HTTP status code)
pub fn record_operation(operation: &'static str, status_code: u16) {
    counter!(
        "tally_operations_total",
        "operation" => operation,
        "status" => status_code.to_string()
    )
    .increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // Without an installed recorder these are no-ops; the tests pin the
    // signatures and make sure no label construction panics.

    #[test]
    fn test_set_gauges() {
        set_rooms_active(0);
        set_rooms_active(1000);
        set_subscribers_active(0);
        set_subscribers_active(20_000);
    }

    #[test]
    fn test_record_room_lifecycle() {
        record_room_created();
        record_room_torn_down("facilitator_left", Duration::from_secs(600));
        record_room_torn_down("shutdown", Duration::from_millis(5));
        record_rooms_reaped(3);
    }

    #[test]
    fn test_record_fan_out() {
        record_pulses_relayed(0);
        record_pulses_relayed(20);
        record_subscriber_dropped("overflow");
        record_subscriber_dropped("closed");
    }

    #[test]
    fn test_record_operation() {
        record_operation("join", 200);
        record_operation("join", 403);
        record_operation("set_vote", 404);
    }
}
