//! Observability for the Tally service: Prometheus metrics and health probes.
//!
//! # Privacy
//!
//! Admission tokens never appear in logs or labels. Room ids and participant
//! names appear in logs only, never as metric labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `tally_rooms_active` | Gauge | none | Rooms not yet torn down |
//! | `tally_subscribers_active` | Gauge | none | Live subscriber sessions |
//! | `tally_rooms_created_total` | Counter | none | Room creations |
//! | `tally_rooms_torn_down_total` | Counter | `reason` | Room teardowns |
//! | `tally_room_lifetime_seconds` | Histogram | none | Creation to teardown |
//! | `tally_rooms_reaped_total` | Counter | none | Inactive rooms removed |
//! | `tally_pulses_relayed_total` | Counter | none | Notifications delivered |
//! | `tally_subscribers_dropped_total` | Counter | `reason` | Sinks removed without unsubscribe |
//! | `tally_operations_total` | Counter | `operation`, `status` | HTTP operation outcomes |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
