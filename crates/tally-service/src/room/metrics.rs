//! Broadcaster mailbox monitoring and in-process room counters.
//!
//! Mailbox depth levels for a broadcaster, relative to its configured
//! warning depth `w`:
//!
//! | Normal | Warning  | Critical |
//! |--------|----------|----------|
//! | <= w   | w..=3w   | > 3w     |
//!
//! `RoomMetrics` is shared by the registry and every broadcaster. Prometheus
//! export lives in `observability::metrics`; these atomics are what tests and
//! the registry status read.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Critical depth as a multiple of the warning depth.
const CRITICAL_FACTOR: usize = 3;

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    /// Below normal threshold.
    Normal,
    /// Between normal and warning thresholds.
    Warning,
    /// Above warning threshold.
    Critical,
}

/// Tracks queue depth of one broadcaster's mailbox.
#[derive(Debug)]
pub struct MailboxMonitor {
    room_id: String,
    warning_depth: usize,
    critical_depth: usize,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(room_id: impl Into<String>, warning_depth: usize) -> Self {
        let warning_depth = warning_depth.max(1);
        Self {
            room_id: room_id.into(),
            warning_depth,
            critical_depth: warning_depth.saturating_mul(CRITICAL_FACTOR),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    /// Record a message being added to the mailbox.
    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);

        match self.level_for_depth(new_depth) {
            MailboxLevel::Critical => {
                warn!(
                    target: "tally.room.broadcaster",
                    room_id = %self.room_id,
                    depth = new_depth,
                    threshold = self.critical_depth,
                    "Broadcaster mailbox depth critical"
                );
            }
            MailboxLevel::Warning if new_depth == self.warning_depth + 1 => {
                debug!(
                    target: "tally.room.broadcaster",
                    room_id = %self.room_id,
                    depth = new_depth,
                    "Broadcaster mailbox depth elevated"
                );
            }
            _ => {}
        }
    }

    /// Record a message being taken off the mailbox.
    pub fn record_dequeue(&self) {
        // Saturating: a message enqueued before a failed send is un-recorded
        // by the sender, and may race a dequeue of an earlier message.
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(1))
            });
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo an enqueue whose send failed.
    pub fn record_send_failed(&self) {
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(1))
            });
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.critical_depth {
            MailboxLevel::Critical
        } else if depth > self.warning_depth {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Process-wide room counters.
///
/// All fields are atomic for lock-free concurrent access from broadcasters,
/// sessions and the registry.
#[derive(Debug, Default)]
pub struct RoomMetrics {
    /// Rooms created since start.
    pub rooms_created: AtomicU64,
    /// Rooms torn down since start.
    pub rooms_torn_down: AtomicU64,
    /// Broadcaster coordinators that have stopped.
    pub broadcasters_stopped: AtomicU64,
    /// Subscriber sessions currently in some broadcaster's set.
    pub subscribers_active: AtomicUsize,
    /// Notifications handed to subscriber sinks.
    pub pulses_relayed: AtomicU64,
    /// Subscriber sinks closed (unsubscribe, overflow or teardown).
    pub sinks_closed: AtomicU64,
    /// Subscribers disconnected because their queue was full.
    pub subscribers_overflowed: AtomicU64,
}

/// Point-in-time copy of [`RoomMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomMetricsSnapshot {
    pub rooms_created: u64,
    pub rooms_torn_down: u64,
    pub broadcasters_stopped: u64,
    pub subscribers_active: usize,
    pub pulses_relayed: u64,
    pub sinks_closed: u64,
    pub subscribers_overflowed: u64,
}

impl RoomMetrics {
    /// Create a new shared metrics instance.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        self.rooms_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn room_torn_down(&self) {
        self.rooms_torn_down.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcaster_stopped(&self) {
        self.broadcasters_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_added(&self) {
        self.subscribers_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active subscribers by `count` (teardown removes many at once).
    pub fn subscribers_removed(&self, count: usize) {
        let _ = self
            .subscribers_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(count))
            });
    }

    pub fn pulses_relayed(&self, count: u64) {
        self.pulses_relayed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn sink_closed(&self) {
        self.sinks_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_overflowed(&self) {
        self.subscribers_overflowed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> RoomMetricsSnapshot {
        RoomMetricsSnapshot {
            rooms_created: self.rooms_created.load(Ordering::Relaxed),
            rooms_torn_down: self.rooms_torn_down.load(Ordering::Relaxed),
            broadcasters_stopped: self.broadcasters_stopped.load(Ordering::Relaxed),
            subscribers_active: self.subscribers_active.load(Ordering::Relaxed),
            pulses_relayed: self.pulses_relayed.load(Ordering::Relaxed),
            sinks_closed: self.sinks_closed.load(Ordering::Relaxed),
            subscribers_overflowed: self.subscribers_overflowed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_monitor_enqueue_dequeue() {
        let monitor = MailboxMonitor::new("room-1", 64);

        monitor.record_enqueue();
        monitor.record_enqueue();
        monitor.record_enqueue();
        assert_eq!(monitor.current_depth(), 3);
        assert_eq!(monitor.peak_depth(), 3);

        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 2);
        assert_eq!(monitor.peak_depth(), 3);
        assert_eq!(monitor.messages_processed(), 1);
    }

    #[test]
    fn test_mailbox_monitor_levels() {
        let monitor = MailboxMonitor::new("room-1", 64);
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);

        for _ in 0..64 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);

        monitor.record_enqueue();
        assert_eq!(monitor.current_level(), MailboxLevel::Warning);

        for _ in 0..128 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);
    }

    #[test]
    fn test_mailbox_monitor_never_underflows() {
        let monitor = MailboxMonitor::new("room-1", 64);
        monitor.record_send_failed();
        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 0);
    }

    #[test]
    fn test_room_metrics_snapshot() {
        let metrics = RoomMetrics::new();

        metrics.room_created();
        metrics.subscriber_added();
        metrics.subscriber_added();
        metrics.pulses_relayed(2);
        metrics.subscribers_removed(1);
        metrics.sink_closed();

        let snap = metrics.snapshot();
        assert_eq!(snap.rooms_created, 1);
        assert_eq!(snap.subscribers_active, 1);
        assert_eq!(snap.pulses_relayed, 2);
        assert_eq!(snap.sinks_closed, 1);
        assert_eq!(snap.rooms_torn_down, 0);
    }

    #[test]
    fn test_subscribers_removed_saturates() {
        let metrics = RoomMetrics::new();
        metrics.subscriber_added();
        metrics.subscribers_removed(5);
        assert_eq!(metrics.snapshot().subscribers_active, 0);
    }
}
