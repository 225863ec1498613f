//! Messages accepted by a room's broadcaster.

use crate::room::session::{SubscriberId, SubscriberSink};

use tokio::sync::oneshot;

/// Broadcaster mailbox message.
#[derive(Debug)]
pub enum BroadcasterMessage {
    /// Add a sink to the subscriber set. Acked once the sink is a member, so
    /// every pulse enqueued after the ack reaches it.
    Subscribe {
        sink: SubscriberSink,
        respond_to: oneshot::Sender<()>,
    },

    /// Remove a sink from the subscriber set and close it.
    Unsubscribe { subscriber_id: SubscriberId },

    /// Relay one notification to every current subscriber.
    Pulse,

    /// Query the subscriber set.
    GetStatus {
        respond_to: oneshot::Sender<BroadcasterStatus>,
    },
}

impl BroadcasterMessage {
    /// Message kind for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            BroadcasterMessage::Subscribe { .. } => "subscribe",
            BroadcasterMessage::Unsubscribe { .. } => "unsubscribe",
            BroadcasterMessage::Pulse => "pulse",
            BroadcasterMessage::GetStatus { .. } => "get_status",
        }
    }
}

/// Broadcaster state as seen from outside the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcasterStatus {
    /// Sinks currently subscribed.
    pub subscribers: usize,
    /// Pulses processed since the broadcaster started.
    pub pulses: u64,
    /// Notifications delivered across all sinks.
    pub notifications_delivered: u64,
}
