//! Subscriber sessions.
//!
//! A session has two halves:
//!
//! - [`SubscriberSink`]: owned by the broadcaster coordinator once subscribed.
//!   It carries content-free notifications over a bounded queue and is closed
//!   at most once.
//! - [`Subscription`]: owned by the connection handler. It yields the current
//!   snapshot first, then re-fetches a snapshot on every notification, and
//!   ends when the peer goes away or the room is torn down.
//!
//! Cleanup (unsubscribe plus `leave`, or room teardown for the facilitator)
//! runs exactly once per session whichever way it ends. It is guarded by the
//! session's own state under `&mut self`, so two cleanup paths can never run
//! for the same session.

use crate::errors::TallyError;
use crate::room::state::RoomSnapshot;
use crate::room::{Room, TeardownReason};

use common::types::{ParticipantName, RoomId};
use futures::stream::{self, Stream};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Unique id of one subscriber session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a sink was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Removed by an unsubscribe.
    Unsubscribed,
    /// Disconnected because its queue was full.
    Overflow,
    /// The room was torn down.
    Teardown,
}

/// Failure to hand a notification to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyError {
    /// The bounded queue is full.
    Full,
    /// The receiving session is gone or the sink was already closed.
    Closed,
}

/// Broadcaster-owned end of a session.
#[derive(Debug)]
pub struct SubscriberSink {
    id: SubscriberId,
    label: String,
    sender: Option<mpsc::Sender<()>>,
    cause: Arc<OnceLock<CloseCause>>,
}

impl SubscriberSink {
    /// Create a sink and its receiving end with a queue of `depth` notifications.
    #[must_use]
    pub fn channel(label: impl Into<String>, depth: usize) -> (Self, PulseReceiver) {
        let (sender, rx) = mpsc::channel(depth.max(1));
        let cause = Arc::new(OnceLock::new());

        let sink = Self {
            id: SubscriberId::new(),
            label: label.into(),
            sender: Some(sender),
            cause: Arc::clone(&cause),
        };

        (sink, PulseReceiver { rx, cause })
    }

    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Participant name or "facilitator", for logging.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Hand one notification to the session without waiting.
    pub fn notify(&self) -> Result<(), NotifyError> {
        let sender = self.sender.as_ref().ok_or(NotifyError::Closed)?;
        sender.try_send(()).map_err(|e| match e {
            TrySendError::Full(()) => NotifyError::Full,
            TrySendError::Closed(()) => NotifyError::Closed,
        })
    }

    /// Close the sink. Returns `false` if it was already closed.
    pub fn close(&mut self, cause: CloseCause) -> bool {
        match self.sender.take() {
            Some(sender) => {
                let _ = self.cause.set(cause);
                drop(sender);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_none()
    }
}

/// Session-owned end of a sink.
#[derive(Debug)]
pub struct PulseReceiver {
    rx: mpsc::Receiver<()>,
    cause: Arc<OnceLock<CloseCause>>,
}

impl PulseReceiver {
    /// Wait for the next notification. `None` once the sink is closed and drained.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    /// Why the sink was closed. A sink dropped without an explicit close was
    /// discarded by a stopping broadcaster.
    #[must_use]
    pub fn close_cause(&self) -> CloseCause {
        self.cause.get().copied().unwrap_or(CloseCause::Teardown)
    }
}

/// Who a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRole {
    Participant(ParticipantName),
    Facilitator,
}

impl SessionRole {
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            SessionRole::Participant(name) => name.as_str(),
            SessionRole::Facilitator => "facilitator",
        }
    }
}

/// Session lifecycle. Closed states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Subscribe sent, not yet acknowledged.
    Pending,
    Subscribed,
    /// The connection went away.
    ClosedByPeer,
    /// The room was torn down.
    ClosedByTeardown,
    /// Disconnected for overflowing its queue, or ended after a snapshot
    /// failed, while the room stayed active.
    Dropped,
}

impl SessionState {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            SessionState::ClosedByPeer | SessionState::ClosedByTeardown | SessionState::Dropped
        )
    }
}

/// A live push stream of room snapshots.
pub struct Subscription {
    room: Arc<Room>,
    subscriber_id: SubscriberId,
    role: SessionRole,
    receiver: PulseReceiver,
    state: SessionState,
    initial: Option<RoomSnapshot>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("room_id", self.room.id())
            .field("subscriber_id", &self.subscriber_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Create a session whose subscribe has not been acknowledged yet.
    ///
    /// Dropping it from here on runs the session cleanup.
    pub(crate) fn pending(
        room: Arc<Room>,
        role: SessionRole,
        subscriber_id: SubscriberId,
        receiver: PulseReceiver,
    ) -> Self {
        Self {
            room,
            subscriber_id,
            role,
            receiver,
            state: SessionState::Pending,
            initial: None,
        }
    }

    /// Mark the session subscribed; `initial` is yielded first.
    pub(crate) fn activate(&mut self, initial: RoomSnapshot) {
        if self.state == SessionState::Pending {
            self.state = SessionState::Subscribed;
            self.initial = Some(initial);
        }
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        self.room.id()
    }

    #[must_use]
    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    #[must_use]
    pub fn role(&self) -> &SessionRole {
        &self.role
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Next snapshot, or `None` once the session has ended.
    ///
    /// Cancel-safe: dropping the future loses no notification.
    pub async fn next(&mut self) -> Option<RoomSnapshot> {
        if let Some(snapshot) = self.initial.take() {
            return Some(snapshot);
        }
        if self.state != SessionState::Subscribed {
            return None;
        }

        match self.receiver.recv().await {
            Some(()) => match self.room.state().snapshot() {
                Ok(snapshot) => Some(snapshot),
                Err(TallyError::RoomInactive(_)) => {
                    self.finish(SessionState::ClosedByTeardown);
                    None
                }
                Err(e) => {
                    error!(
                        target: "tally.room.session",
                        room_id = %self.room.id(),
                        subscriber_id = %self.subscriber_id,
                        error = %e,
                        "Snapshot failed, dropping session"
                    );
                    self.finish(SessionState::Dropped);
                    None
                }
            },
            None => {
                // `Unsubscribed` only closes sinks whose session already
                // finished or whose receiver is gone.
                let terminal = match self.receiver.close_cause() {
                    CloseCause::Teardown => SessionState::ClosedByTeardown,
                    CloseCause::Overflow | CloseCause::Unsubscribed => SessionState::Dropped,
                };
                self.finish(terminal);
                None
            }
        }
    }

    /// Close the session from the peer side.
    pub fn close(&mut self) {
        self.finish(SessionState::ClosedByPeer);
    }

    /// Turn the session into a `Stream` of snapshots. Dropping the stream
    /// closes the session.
    pub fn into_stream(self) -> impl Stream<Item = RoomSnapshot> + Send + 'static {
        stream::unfold(self, |mut session| async move {
            let snapshot = session.next().await?;
            Some((snapshot, session))
        })
    }

    fn finish(&mut self, terminal: SessionState) {
        if self.state.is_closed() {
            return;
        }
        let was = self.state;
        self.state = terminal;
        self.initial = None;

        self.room.broadcaster().unsubscribe(self.subscriber_id);

        match &self.role {
            SessionRole::Participant(name) => match self
                .room
                .state()
                .leave_session(name, self.subscriber_id)
            {
                Ok(_) | Err(TallyError::RoomInactive(_)) => {}
                Err(e) => {
                    warn!(
                        target: "tally.room.session",
                        room_id = %self.room.id(),
                        participant = %name,
                        error = %e,
                        "Leave failed during session cleanup"
                    );
                }
            },
            SessionRole::Facilitator => {
                self.room.teardown(TeardownReason::FacilitatorLeft);
                self.room.state().release_facilitator();
            }
        }

        debug!(
            target: "tally.room.session",
            room_id = %self.room.id(),
            subscriber_id = %self.subscriber_id,
            role = self.role.label(),
            from = ?was,
            to = ?terminal,
            "Session closed"
        );
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.finish(SessionState::ClosedByPeer);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_delivers_notifications() {
        let (sink, mut rx) = SubscriberSink::channel("alice", 4);

        sink.notify().unwrap();
        sink.notify().unwrap();

        assert_eq!(rx.recv().await, Some(()));
        assert_eq!(rx.recv().await, Some(()));
    }

    #[tokio::test]
    async fn test_sink_reports_full_queue() {
        let (sink, _rx) = SubscriberSink::channel("alice", 2);

        sink.notify().unwrap();
        sink.notify().unwrap();
        assert_eq!(sink.notify(), Err(NotifyError::Full));
    }

    #[tokio::test]
    async fn test_sink_reports_dropped_receiver() {
        let (sink, rx) = SubscriberSink::channel("alice", 2);
        drop(rx);
        assert_eq!(sink.notify(), Err(NotifyError::Closed));
    }

    #[tokio::test]
    async fn test_sink_close_is_idempotent() {
        let (mut sink, mut rx) = SubscriberSink::channel("alice", 2);

        assert!(sink.close(CloseCause::Teardown));
        assert!(!sink.close(CloseCause::Unsubscribed));
        assert!(sink.is_closed());
        assert_eq!(sink.notify(), Err(NotifyError::Closed));

        assert_eq!(rx.recv().await, None);
        // First close wins
        assert_eq!(rx.close_cause(), CloseCause::Teardown);
    }

    #[tokio::test]
    async fn test_queued_notifications_drain_before_close() {
        let (mut sink, mut rx) = SubscriberSink::channel("bob", 4);

        sink.notify().unwrap();
        sink.close(CloseCause::Overflow);

        assert_eq!(rx.recv().await, Some(()));
        assert_eq!(rx.recv().await, None);
        assert_eq!(rx.close_cause(), CloseCause::Overflow);
    }

    #[tokio::test]
    async fn test_dropped_sink_reads_as_teardown() {
        let (sink, mut rx) = SubscriberSink::channel("bob", 4);
        drop(sink);

        assert_eq!(rx.recv().await, None);
        assert_eq!(rx.close_cause(), CloseCause::Teardown);
    }

    #[test]
    fn test_zero_depth_is_clamped() {
        let (sink, _rx) = SubscriberSink::channel("bob", 0);
        assert!(sink.notify().is_ok());
    }

    #[test]
    fn test_session_state_terminal() {
        assert!(!SessionState::Pending.is_closed());
        assert!(!SessionState::Subscribed.is_closed());
        assert!(SessionState::ClosedByPeer.is_closed());
        assert!(SessionState::ClosedByTeardown.is_closed());
        assert!(SessionState::Dropped.is_closed());
    }

    #[test]
    fn test_role_label() {
        let name = ParticipantName::parse("alice").unwrap();
        assert_eq!(SessionRole::Participant(name).label(), "alice");
        assert_eq!(SessionRole::Facilitator.label(), "facilitator");
    }
}
