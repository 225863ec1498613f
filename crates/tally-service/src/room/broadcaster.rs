//! Broadcaster actor: single owner of a room's subscriber set.
//!
//! Every change to the set and every pulse relay is a message processed by
//! one coordinator task, so the set itself needs no lock.
//!
//! # Mailbox
//!
//! The mailbox is a single unbounded FIFO. Pulses and unsubscribes are sent
//! synchronously from under-lock callers and must never be reordered behind
//! a later subscribe, so nothing is ever deferred to another task. Depth is
//! watched by a [`MailboxMonitor`] instead of bounded by capacity.
//!
//! # Delivery
//!
//! A pulse reaches exactly the sinks subscribed when the coordinator processes
//! it. Delivery never blocks: each sink has a bounded queue, and a sink whose
//! queue is full is disconnected rather than allowed to stall the others.
//!
//! # Teardown
//!
//! [`BroadcasterHandle::teardown`] flips a shared flag with a compare-and-swap
//! and cancels the coordinator's token. Only the first caller wins; the
//! coordinator then closes every sink once and stops. Messages sent after
//! the flag is set are dropped by the handle.

use crate::errors::TallyError;
use crate::observability::metrics as prom;
use crate::room::messages::{BroadcasterMessage, BroadcasterStatus};
use crate::room::metrics::{MailboxLevel, MailboxMonitor, RoomMetrics};
use crate::room::session::{CloseCause, NotifyError, SubscriberId, SubscriberSink};

use common::types::RoomId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Handle to a room's `Broadcaster`.
#[derive(Clone, Debug)]
pub struct BroadcasterHandle {
    sender: mpsc::UnboundedSender<BroadcasterMessage>,
    cancel_token: CancellationToken,
    torn_down: Arc<AtomicBool>,
    mailbox: Arc<MailboxMonitor>,
    room_id: RoomId,
}

impl BroadcasterHandle {
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Add a sink. Resolves once the sink is in the set.
    ///
    /// Fails with `RoomInactive` if the broadcaster has stopped or stops
    /// before processing the request.
    pub async fn subscribe(&self, sink: SubscriberSink) -> Result<(), TallyError> {
        if self.is_torn_down() {
            return Err(self.inactive());
        }

        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if self
            .sender
            .send(BroadcasterMessage::Subscribe {
                sink,
                respond_to: tx,
            })
            .is_err()
        {
            self.mailbox.record_send_failed();
            return Err(self.inactive());
        }

        // A dropped responder means the coordinator stopped with the request queued.
        rx.await.map_err(|_| self.inactive())
    }

    /// Remove and close a sink. A no-op for unknown ids or a stopped broadcaster.
    pub fn unsubscribe(&self, subscriber_id: SubscriberId) {
        self.enqueue(BroadcasterMessage::Unsubscribe { subscriber_id });
    }

    /// Relay one notification to every current subscriber.
    pub fn pulse(&self) {
        self.enqueue(BroadcasterMessage::Pulse);
    }

    /// Current subscriber count and relay totals.
    pub async fn status(&self) -> Result<BroadcasterStatus, TallyError> {
        if self.is_torn_down() {
            return Err(self.inactive());
        }

        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if self
            .sender
            .send(BroadcasterMessage::GetStatus { respond_to: tx })
            .is_err()
        {
            self.mailbox.record_send_failed();
            return Err(self.inactive());
        }
        rx.await.map_err(|_| self.inactive())
    }

    /// Stop the broadcaster and close every sink. Returns `true` only for the
    /// call that actually stopped it.
    pub fn teardown(&self) -> bool {
        let won = self
            .torn_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            self.cancel_token.cancel();
        }
        won
    }

    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst) || self.cancel_token.is_cancelled()
    }

    /// Congestion level of the mailbox right now.
    #[must_use]
    pub fn mailbox_level(&self) -> MailboxLevel {
        self.mailbox.current_level()
    }

    /// Fire-and-forget send, in order with every other message.
    fn enqueue(&self, message: BroadcasterMessage) {
        if self.is_torn_down() {
            return;
        }

        self.mailbox.record_enqueue();
        if let Err(mpsc::error::SendError(message)) = self.sender.send(message) {
            self.mailbox.record_send_failed();
            debug!(
                target: "tally.room.broadcaster",
                room_id = %self.room_id,
                kind = message.kind(),
                "Broadcaster stopped, message dropped"
            );
        }
    }

    fn inactive(&self) -> TallyError {
        TallyError::RoomInactive(self.room_id.to_string())
    }
}

/// Broadcaster coordinator, one per room.
pub struct Broadcaster {
    room_id: RoomId,
    receiver: mpsc::UnboundedReceiver<BroadcasterMessage>,
    cancel_token: CancellationToken,
    torn_down: Arc<AtomicBool>,
    subscribers: HashMap<SubscriberId, SubscriberSink>,
    pulses: u64,
    notifications_delivered: u64,
    mailbox: Arc<MailboxMonitor>,
    metrics: Arc<RoomMetrics>,
}

impl Broadcaster {
    /// Spawn a broadcaster coordinator.
    ///
    /// `cancel_token` should be a child of the registry's token so process
    /// shutdown stops every room. `mailbox_warning_depth` sets when the
    /// mailbox is reported congested.
    pub fn spawn(
        room_id: RoomId,
        mailbox_warning_depth: usize,
        cancel_token: CancellationToken,
        metrics: Arc<RoomMetrics>,
    ) -> (BroadcasterHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let torn_down = Arc::new(AtomicBool::new(false));
        let mailbox = Arc::new(MailboxMonitor::new(
            room_id.as_str(),
            mailbox_warning_depth,
        ));

        let actor = Self {
            room_id: room_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            torn_down: Arc::clone(&torn_down),
            subscribers: HashMap::new(),
            pulses: 0,
            notifications_delivered: 0,
            mailbox: Arc::clone(&mailbox),
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = BroadcasterHandle {
            sender,
            cancel_token,
            torn_down,
            mailbox,
            room_id,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "tally.room.broadcaster", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        debug!(
            target: "tally.room.broadcaster",
            room_id = %self.room_id,
            "Broadcaster started"
        );

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_dequeue();
                            self.handle_message(message);
                        }
                        None => {
                            debug!(
                                target: "tally.room.broadcaster",
                                room_id = %self.room_id,
                                "Broadcaster channel closed"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.stop();
    }

    fn handle_message(&mut self, message: BroadcasterMessage) {
        match message {
            BroadcasterMessage::Subscribe { sink, respond_to } => {
                let id = sink.id();
                debug!(
                    target: "tally.room.broadcaster",
                    room_id = %self.room_id,
                    subscriber_id = %id,
                    subscriber = sink.label(),
                    "Subscriber added"
                );
                self.subscribers.insert(id, sink);
                self.metrics.subscriber_added();

                if respond_to.send(()).is_err() {
                    // Requester gone; its session cleanup sends the unsubscribe.
                    debug!(
                        target: "tally.room.broadcaster",
                        room_id = %self.room_id,
                        subscriber_id = %id,
                        "Subscribe requester went away"
                    );
                }
            }

            BroadcasterMessage::Unsubscribe { subscriber_id } => {
                if let Some(mut sink) = self.subscribers.remove(&subscriber_id) {
                    self.metrics.subscribers_removed(1);
                    if sink.close(CloseCause::Unsubscribed) {
                        self.metrics.sink_closed();
                    }
                    debug!(
                        target: "tally.room.broadcaster",
                        room_id = %self.room_id,
                        subscriber_id = %subscriber_id,
                        "Subscriber removed"
                    );
                }
            }

            BroadcasterMessage::Pulse => self.relay_pulse(),

            BroadcasterMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(BroadcasterStatus {
                    subscribers: self.subscribers.len(),
                    pulses: self.pulses,
                    notifications_delivered: self.notifications_delivered,
                });
            }
        }
    }

    fn relay_pulse(&mut self) {
        self.pulses += 1;

        let mut delivered = 0usize;
        let mut failed = Vec::new();
        for (id, sink) in &self.subscribers {
            match sink.notify() {
                Ok(()) => delivered += 1,
                Err(e) => failed.push((*id, e)),
            }
        }

        for (id, error) in failed {
            let Some(mut sink) = self.subscribers.remove(&id) else {
                continue;
            };
            self.metrics.subscribers_removed(1);

            match error {
                NotifyError::Full => {
                    warn!(
                        target: "tally.room.broadcaster",
                        room_id = %self.room_id,
                        subscriber_id = %id,
                        subscriber = sink.label(),
                        "Subscriber queue full, disconnecting"
                    );
                    self.metrics.subscriber_overflowed();
                    prom::record_subscriber_dropped("overflow");
                    if sink.close(CloseCause::Overflow) {
                        self.metrics.sink_closed();
                    }
                }
                NotifyError::Closed => {
                    debug!(
                        target: "tally.room.broadcaster",
                        room_id = %self.room_id,
                        subscriber_id = %id,
                        "Subscriber receiver gone, removing"
                    );
                    prom::record_subscriber_dropped("closed");
                    if sink.close(CloseCause::Unsubscribed) {
                        self.metrics.sink_closed();
                    }
                }
            }
        }

        self.notifications_delivered += delivered as u64;
        self.metrics.pulses_relayed(delivered as u64);
        prom::record_pulses_relayed(delivered);
    }

    /// Close every sink exactly once and drop the mailbox.
    fn stop(&mut self) {
        self.torn_down.store(true, Ordering::SeqCst);
        // Queued subscribe requests are dropped here; their requesters see a
        // dropped responder.
        self.receiver.close();

        let closed = self.subscribers.len();
        for (_, mut sink) in self.subscribers.drain() {
            if sink.close(CloseCause::Teardown) {
                self.metrics.sink_closed();
            }
        }
        self.metrics.subscribers_removed(closed);
        self.metrics.broadcaster_stopped();

        info!(
            target: "tally.room.broadcaster",
            room_id = %self.room_id,
            sinks_closed = closed,
            pulses = self.pulses,
            messages_processed = self.mailbox.messages_processed(),
            peak_mailbox_depth = self.mailbox.peak_depth(),
            "Broadcaster stopped"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::room::session::PulseReceiver;
    use std::time::Duration;

    fn spawn() -> (BroadcasterHandle, JoinHandle<()>, Arc<RoomMetrics>) {
        let metrics = RoomMetrics::new();
        let (handle, task) = Broadcaster::spawn(
            RoomId::new("room-b"),
            64,
            CancellationToken::new(),
            Arc::clone(&metrics),
        );
        (handle, task, metrics)
    }

    async fn subscribed(handle: &BroadcasterHandle, depth: usize) -> (SubscriberId, PulseReceiver) {
        let (sink, rx) = SubscriberSink::channel("sub", depth);
        let id = sink.id();
        handle.subscribe(sink).await.unwrap();
        (id, rx)
    }

    async fn settle(handle: &BroadcasterHandle) -> BroadcasterStatus {
        // Status is processed after everything enqueued before it.
        handle.status().await.unwrap()
    }

    #[tokio::test]
    async fn test_pulse_reaches_every_subscriber_once() {
        let (handle, _task, _metrics) = spawn();
        let (_, mut a) = subscribed(&handle, 8).await;
        let (_, mut b) = subscribed(&handle, 8).await;

        handle.pulse();
        let status = settle(&handle).await;
        assert_eq!(status.subscribers, 2);
        assert_eq!(status.notifications_delivered, 2);

        assert_eq!(a.recv().await, Some(()));
        assert_eq!(b.recv().await, Some(()));
        assert!(tokio::time::timeout(Duration::from_millis(20), a.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unsubscribed_session_gets_nothing() {
        let (handle, _task, metrics) = spawn();
        let (id, mut rx) = subscribed(&handle, 8).await;

        handle.unsubscribe(id);
        handle.pulse();
        let status = settle(&handle).await;

        assert_eq!(status.subscribers, 0);
        assert_eq!(status.notifications_delivered, 0);
        assert_eq!(rx.recv().await, None);
        assert_eq!(rx.close_cause(), CloseCause::Unsubscribed);
        assert_eq!(metrics.snapshot().sinks_closed, 1);
    }

    #[tokio::test]
    async fn test_double_unsubscribe_closes_once() {
        let (handle, _task, metrics) = spawn();
        let (id, _rx) = subscribed(&handle, 8).await;

        handle.unsubscribe(id);
        handle.unsubscribe(id);
        settle(&handle).await;

        assert_eq!(metrics.snapshot().sinks_closed, 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_pulse() {
        let (handle, _task, _metrics) = spawn();
        let (_, mut early) = subscribed(&handle, 8).await;

        handle.pulse();
        let (_, mut late) = subscribed(&handle, 8).await;
        settle(&handle).await;

        assert_eq!(early.recv().await, Some(()));
        assert!(tokio::time::timeout(Duration::from_millis(20), late.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_full_queue_disconnects_only_slow_subscriber() {
        let (handle, _task, metrics) = spawn();
        let (_, mut slow) = subscribed(&handle, 1).await;
        let (_, mut fast) = subscribed(&handle, 8).await;

        handle.pulse();
        handle.pulse();
        let status = settle(&handle).await;

        assert_eq!(status.subscribers, 1);
        assert_eq!(metrics.snapshot().subscribers_overflowed, 1);

        // Slow subscriber drains what it got, then sees the disconnect
        assert_eq!(slow.recv().await, Some(()));
        assert_eq!(slow.recv().await, None);
        assert_eq!(slow.close_cause(), CloseCause::Overflow);

        assert_eq!(fast.recv().await, Some(()));
        assert_eq!(fast.recv().await, Some(()));
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let (handle, _task, _metrics) = spawn();
        let (_, rx) = subscribed(&handle, 8).await;
        drop(rx);

        handle.pulse();
        assert_eq!(settle(&handle).await.subscribers, 0);
    }

    #[tokio::test]
    async fn test_teardown_closes_all_sinks_and_stops() {
        let (handle, task, metrics) = spawn();
        let (_, mut a) = subscribed(&handle, 8).await;
        let (_, mut b) = subscribed(&handle, 8).await;

        assert!(handle.teardown());
        task.await.unwrap();

        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, None);
        assert_eq!(a.close_cause(), CloseCause::Teardown);

        let snap = metrics.snapshot();
        assert_eq!(snap.sinks_closed, 2);
        assert_eq!(snap.broadcasters_stopped, 1);
        assert_eq!(snap.subscribers_active, 0);
    }

    #[tokio::test]
    async fn test_concurrent_teardown_wins_once() {
        let (handle, task, metrics) = spawn();
        let (_, _a) = subscribed(&handle, 8).await;
        let (_, _b) = subscribed(&handle, 8).await;
        let (_, _c) = subscribed(&handle, 8).await;

        let mut racers = Vec::new();
        for _ in 0..8 {
            let h = handle.clone();
            racers.push(tokio::spawn(async move { h.teardown() }));
        }
        let mut wins = 0;
        for racer in racers {
            if racer.await.unwrap() {
                wins += 1;
            }
        }
        task.await.unwrap();

        assert_eq!(wins, 1);
        let snap = metrics.snapshot();
        assert_eq!(snap.sinks_closed, 3);
        assert_eq!(snap.broadcasters_stopped, 1);
    }

    #[tokio::test]
    async fn test_operations_after_teardown_are_no_ops() {
        let (handle, task, _metrics) = spawn();
        handle.teardown();
        task.await.unwrap();

        handle.pulse();
        handle.unsubscribe(SubscriberId::new());
        assert!(!handle.teardown());

        let (sink, _rx) = SubscriberSink::channel("late", 4);
        assert!(matches!(
            handle.subscribe(sink).await,
            Err(TallyError::RoomInactive(_))
        ));
        assert!(matches!(handle.status().await, Err(TallyError::RoomInactive(_))));
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_broadcaster() {
        let parent = CancellationToken::new();
        let metrics = RoomMetrics::new();
        let (handle, task) = Broadcaster::spawn(
            RoomId::new("room-p"),
            16,
            parent.child_token(),
            Arc::clone(&metrics),
        );
        let (_, mut rx) = subscribed(&handle, 4).await;

        parent.cancel();
        task.await.unwrap();

        assert!(handle.is_torn_down());
        assert_eq!(rx.recv().await, None);
        assert_eq!(metrics.snapshot().broadcasters_stopped, 1);
    }

    #[tokio::test]
    async fn test_pulses_arrive_in_order_without_loss() {
        let (handle, _task, _metrics) = spawn();
        let (_, mut rx) = subscribed(&handle, 32).await;

        for _ in 0..10 {
            handle.pulse();
        }
        let status = settle(&handle).await;
        assert_eq!(status.pulses, 10);

        for _ in 0..10 {
            assert_eq!(rx.recv().await, Some(()));
        }
    }

    #[tokio::test]
    async fn test_backlogged_pulses_never_reach_later_subscriber() {
        let metrics = RoomMetrics::new();
        // Warning depth of one: every pulse below lands in a congested mailbox.
        let (handle, _task) =
            Broadcaster::spawn(RoomId::new("room-b"), 1, CancellationToken::new(), metrics);
        let (_, mut early) = subscribed(&handle, 64).await;

        for _ in 0..32 {
            handle.pulse();
        }
        let (_, mut late) = subscribed(&handle, 64).await;
        let status = settle(&handle).await;
        assert_eq!(status.pulses, 32);

        for _ in 0..32 {
            assert_eq!(early.recv().await, Some(()));
        }
        assert!(tokio::time::timeout(Duration::from_millis(20), late.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_mailbox_level_tracks_backlog() {
        let (handle, _task) = Broadcaster::spawn(
            RoomId::new("room-b"),
            2,
            CancellationToken::new(),
            RoomMetrics::new(),
        );

        // The coordinator has not run yet on this single-threaded runtime.
        for _ in 0..10 {
            handle.pulse();
        }
        assert_eq!(handle.mailbox_level(), MailboxLevel::Critical);

        settle(&handle).await;
        assert_eq!(handle.mailbox_level(), MailboxLevel::Normal);
    }
}
