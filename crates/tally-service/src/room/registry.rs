//! Room registry: the process-wide room map and the operations exposed to
//! request handlers.
//!
//! The registry owns a root `CancellationToken`; every broadcaster runs under
//! a child of it, so [`RoomRegistry::shutdown`] stops every room.
//!
//! Torn-down rooms stay resolvable (answering `RoomInactive`) until
//! [`RoomRegistry::sweep_inactive`] removes them after the retention window.

use crate::config::RoomSettings;
use crate::errors::TallyError;
use crate::observability::metrics as prom;
use crate::room::metrics::{MailboxLevel, RoomMetrics};
use crate::room::session::{SessionRole, SubscriberSink, Subscription};
use crate::room::state::RoomSnapshot;
use crate::room::tokens::generate_room_id;
use crate::room::{Room, TeardownReason};

use common::secret::SecretString;
use common::types::{ParticipantName, RoomId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Attempts at drawing an unused room id before giving up.
const ROOM_ID_ATTEMPTS: usize = 8;

/// Result of [`RoomRegistry::create_room`].
#[derive(Debug)]
pub struct CreatedRoom {
    pub room_id: RoomId,
    /// Facilitator admission token. Only ever handed out here.
    pub admission_token: SecretString,
}

/// Registry-wide counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    /// Rooms in the map, including torn-down rooms awaiting removal.
    pub rooms: usize,
    pub active_rooms: usize,
    pub participants: usize,
    pub subscribers: usize,
    /// Active rooms whose broadcaster mailbox is above its warning depth.
    pub congested_rooms: usize,
    pub shutting_down: bool,
}

pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
    settings: RoomSettings,
    max_rooms: usize,
    cancel_token: CancellationToken,
    metrics: Arc<RoomMetrics>,
}

impl std::fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomRegistry")
            .field("settings", &self.settings)
            .field("max_rooms", &self.max_rooms)
            .finish_non_exhaustive()
    }
}

impl RoomRegistry {
    #[must_use]
    pub fn new(settings: RoomSettings, max_rooms: usize, cancel_token: CancellationToken) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            settings,
            max_rooms,
            cancel_token,
            metrics: RoomMetrics::new(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &RoomSettings {
        &self.settings
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<RoomMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Create a room and start its broadcaster.
    #[instrument(skip_all, name = "tally.room.create")]
    pub fn create_room(&self) -> Result<CreatedRoom, TallyError> {
        if self.is_shutting_down() {
            return Err(TallyError::Internal("registry is shutting down".to_string()));
        }

        let mut rooms = self.write_rooms();

        let active = rooms.values().filter(|room| room.is_active()).count();
        if active >= self.max_rooms {
            warn!(
                target: "tally.room.registry",
                active_rooms = active,
                max_rooms = self.max_rooms,
                "Room limit reached"
            );
            return Err(TallyError::RegistryFull {
                max: self.max_rooms,
            });
        }

        let mut room_id = None;
        for _ in 0..ROOM_ID_ATTEMPTS {
            let candidate = generate_room_id()?;
            if !rooms.contains_key(&candidate) {
                room_id = Some(candidate);
                break;
            }
        }
        let room_id = room_id.ok_or_else(|| {
            TallyError::Internal("could not allocate an unused room id".to_string())
        })?;

        let (room, admission_token) = Room::open(
            room_id.clone(),
            &self.settings,
            &self.cancel_token,
            Arc::clone(&self.metrics),
        )?;
        let created_at = room.created_at();
        rooms.insert(room_id.clone(), room);

        self.metrics.room_created();
        prom::record_room_created();
        prom::set_rooms_active(active + 1);

        info!(
            target: "tally.room.registry",
            room_id = %room_id,
            created_at = %created_at.to_rfc3339(),
            rooms = rooms.len(),
            "Room created"
        );

        Ok(CreatedRoom {
            room_id,
            admission_token,
        })
    }

    /// Resolve a room id.
    pub fn room(&self, room_id: &RoomId) -> Result<Arc<Room>, TallyError> {
        self.read_rooms()
            .get(room_id)
            .cloned()
            .ok_or_else(|| TallyError::RoomNotFound(room_id.to_string()))
    }

    pub fn join(&self, room_id: &RoomId, name: &str) -> Result<RoomSnapshot, TallyError> {
        let name = ParticipantName::parse(name)?;
        self.room(room_id)?.state().join(&name)
    }

    pub fn leave(&self, room_id: &RoomId, name: &str) -> Result<bool, TallyError> {
        let name = ParticipantName::parse(name)?;
        self.room(room_id)?.state().leave(&name)
    }

    pub fn set_vote(&self, room_id: &RoomId, name: &str, value: u32) -> Result<(), TallyError> {
        let name = ParticipantName::parse(name)?;
        self.room(room_id)?.state().set_vote(&name, value)
    }

    pub fn reset(&self, room_id: &RoomId, token: &str) -> Result<(), TallyError> {
        self.authorized(room_id, token)?.state().reset()
    }

    pub fn set_visible(
        &self,
        room_id: &RoomId,
        token: &str,
        visible: bool,
    ) -> Result<(), TallyError> {
        self.authorized(room_id, token)?.state().set_visible(visible)
    }

    /// Flip visibility. Returns the new value.
    pub fn toggle_visible(&self, room_id: &RoomId, token: &str) -> Result<bool, TallyError> {
        self.authorized(room_id, token)?.state().toggle_visible()
    }

    pub fn snapshot(&self, room_id: &RoomId) -> Result<RoomSnapshot, TallyError> {
        self.room(room_id)?.state().snapshot()
    }

    /// Join `name` and open a snapshot stream for them. The participant
    /// leaves when the stream ends.
    #[instrument(skip_all, name = "tally.room.subscribe", fields(room_id = %room_id))]
    pub async fn subscribe(
        &self,
        room_id: &RoomId,
        name: &str,
    ) -> Result<Subscription, TallyError> {
        let name = ParticipantName::parse(name)?;
        let room = self.room(room_id)?;

        let (sink, receiver) =
            SubscriberSink::channel(name.as_str(), self.settings.subscriber_queue_depth);
        let subscriber_id = sink.id();
        room.state().join_session(&name, subscriber_id)?;
        let mut session = Subscription::pending(
            Arc::clone(&room),
            SessionRole::Participant(name),
            subscriber_id,
            receiver,
        );

        // On error the pending session is dropped, which leaves the room.
        room.broadcaster().subscribe(sink).await?;
        let snapshot = room.state().snapshot()?;
        session.activate(snapshot);

        debug!(
            target: "tally.room.registry",
            room_id = %room_id,
            subscriber_id = %subscriber_id,
            "Participant subscribed"
        );
        Ok(session)
    }

    /// Open the facilitator's snapshot stream. Hides votes on connect; the
    /// room is torn down when the stream ends.
    #[instrument(skip_all, name = "tally.room.subscribe_facilitator", fields(room_id = %room_id))]
    pub async fn subscribe_facilitator(
        &self,
        room_id: &RoomId,
        token: &str,
    ) -> Result<Subscription, TallyError> {
        let room = self.authorized(room_id, token)?;
        room.state().claim_facilitator()?;

        let (sink, receiver) =
            SubscriberSink::channel("facilitator", self.settings.subscriber_queue_depth);
        let subscriber_id = sink.id();
        let mut session = Subscription::pending(
            Arc::clone(&room),
            SessionRole::Facilitator,
            subscriber_id,
            receiver,
        );

        room.broadcaster().subscribe(sink).await?;
        room.state().set_visible(false)?;
        let snapshot = room.state().snapshot()?;
        session.activate(snapshot);

        info!(
            target: "tally.room.registry",
            room_id = %room_id,
            subscriber_id = %subscriber_id,
            "Facilitator connected"
        );
        Ok(session)
    }

    /// Remove rooms torn down at least `retention` ago. Returns how many
    /// were removed.
    pub fn sweep_inactive(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut rooms = self.write_rooms();
        let before = rooms.len();

        rooms.retain(|_, room| match room.state().torn_down_at() {
            Some(at) => now.saturating_duration_since(at) < retention,
            None => true,
        });

        let removed = before - rooms.len();
        if removed > 0 {
            prom::record_rooms_reaped(removed);
            debug!(
                target: "tally.room.registry",
                removed,
                remaining = rooms.len(),
                "Swept inactive rooms"
            );
        }
        removed
    }

    #[must_use]
    pub fn status(&self) -> RegistryStatus {
        let rooms = self.read_rooms();
        let active: Vec<_> = rooms.values().filter(|room| room.is_active()).collect();

        RegistryStatus {
            rooms: rooms.len(),
            active_rooms: active.len(),
            participants: active
                .iter()
                .map(|room| room.state().participant_count())
                .sum(),
            subscribers: self.metrics.snapshot().subscribers_active,
            congested_rooms: active
                .iter()
                .filter(|room| room.broadcaster().mailbox_level() != MailboxLevel::Normal)
                .count(),
            shutting_down: self.is_shutting_down(),
        }
    }

    /// Publish room and subscriber gauges.
    pub fn publish_gauges(&self) {
        let status = self.status();
        prom::set_rooms_active(status.active_rooms);
        prom::set_subscribers_active(status.subscribers);
    }

    /// Tear down every room and wait up to `timeout` for the broadcasters to
    /// stop. Returns `false` on timeout.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel_token.cancel();

        let rooms: Vec<Arc<Room>> = self.read_rooms().values().cloned().collect();
        let mut tasks = Vec::with_capacity(rooms.len());
        for room in &rooms {
            room.teardown(TeardownReason::Shutdown);
            if let Some(task) = room.take_task() {
                tasks.push(task);
            }
        }

        info!(
            target: "tally.room.registry",
            rooms = rooms.len(),
            "Shutting down rooms"
        );

        let joined = tokio::time::timeout(timeout, futures::future::join_all(tasks)).await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(target: "tally.room.registry", error = %e, "Broadcaster task failed");
                    }
                }
                true
            }
            Err(_) => {
                warn!(
                    target: "tally.room.registry",
                    timeout_secs = timeout.as_secs(),
                    "Timed out waiting for broadcasters to stop"
                );
                false
            }
        }
    }

    fn authorized(&self, room_id: &RoomId, token: &str) -> Result<Arc<Room>, TallyError> {
        let room = self.room(room_id)?;
        if !room.state().authorize(token) {
            debug!(target: "tally.room.registry", room_id = %room_id, "Admission token rejected");
            return Err(TallyError::Unauthorized);
        }
        Ok(room)
    }

    // Lock bodies never panic, so poisoning cannot leave the map half-updated.
    fn read_rooms(&self) -> RwLockReadGuard<'_, HashMap<RoomId, Arc<Room>>> {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_rooms(&self) -> RwLockWriteGuard<'_, HashMap<RoomId, Arc<Room>>> {
        self.rooms.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Periodically remove torn-down rooms older than `retention` and refresh
/// the room gauges. Runs until `cancel_token` is cancelled.
pub async fn run_sweeper(
    registry: Arc<RoomRegistry>,
    interval: Duration,
    retention: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(
        target: "tally.room.registry",
        interval_secs = interval.as_secs(),
        retention_secs = retention.as_secs(),
        "Room sweeper started"
    );

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                registry.sweep_inactive(retention);
                registry.publish_gauges();
            }
        }
    }

    info!(target: "tally.room.registry", "Room sweeper stopped");
}
