//! Room lifecycle and fan-out engine.
//!
//! - [`state`]: per-room votes, masked view, visibility, lifecycle
//! - [`broadcaster`]: single-owner subscriber set and pulse relay
//! - [`session`]: subscriber sessions and snapshot streams
//! - [`registry`]: room id to room map and the external operations
//!
//! Mutations go through [`state::RoomState`], which pulses the room's
//! broadcaster. Sessions receive content-free notifications and re-fetch the
//! snapshot themselves.

pub mod broadcaster;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod state;
pub mod tokens;

pub use broadcaster::{Broadcaster, BroadcasterHandle};
pub use registry::{run_sweeper, CreatedRoom, RegistryStatus, RoomRegistry};
pub use session::{SessionRole, SessionState, Subscription};
pub use state::{Lifecycle, MaskedVote, RoomSnapshot, RoomState};

use crate::config::RoomSettings;
use crate::errors::TallyError;
use crate::observability::metrics as prom;
use crate::room::metrics::RoomMetrics;
use crate::room::tokens::AdmissionGuard;

use chrono::{DateTime, Utc};
use common::secret::SecretString;
use common::types::RoomId;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Why a room was torn down (metrics label).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// The facilitator's session ended.
    FacilitatorLeft,
    /// The process is shutting down.
    Shutdown,
}

impl TeardownReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TeardownReason::FacilitatorLeft => "facilitator_left",
            TeardownReason::Shutdown => "shutdown",
        }
    }
}

/// A room: its state and its broadcaster.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    state: RoomState,
    broadcaster: BroadcasterHandle,
    created_at: DateTime<Utc>,
    opened: Instant,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<RoomMetrics>,
}

impl Room {
    /// Open a room: issue its admission token and start its broadcaster
    /// under a child of `parent_token`.
    pub fn open(
        id: RoomId,
        settings: &RoomSettings,
        parent_token: &CancellationToken,
        metrics: Arc<RoomMetrics>,
    ) -> Result<(Arc<Self>, SecretString), TallyError> {
        let (admission, token) = AdmissionGuard::issue()?;

        let (broadcaster, task) = Broadcaster::spawn(
            id.clone(),
            settings.broadcaster_mailbox,
            parent_token.child_token(),
            Arc::clone(&metrics),
        );

        let state = RoomState::new(
            id.clone(),
            settings.max_participants,
            admission,
            broadcaster.clone(),
        );

        let room = Arc::new(Self {
            id,
            state,
            broadcaster,
            created_at: Utc::now(),
            opened: Instant::now(),
            task: Mutex::new(Some(task)),
            metrics,
        });

        Ok((room, token))
    }

    #[must_use]
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> &RoomState {
        &self.state
    }

    #[must_use]
    pub fn broadcaster(&self) -> &BroadcasterHandle {
        &self.broadcaster
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Tear the room down: mark the state inactive, then stop the
    /// broadcaster, which closes every session. Returns `true` only for the
    /// call that tore it down.
    pub fn teardown(&self, reason: TeardownReason) -> bool {
        let won = self.state.teardown();
        // Always stop the broadcaster, even if another path already tore
        // down the state; its own flag keeps this a no-op after the first.
        self.broadcaster.teardown();

        if won {
            self.metrics.room_torn_down();
            prom::record_room_torn_down(reason.as_str(), self.opened.elapsed());
            info!(
                target: "tally.room.registry",
                room_id = %self.id,
                reason = reason.as_str(),
                "Room torn down"
            );
        }
        won
    }

    /// Take the broadcaster task handle, for awaiting its exit.
    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
