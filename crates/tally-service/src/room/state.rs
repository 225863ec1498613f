//! Per-room vote state.
//!
//! Votes, the masked view, visibility and lifecycle live behind one mutex so
//! a reset can never interleave with a vote. Every successful mutation raises
//! exactly one pulse on the room's broadcaster after the lock is released.
//!
//! The masked view never carries a real value; it only distinguishes
//! participants who have voted from those who have not.
//!
//! A participant joined through a subscription is owned by that session.
//! Session cleanup only removes the entry it owns, so a name freed by an
//! explicit leave and taken again is never evicted by the stale session.

use crate::errors::TallyError;
use crate::room::broadcaster::BroadcasterHandle;
use crate::room::session::SubscriberId;
use crate::room::tokens::AdmissionGuard;

use common::types::{ParticipantName, RoomId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{debug, error};

/// A participant's entry in the masked view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskedVote {
    Unset,
    Masked,
}

/// Externally visible room state.
///
/// Serializes as a flat JSON object keyed by participant name: real values
/// (`null` for no vote) when visible, `"unset"`/`"masked"` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RoomSnapshot {
    Visible(BTreeMap<String, Option<u32>>),
    Masked(BTreeMap<String, MaskedVote>),
}

impl RoomSnapshot {
    #[must_use]
    pub fn is_visible(&self) -> bool {
        matches!(self, RoomSnapshot::Visible(_))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            RoomSnapshot::Visible(votes) => votes.len(),
            RoomSnapshot::Masked(masked) => masked.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        match self {
            RoomSnapshot::Visible(votes) => votes.contains_key(name),
            RoomSnapshot::Masked(masked) => masked.contains_key(name),
        }
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> Result<String, TallyError> {
        serde_json::to_string(self)
            .map_err(|e| TallyError::Internal(format!("snapshot serialization failed: {e}")))
    }
}

/// Room lifecycle. `TornDown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    TornDown,
}

#[derive(Debug)]
struct Ballots {
    votes: HashMap<ParticipantName, Option<u32>>,
    masked: HashMap<ParticipantName, MaskedVote>,
    /// Participants joined through a live subscription, by owning session.
    owners: HashMap<ParticipantName, SubscriberId>,
    visible: bool,
    lifecycle: Lifecycle,
    torn_down_at: Option<Instant>,
}

impl Ballots {
    fn new() -> Self {
        Self {
            votes: HashMap::new(),
            masked: HashMap::new(),
            owners: HashMap::new(),
            visible: false,
            lifecycle: Lifecycle::Active,
            torn_down_at: None,
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        if self.visible {
            RoomSnapshot::Visible(
                self.votes
                    .iter()
                    .map(|(name, vote)| (name.as_str().to_string(), *vote))
                    .collect(),
            )
        } else {
            RoomSnapshot::Masked(
                self.masked
                    .iter()
                    .map(|(name, mask)| (name.as_str().to_string(), *mask))
                    .collect(),
            )
        }
    }

    fn keys_in_lockstep(&self) -> bool {
        self.votes.len() == self.masked.len()
            && self.votes.keys().all(|name| self.masked.contains_key(name))
            && self.owners.keys().all(|name| self.votes.contains_key(name))
    }
}

/// State container for one room.
pub struct RoomState {
    id: RoomId,
    max_participants: usize,
    ballots: Mutex<Ballots>,
    facilitator_present: AtomicBool,
    admission: AdmissionGuard,
    broadcaster: BroadcasterHandle,
}

impl std::fmt::Debug for RoomState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomState")
            .field("id", &self.id)
            .field("max_participants", &self.max_participants)
            .field(
                "facilitator_present",
                &self.facilitator_present.load(Ordering::SeqCst),
            )
            .finish_non_exhaustive()
    }
}

impl RoomState {
    #[must_use]
    pub fn new(
        id: RoomId,
        max_participants: usize,
        admission: AdmissionGuard,
        broadcaster: BroadcasterHandle,
    ) -> Self {
        Self {
            id,
            max_participants,
            ballots: Mutex::new(Ballots::new()),
            facilitator_present: AtomicBool::new(false),
            admission,
            broadcaster,
        }
    }

    #[must_use]
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn max_participants(&self) -> usize {
        self.max_participants
    }

    /// Add a participant with no vote. Returns the snapshot after joining.
    pub fn join(&self, name: &ParticipantName) -> Result<RoomSnapshot, TallyError> {
        self.admit(name, None)
    }

    /// Join on behalf of a subscription; the entry is owned by `owner`.
    pub fn join_session(
        &self,
        name: &ParticipantName,
        owner: SubscriberId,
    ) -> Result<RoomSnapshot, TallyError> {
        self.admit(name, Some(owner))
    }

    fn admit(
        &self,
        name: &ParticipantName,
        owner: Option<SubscriberId>,
    ) -> Result<RoomSnapshot, TallyError> {
        let snapshot = {
            let mut ballots = self.lock_active()?;

            if ballots.votes.contains_key(name) {
                return Err(TallyError::AlreadyPresent);
            }
            if ballots.votes.len() >= self.max_participants {
                return Err(TallyError::RoomFull {
                    max: self.max_participants,
                });
            }

            ballots.votes.insert(name.clone(), None);
            ballots.masked.insert(name.clone(), MaskedVote::Unset);
            if let Some(owner) = owner {
                ballots.owners.insert(name.clone(), owner);
            }
            self.check_lockstep(&ballots, "join")?;

            ballots.snapshot()
        };

        debug!(
            target: "tally.room.state",
            room_id = %self.id,
            participant = %name,
            "Participant joined"
        );
        self.broadcaster.pulse();
        Ok(snapshot)
    }

    /// Remove a participant. Returns whether anyone was removed; removing an
    /// absent name is a no-op and raises no pulse.
    pub fn leave(&self, name: &ParticipantName) -> Result<bool, TallyError> {
        let removed = {
            let mut ballots = self.lock_active()?;
            let removed = ballots.votes.remove(name).is_some();
            ballots.masked.remove(name);
            ballots.owners.remove(name);
            self.check_lockstep(&ballots, "leave")?;
            removed
        };

        if removed {
            debug!(
                target: "tally.room.state",
                room_id = %self.id,
                participant = %name,
                "Participant left"
            );
            self.broadcaster.pulse();
        }
        Ok(removed)
    }

    /// Remove `name` only if `owner` is the session that joined it. Returns
    /// whether anyone was removed.
    pub fn leave_session(
        &self,
        name: &ParticipantName,
        owner: SubscriberId,
    ) -> Result<bool, TallyError> {
        let removed = {
            let mut ballots = self.lock_active()?;
            if ballots.owners.get(name) != Some(&owner) {
                return Ok(false);
            }
            ballots.owners.remove(name);
            ballots.votes.remove(name);
            ballots.masked.remove(name);
            self.check_lockstep(&ballots, "leave_session")?;
            true
        };

        if removed {
            debug!(
                target: "tally.room.state",
                room_id = %self.id,
                participant = %name,
                subscriber_id = %owner,
                "Participant session left"
            );
            self.broadcaster.pulse();
        }
        Ok(removed)
    }

    /// Record a vote for a joined participant.
    pub fn set_vote(&self, name: &ParticipantName, value: u32) -> Result<(), TallyError> {
        {
            let mut ballots = self.lock_active()?;

            let Some(vote) = ballots.votes.get_mut(name) else {
                return Err(TallyError::NotPresent);
            };
            *vote = Some(value);
            ballots.masked.insert(name.clone(), MaskedVote::Masked);
            self.check_lockstep(&ballots, "set_vote")?;
        }

        self.broadcaster.pulse();
        Ok(())
    }

    /// Clear every vote and hide the view.
    pub fn reset(&self) -> Result<(), TallyError> {
        {
            let mut ballots = self.lock_active()?;
            let Ballots {
                votes,
                masked,
                visible,
                ..
            } = &mut *ballots;

            votes.values_mut().for_each(|vote| *vote = None);
            masked.values_mut().for_each(|mask| *mask = MaskedVote::Unset);
            *visible = false;
            self.check_lockstep(&ballots, "reset")?;
        }

        debug!(target: "tally.room.state", room_id = %self.id, "Round reset");
        self.broadcaster.pulse();
        Ok(())
    }

    pub fn set_visible(&self, visible: bool) -> Result<(), TallyError> {
        self.lock_active()?.visible = visible;
        self.broadcaster.pulse();
        Ok(())
    }

    /// Flip visibility. Returns the new value.
    pub fn toggle_visible(&self) -> Result<bool, TallyError> {
        let visible = {
            let mut ballots = self.lock_active()?;
            ballots.visible = !ballots.visible;
            ballots.visible
        };
        self.broadcaster.pulse();
        Ok(visible)
    }

    /// Current view: real votes if visible, masked otherwise. Raises no pulse.
    pub fn snapshot(&self) -> Result<RoomSnapshot, TallyError> {
        Ok(self.lock_active()?.snapshot())
    }

    /// Constant-time admission token check.
    #[must_use]
    pub fn authorize(&self, token: &str) -> bool {
        self.admission.verify(token)
    }

    /// Mark the room torn down and clear its votes. Returns `false` if it
    /// already was.
    pub fn teardown(&self) -> bool {
        // Teardown must always complete; a poisoned lock still holds a
        // `Ballots` we can clear.
        let mut ballots = self.ballots.lock().unwrap_or_else(PoisonError::into_inner);
        if ballots.lifecycle == Lifecycle::TornDown {
            return false;
        }

        ballots.lifecycle = Lifecycle::TornDown;
        ballots.torn_down_at = Some(Instant::now());
        ballots.votes.clear();
        ballots.masked.clear();
        ballots.owners.clear();
        ballots.visible = false;
        true
    }

    /// Claim the single facilitator slot.
    pub fn claim_facilitator(&self) -> Result<(), TallyError> {
        if !self.is_active() {
            return Err(TallyError::RoomInactive(self.id.to_string()));
        }
        self.facilitator_present
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| TallyError::FacilitatorPresent)
    }

    pub fn release_facilitator(&self) {
        self.facilitator_present.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn facilitator_present(&self) -> bool {
        self.facilitator_present.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.ballots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lifecycle
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lifecycle() == Lifecycle::Active
    }

    /// When the room was torn down, if it has been.
    #[must_use]
    pub fn torn_down_at(&self) -> Option<Instant> {
        self.ballots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .torn_down_at
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.ballots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .votes
            .len()
    }

    fn lock_active(&self) -> Result<MutexGuard<'_, Ballots>, TallyError> {
        let ballots = self.ballots.lock().map_err(|_| {
            error!(target: "tally.room.state", room_id = %self.id, "Room state lock poisoned");
            TallyError::Internal("room state lock poisoned".to_string())
        })?;

        if ballots.lifecycle == Lifecycle::TornDown {
            return Err(TallyError::RoomInactive(self.id.to_string()));
        }
        Ok(ballots)
    }

    fn check_lockstep(&self, ballots: &Ballots, operation: &'static str) -> Result<(), TallyError> {
        if ballots.keys_in_lockstep() {
            return Ok(());
        }
        error!(
            target: "tally.room.state",
            room_id = %self.id,
            operation,
            votes = ballots.votes.len(),
            masked = ballots.masked.len(),
            "Vote and masked key sets diverged"
        );
        Err(TallyError::Internal(format!(
            "vote key sets diverged during {operation}"
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::room::broadcaster::Broadcaster;
    use crate::room::metrics::RoomMetrics;
    use common::secret::ExposeSecret;
    use tokio_util::sync::CancellationToken;

    fn name(raw: &str) -> ParticipantName {
        ParticipantName::parse(raw).unwrap()
    }

    fn room(max: usize) -> (RoomState, BroadcasterHandle) {
        let id = RoomId::new("room-test");
        let (handle, _task) = Broadcaster::spawn(
            id.clone(),
            16,
            CancellationToken::new(),
            RoomMetrics::new(),
        );
        let (guard, _token) = AdmissionGuard::issue().unwrap();
        (RoomState::new(id, max, guard, handle.clone()), handle)
    }

    fn masked(entries: &[(&str, MaskedVote)]) -> RoomSnapshot {
        RoomSnapshot::Masked(entries.iter().map(|(n, m)| ((*n).to_string(), *m)).collect())
    }

    fn visible(entries: &[(&str, Option<u32>)]) -> RoomSnapshot {
        RoomSnapshot::Visible(entries.iter().map(|(n, v)| ((*n).to_string(), *v)).collect())
    }

    #[tokio::test]
    async fn test_join_adds_unset_entry() {
        let (state, _b) = room(2);

        let snapshot = state.join(&name("alice")).unwrap();
        assert_eq!(snapshot, masked(&[("alice", MaskedVote::Unset)]));
        assert_eq!(state.participant_count(), 1);
    }

    #[tokio::test]
    async fn test_join_rejects_duplicates_and_full() {
        let (state, _b) = room(2);

        state.join(&name("alice")).unwrap();
        assert!(matches!(
            state.join(&name("alice")),
            Err(TallyError::AlreadyPresent)
        ));

        state.join(&name("bob")).unwrap();
        assert!(matches!(
            state.join(&name("carol")),
            Err(TallyError::RoomFull { max: 2 })
        ));

        // Rejected joins never mutate
        assert_eq!(state.participant_count(), 2);
        assert!(!state.snapshot().unwrap().contains("carol"));
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let (state, _b) = room(2);

        state.join(&name("alice")).unwrap();
        assert!(state.leave(&name("alice")).unwrap());
        assert!(!state.leave(&name("alice")).unwrap());
        assert!(state.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_leave_only_removes_owned_entry() {
        let (state, _b) = room(4);
        let old_session = SubscriberId::new();
        let new_session = SubscriberId::new();

        state.join_session(&name("alice"), old_session).unwrap();
        assert!(state.leave(&name("alice")).unwrap());

        state.join_session(&name("alice"), new_session).unwrap();
        state.set_vote(&name("alice"), 8).unwrap();

        assert!(!state.leave_session(&name("alice"), old_session).unwrap());
        assert_eq!(
            state.snapshot().unwrap(),
            masked(&[("alice", MaskedVote::Masked)])
        );

        assert!(state.leave_session(&name("alice"), new_session).unwrap());
        assert!(state.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_leave_ignores_plain_join() {
        let (state, _b) = room(4);
        state.join(&name("bob")).unwrap();

        assert!(!state.leave_session(&name("bob"), SubscriberId::new()).unwrap());
        assert!(state.snapshot().unwrap().contains("bob"));
    }

    #[tokio::test]
    async fn test_set_vote_requires_presence() {
        let (state, _b) = room(2);
        assert!(matches!(
            state.set_vote(&name("ghost"), 3),
            Err(TallyError::NotPresent)
        ));
    }

    #[tokio::test]
    async fn test_masked_view_hides_values() {
        let (state, _b) = room(4);

        state.join(&name("alice")).unwrap();
        state.join(&name("bob")).unwrap();
        state.set_vote(&name("alice"), 13).unwrap();

        let snapshot = state.snapshot().unwrap();
        assert_eq!(
            snapshot,
            masked(&[("alice", MaskedVote::Masked), ("bob", MaskedVote::Unset)])
        );
        assert!(!snapshot.to_json().unwrap().contains("13"));
    }

    #[tokio::test]
    async fn test_visible_view_shows_values() {
        let (state, _b) = room(4);

        state.join(&name("alice")).unwrap();
        state.join(&name("bob")).unwrap();
        state.set_vote(&name("alice"), 5).unwrap();
        state.set_visible(true).unwrap();

        assert_eq!(
            state.snapshot().unwrap(),
            visible(&[("alice", Some(5)), ("bob", None)])
        );
    }

    #[tokio::test]
    async fn test_reset_clears_votes_and_hides() {
        let (state, _b) = room(4);

        state.join(&name("alice")).unwrap();
        state.join(&name("bob")).unwrap();
        state.set_vote(&name("alice"), 8).unwrap();
        state.set_vote(&name("bob"), 3).unwrap();
        state.set_visible(true).unwrap();

        state.reset().unwrap();
        assert_eq!(
            state.snapshot().unwrap(),
            masked(&[("alice", MaskedVote::Unset), ("bob", MaskedVote::Unset)])
        );

        state.set_visible(true).unwrap();
        assert_eq!(
            state.snapshot().unwrap(),
            visible(&[("alice", None), ("bob", None)])
        );
    }

    #[tokio::test]
    async fn test_toggle_visible_flips() {
        let (state, _b) = room(2);
        assert!(state.toggle_visible().unwrap());
        assert!(!state.toggle_visible().unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_json_shape() {
        let (state, _b) = room(2);
        state.join(&name("alice")).unwrap();
        state.set_vote(&name("alice"), 5).unwrap();

        assert_eq!(state.snapshot().unwrap().to_json().unwrap(), r#"{"alice":"masked"}"#);
        state.set_visible(true).unwrap();
        assert_eq!(state.snapshot().unwrap().to_json().unwrap(), r#"{"alice":5}"#);
    }

    #[tokio::test]
    async fn test_teardown_is_terminal_and_idempotent() {
        let (state, _b) = room(2);
        state.join(&name("alice")).unwrap();

        assert!(state.teardown());
        assert!(!state.teardown());
        assert_eq!(state.lifecycle(), Lifecycle::TornDown);
        assert!(state.torn_down_at().is_some());
        assert_eq!(state.participant_count(), 0);

        assert!(matches!(state.join(&name("bob")), Err(TallyError::RoomInactive(_))));
        assert!(matches!(state.set_vote(&name("alice"), 1), Err(TallyError::RoomInactive(_))));
        assert!(matches!(state.reset(), Err(TallyError::RoomInactive(_))));
        assert!(matches!(state.set_visible(true), Err(TallyError::RoomInactive(_))));
        assert!(matches!(state.toggle_visible(), Err(TallyError::RoomInactive(_))));
        assert!(matches!(state.snapshot(), Err(TallyError::RoomInactive(_))));
        assert!(matches!(state.leave(&name("alice")), Err(TallyError::RoomInactive(_))));
    }

    #[tokio::test]
    async fn test_facilitator_claim_is_exclusive() {
        let (state, _b) = room(2);

        state.claim_facilitator().unwrap();
        assert!(matches!(
            state.claim_facilitator(),
            Err(TallyError::FacilitatorPresent)
        ));

        state.release_facilitator();
        state.claim_facilitator().unwrap();
    }

    #[tokio::test]
    async fn test_facilitator_claim_rejected_after_teardown() {
        let (state, _b) = room(2);
        state.teardown();
        assert!(matches!(
            state.claim_facilitator(),
            Err(TallyError::RoomInactive(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_facilitator_claims_admit_one() {
        let (state, _b) = room(2);
        let state = std::sync::Arc::new(state);

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let state = std::sync::Arc::clone(&state);
            tasks.push(tokio::spawn(async move { state.claim_facilitator().is_ok() }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_key_sets_stay_in_lockstep() {
        let (state, _b) = room(5);
        let names = ["a", "b", "c", "d", "e", "f"];

        for pair in names.windows(2) {
            let [first, second] = pair else { continue };
            let _ = state.join(&name(first));
            let _ = state.join(&name(second));
            assert!(state.ballots.lock().unwrap().keys_in_lockstep());

            state.leave(&name(first)).unwrap();
            assert!(state.ballots.lock().unwrap().keys_in_lockstep());
        }
        let _ = state.join(&name("g"));
        assert!(state.ballots.lock().unwrap().keys_in_lockstep());
    }

    #[tokio::test]
    async fn test_authorize() {
        let id = RoomId::new("room-auth");
        let (handle, _task) =
            Broadcaster::spawn(id.clone(), 16, CancellationToken::new(), RoomMetrics::new());
        let (guard, token) = AdmissionGuard::issue().unwrap();
        let state = RoomState::new(id, 2, guard, handle);

        assert!(state.authorize(token.expose_secret()));
        assert!(!state.authorize("nope"));
    }
}
