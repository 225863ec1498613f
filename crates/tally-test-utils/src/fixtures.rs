//! Pre-configured registries and rooms.

use common::secret::{ExposeSecret, SecretString};
use common::types::RoomId;
use std::sync::Arc;
use tally_service::config::RoomSettings;
use tally_service::room::{RoomRegistry, RoomSnapshot, Subscription};
use tokio_util::sync::CancellationToken;

/// Room settings with small queues so overflow is easy to provoke.
#[must_use]
pub fn test_settings(max_participants: usize) -> RoomSettings {
    RoomSettings {
        max_participants,
        subscriber_queue_depth: 8,
        broadcaster_mailbox: 32,
    }
}

/// A registry with its own root token.
#[must_use]
pub fn test_registry(max_participants: usize, max_rooms: usize) -> Arc<RoomRegistry> {
    Arc::new(RoomRegistry::new(
        test_settings(max_participants),
        max_rooms,
        CancellationToken::new(),
    ))
}

/// A freshly created room with its admission token.
pub struct TestRoom {
    pub registry: Arc<RoomRegistry>,
    pub room_id: RoomId,
    pub admission_token: SecretString,
}

impl TestRoom {
    /// Create a room in a new registry.
    pub fn create(max_participants: usize) -> Self {
        Self::create_in(test_registry(max_participants, 16))
    }

    /// Create a room in an existing registry.
    pub fn create_in(registry: Arc<RoomRegistry>) -> Self {
        let created = registry
            .create_room()
            .expect("Failed to create test room");
        Self {
            registry,
            room_id: created.room_id,
            admission_token: created.admission_token,
        }
    }

    pub fn token(&self) -> &str {
        self.admission_token.expose_secret()
    }

    /// Subscribe a participant, panicking on failure.
    pub async fn subscribe(&self, name: &str) -> Subscription {
        self.registry
            .subscribe(&self.room_id, name)
            .await
            .unwrap_or_else(|e| panic!("Failed to subscribe {name}: {e}"))
    }

    /// Subscribe the facilitator, panicking on failure.
    pub async fn facilitator(&self) -> Subscription {
        self.registry
            .subscribe_facilitator(&self.room_id, self.token())
            .await
            .unwrap_or_else(|e| panic!("Failed to subscribe facilitator: {e}"))
    }

    pub fn vote(&self, name: &str, value: u32) {
        self.registry
            .set_vote(&self.room_id, name, value)
            .unwrap_or_else(|e| panic!("Failed to vote for {name}: {e}"));
    }

    pub fn reveal(&self) {
        self.registry
            .set_visible(&self.room_id, self.token(), true)
            .expect("Failed to reveal votes");
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        self.registry
            .snapshot(&self.room_id)
            .expect("Failed to read snapshot")
    }
}
