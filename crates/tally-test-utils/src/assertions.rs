//! Subscription and snapshot verification helpers.

use std::collections::BTreeMap;
use std::time::Duration;
use tally_service::room::{MaskedVote, RoomSnapshot, SessionState, Subscription};

/// How long helpers wait for a subscription to produce something.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait for the next snapshot, panicking if the session ends or stalls.
pub async fn next_snapshot(subscription: &mut Subscription) -> RoomSnapshot {
    tokio::time::timeout(RECV_TIMEOUT, subscription.next())
        .await
        .expect("Timed out waiting for a snapshot")
        .expect("Subscription ended while waiting for a snapshot")
}

/// Assert that nothing arrives within `wait`.
pub async fn assert_quiet(subscription: &mut Subscription, wait: Duration) {
    if let Ok(item) = tokio::time::timeout(wait, subscription.next()).await {
        panic!("Expected no snapshot, got {item:?}");
    }
}

/// Drain until the session ends and assert its terminal state.
pub async fn assert_ends_with(subscription: &mut Subscription, expected: SessionState) {
    tokio::time::timeout(RECV_TIMEOUT, async {
        while subscription.next().await.is_some() {}
    })
    .await
    .expect("Timed out waiting for the subscription to end");

    assert_eq!(subscription.state(), expected);
}

/// Assert a masked snapshot with exactly these entries.
pub fn assert_masked(snapshot: &RoomSnapshot, expected: &[(&str, MaskedVote)]) {
    let expected: BTreeMap<String, MaskedVote> = expected
        .iter()
        .map(|(name, vote)| ((*name).to_string(), *vote))
        .collect();
    match snapshot {
        RoomSnapshot::Masked(entries) => assert_eq!(entries, &expected),
        RoomSnapshot::Visible(_) => panic!("Expected a masked snapshot, got {snapshot:?}"),
    }
}

/// Assert a visible snapshot with exactly these entries.
pub fn assert_visible(snapshot: &RoomSnapshot, expected: &[(&str, Option<u32>)]) {
    let expected: BTreeMap<String, Option<u32>> = expected
        .iter()
        .map(|(name, vote)| ((*name).to_string(), *vote))
        .collect();
    match snapshot {
        RoomSnapshot::Visible(entries) => assert_eq!(entries, &expected),
        RoomSnapshot::Masked(_) => panic!("Expected a visible snapshot, got {snapshot:?}"),
    }
}

/// Parse a snapshot's JSON form for wire-format assertions.
pub fn snapshot_json(snapshot: &RoomSnapshot) -> serde_json::Value {
    serde_json::to_value(snapshot).expect("Snapshot should serialize")
}
