//! # Tally Test Utilities
//!
//! Shared test utilities for the Tally service.
//!
//! ## Modules
//!
//! - `fixtures` - Pre-configured registries and rooms
//! - `assertions` - Subscription and snapshot verification helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let room = TestRoom::create(2);
//!     let mut alice = room.subscribe("alice").await;
//!
//!     let first = next_snapshot(&mut alice).await;
//!     assert_masked(&first, &[("alice", MaskedVote::Unset)]);
//! }
//! ```

pub mod assertions;
pub mod fixtures;

pub use assertions::*;
pub use fixtures::*;
