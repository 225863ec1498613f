//! Tally Service Library
//!
//! Live blind-estimation rooms. Participants join a room by name and cast
//! numeric votes that stay masked until the facilitator reveals them. Every
//! change is fanned out to the room's live subscribers.
//!
//! # Architecture
//!
//! ```text
//! RoomRegistry (one per process, owns the root CancellationToken)
//! └── Room (one per created room)
//!     ├── RoomState (ballots, visibility, lifecycle; std Mutex)
//!     └── Broadcaster (actor task, child token)
//!         └── SubscriberSink (one per live Subscription)
//! ```
//!
//! State mutations happen under the room's lock. After the lock is released
//! the broadcaster is pulsed; subscribers then pull a fresh snapshot, so a
//! slow subscriber never sees a stale or partial view.
//!
//! # Modules
//!
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with HTTP status and error codes
//! - [`http`] - axum routes and server-sent-event streams
//! - [`observability`] - Prometheus metrics and health probes
//! - [`room`] - Room state, broadcaster, sessions and registry

pub mod config;
pub mod errors;
pub mod http;
pub mod observability;
pub mod room;
