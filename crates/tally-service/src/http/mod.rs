//! HTTP routes for the Tally service.
//!
//! The room core is transport-agnostic; this module is a thin axum layer
//! over [`RoomRegistry`] plus server-sent-event streams for subscriptions.

pub mod handlers;

use crate::room::RoomRegistry;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Header carrying the facilitator's admission token.
pub const ADMISSION_TOKEN_HEADER: &str = "x-admission-token";

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
}

/// Build the room routes.
///
/// - `POST /api/v1/rooms` - Create a room
/// - `POST /api/v1/rooms/:room_id/participants` - Join
/// - `DELETE /api/v1/rooms/:room_id/participants/:name` - Leave
/// - `POST /api/v1/rooms/:room_id/votes` - Set a vote
/// - `PUT /api/v1/rooms/:room_id/reset` - Reset the round (token)
/// - `POST /api/v1/rooms/:room_id/visibility` - Set visibility (token)
/// - `POST /api/v1/rooms/:room_id/visibility/toggle` - Toggle visibility (token)
/// - `GET /api/v1/rooms/:room_id/snapshot` - Current view
/// - `GET /api/v1/rooms/:room_id/events?name=` - Participant SSE stream
/// - `GET /api/v1/rooms/:room_id/facilitator/events` - Facilitator SSE stream (token)
pub fn build_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/rooms", post(handlers::create_room))
        .route(
            "/api/v1/rooms/:room_id/participants",
            post(handlers::join_room),
        )
        .route(
            "/api/v1/rooms/:room_id/participants/:name",
            delete(handlers::leave_room),
        )
        .route("/api/v1/rooms/:room_id/votes", post(handlers::set_vote))
        .route("/api/v1/rooms/:room_id/reset", put(handlers::reset_round))
        .route(
            "/api/v1/rooms/:room_id/visibility",
            post(handlers::set_visibility),
        )
        .route(
            "/api/v1/rooms/:room_id/visibility/toggle",
            post(handlers::toggle_visibility),
        )
        .route("/api/v1/rooms/:room_id/snapshot", get(handlers::get_snapshot))
        .route(
            "/api/v1/rooms/:room_id/events",
            get(handlers::participant_events),
        )
        .route(
            "/api/v1/rooms/:room_id/facilitator/events",
            get(handlers::facilitator_events),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
