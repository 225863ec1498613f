//! Room handlers.
//!
//! Request bodies are deserialized manually so malformed JSON returns 400
//! with the standard error body instead of axum's default 422.
//!
//! Every handler records `tally_operations_total{operation,status}`.

use crate::errors::TallyError;
use crate::http::{AppState, ADMISSION_TOKEN_HEADER};
use crate::observability::metrics as prom;
use crate::room::{RoomSnapshot, Subscription};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use common::secret::ExposeSecret;
use common::types::RoomId;
use futures::stream::{Stream, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Serialize)]
pub struct CreateRoomResponse {
    pub room_id: RoomId,
    pub admission_token: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub name: String,
    pub value: u32,
}

#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    pub visible: bool,
}

#[derive(Debug, Serialize)]
pub struct VisibilityResponse {
    pub visible: bool,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub name: Option<String>,
}

/// Record the outcome and pass the result through.
fn observe<T>(
    operation: &'static str,
    result: Result<T, TallyError>,
    ok: StatusCode,
) -> Result<T, TallyError> {
    let status = match &result {
        Ok(_) => ok,
        Err(e) => e.status_code(),
    };
    prom::record_operation(operation, status.as_u16());
    result
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, TallyError> {
    serde_json::from_slice(body).map_err(|e| {
        debug!(target: "tally.http", error = %e, "Invalid request body");
        TallyError::BadRequest("Invalid request body".to_string())
    })
}

fn admission_token(headers: &HeaderMap) -> Result<&str, TallyError> {
    headers
        .get(ADMISSION_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(TallyError::Unauthorized)
}

fn sse(subscription: Subscription) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    debug!(
        target: "tally.http",
        room_id = %subscription.room_id(),
        subscriber_id = %subscription.subscriber_id(),
        role = subscription.role().label(),
        "Opening event stream"
    );
    let events = subscription
        .into_stream()
        .map(|snapshot: RoomSnapshot| Event::default().event("snapshot").json_data(snapshot));
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// `POST /api/v1/rooms`
///
/// The admission token in the response is the only time it is revealed.
#[instrument(skip_all, name = "tally.http.create_room")]
pub async fn create_room(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<CreateRoomResponse>), TallyError> {
    let created = observe("create_room", state.registry.create_room(), StatusCode::CREATED)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateRoomResponse {
            room_id: created.room_id,
            admission_token: created.admission_token.expose_secret().to_string(),
        }),
    ))
}

/// `POST /api/v1/rooms/:room_id/participants`
#[instrument(skip_all, name = "tally.http.join", fields(room_id = %room_id))]
pub async fn join_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    body: Bytes,
) -> Result<Json<RoomSnapshot>, TallyError> {
    let result = parse_body::<JoinRequest>(&body)
        .and_then(|req| state.registry.join(&RoomId::new(room_id), &req.name));
    observe("join", result, StatusCode::OK).map(Json)
}

/// `DELETE /api/v1/rooms/:room_id/participants/:name`
#[instrument(skip_all, name = "tally.http.leave", fields(room_id = %room_id))]
pub async fn leave_room(
    State(state): State<Arc<AppState>>,
    Path((room_id, name)): Path<(String, String)>,
) -> Result<StatusCode, TallyError> {
    let result = state.registry.leave(&RoomId::new(room_id), &name);
    observe("leave", result, StatusCode::NO_CONTENT).map(|_| StatusCode::NO_CONTENT)
}

/// `POST /api/v1/rooms/:room_id/votes`
#[instrument(skip_all, name = "tally.http.set_vote", fields(room_id = %room_id))]
pub async fn set_vote(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, TallyError> {
    let result = parse_body::<VoteRequest>(&body).and_then(|req| {
        state
            .registry
            .set_vote(&RoomId::new(room_id), &req.name, req.value)
    });
    observe("set_vote", result, StatusCode::NO_CONTENT).map(|()| StatusCode::NO_CONTENT)
}

/// `PUT /api/v1/rooms/:room_id/reset`
#[instrument(skip_all, name = "tally.http.reset", fields(room_id = %room_id))]
pub async fn reset_round(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, TallyError> {
    let result = admission_token(&headers)
        .and_then(|token| state.registry.reset(&RoomId::new(room_id), token));
    observe("reset", result, StatusCode::NO_CONTENT).map(|()| StatusCode::NO_CONTENT)
}

/// `POST /api/v1/rooms/:room_id/visibility`
#[instrument(skip_all, name = "tally.http.set_visibility", fields(room_id = %room_id))]
pub async fn set_visibility(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, TallyError> {
    let result = admission_token(&headers).and_then(|token| {
        let req = parse_body::<VisibilityRequest>(&body)?;
        state
            .registry
            .set_visible(&RoomId::new(room_id), token, req.visible)
    });
    observe("set_visibility", result, StatusCode::NO_CONTENT).map(|()| StatusCode::NO_CONTENT)
}

/// `POST /api/v1/rooms/:room_id/visibility/toggle`
#[instrument(skip_all, name = "tally.http.toggle_visibility", fields(room_id = %room_id))]
pub async fn toggle_visibility(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<VisibilityResponse>, TallyError> {
    let result = admission_token(&headers)
        .and_then(|token| state.registry.toggle_visible(&RoomId::new(room_id), token));
    observe("toggle_visibility", result, StatusCode::OK)
        .map(|visible| Json(VisibilityResponse { visible }))
}

/// `GET /api/v1/rooms/:room_id/snapshot`
#[instrument(skip_all, name = "tally.http.snapshot", fields(room_id = %room_id))]
pub async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomSnapshot>, TallyError> {
    let result = state.registry.snapshot(&RoomId::new(room_id));
    observe("snapshot", result, StatusCode::OK).map(Json)
}

/// `GET /api/v1/rooms/:room_id/events?name=`
///
/// Joins `name`, streams one `snapshot` event now and one per change. The
/// participant leaves when the client disconnects.
#[instrument(skip_all, name = "tally.http.participant_events", fields(room_id = %room_id))]
pub async fn participant_events(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, TallyError> {
    let name = query.name.unwrap_or_default();
    let result = state.registry.subscribe(&RoomId::new(room_id), &name).await;
    observe("subscribe", result, StatusCode::OK).map(sse)
}

/// `GET /api/v1/rooms/:room_id/facilitator/events`
///
/// Hides votes on connect. Disconnecting tears the room down.
#[instrument(skip_all, name = "tally.http.facilitator_events", fields(room_id = %room_id))]
pub async fn facilitator_events(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, TallyError> {
    let result = match admission_token(&headers) {
        Ok(token) => {
            state
                .registry
                .subscribe_facilitator(&RoomId::new(room_id), token)
                .await
        }
        Err(e) => Err(e),
    };
    observe("subscribe_facilitator", result, StatusCode::OK).map(sse)
}
