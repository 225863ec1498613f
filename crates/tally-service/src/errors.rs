//! Tally service error types.
//!
//! Every variant is recoverable and reported synchronously to the caller.
//! Error types map to stable client error codes and HTTP status codes.
//! Internal details are logged server-side but not exposed to clients.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::types::NameError;
use serde::Serialize;
use thiserror::Error;

/// Tally error type.
///
/// Maps to client error codes:
/// - `InvalidName`, `BadRequest`: `INVALID_REQUEST` (1)
/// - `Unauthorized`: `UNAUTHORIZED` (2)
/// - `RoomNotFound`, `NotPresent`: `NOT_FOUND` (4)
/// - `AlreadyPresent`, `FacilitatorPresent`: `CONFLICT` (5)
/// - `Internal`, `Config`: `INTERNAL_ERROR` (6)
/// - `RoomFull`, `RegistryFull`: `CAPACITY_EXCEEDED` (7)
/// - `RoomInactive`: `ROOM_INACTIVE` (8)
#[derive(Debug, Error)]
pub enum TallyError {
    /// Unknown room id.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// The room has been torn down.
    #[error("Room is inactive: {0}")]
    RoomInactive(String),

    /// Room is at its participant cap.
    #[error("Room at capacity: max {max} participants")]
    RoomFull { max: usize },

    /// The process-wide room cap has been reached.
    #[error("Room limit reached: max {max} rooms")]
    RegistryFull { max: usize },

    /// A participant with this name is already joined.
    #[error("Participant already present")]
    AlreadyPresent,

    /// The participant is not currently joined (stale or forged update).
    #[error("Participant not present")]
    NotPresent,

    /// Missing or wrong admission token on a facilitator-only operation.
    #[error("Unauthorized")]
    Unauthorized,

    /// A facilitator session is already active for this room.
    #[error("Facilitator already connected")]
    FacilitatorPresent,

    /// Malformed request (body, header or query).
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Participant name failed validation.
    #[error("Invalid participant name: {0}")]
    InvalidName(#[from] NameError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TallyError {
    /// Returns the client error code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            TallyError::InvalidName(_) | TallyError::BadRequest(_) => 1, // INVALID_REQUEST
            TallyError::Unauthorized => 2,   // UNAUTHORIZED
            TallyError::RoomNotFound(_) | TallyError::NotPresent => 4, // NOT_FOUND
            TallyError::AlreadyPresent | TallyError::FacilitatorPresent => 5, // CONFLICT
            TallyError::Internal(_) | TallyError::Config(_) => 6, // INTERNAL_ERROR
            TallyError::RoomFull { .. } | TallyError::RegistryFull { .. } => 7, // CAPACITY_EXCEEDED
            TallyError::RoomInactive(_) => 8, // ROOM_INACTIVE
        }
    }

    /// Returns the HTTP status code for this error (also the metrics `status` label).
    pub fn status_code(&self) -> StatusCode {
        match self {
            TallyError::InvalidName(_) | TallyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            TallyError::Unauthorized => StatusCode::UNAUTHORIZED,
            TallyError::RoomNotFound(_) | TallyError::NotPresent => StatusCode::NOT_FOUND,
            TallyError::AlreadyPresent | TallyError::FacilitatorPresent => StatusCode::CONFLICT,
            TallyError::RoomFull { .. } => StatusCode::FORBIDDEN,
            TallyError::RegistryFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            TallyError::RoomInactive(_) => StatusCode::GONE,
            TallyError::Internal(_) | TallyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code string for JSON error bodies.
    pub fn code_str(&self) -> &'static str {
        match self {
            TallyError::RoomNotFound(_) => "ROOM_NOT_FOUND",
            TallyError::RoomInactive(_) => "ROOM_INACTIVE",
            TallyError::RoomFull { .. } => "ROOM_FULL",
            TallyError::RegistryFull { .. } => "ROOM_LIMIT_REACHED",
            TallyError::AlreadyPresent => "ALREADY_PRESENT",
            TallyError::NotPresent => "NOT_PRESENT",
            TallyError::Unauthorized => "UNAUTHORIZED",
            TallyError::FacilitatorPresent => "FACILITATOR_PRESENT",
            TallyError::InvalidName(_) => "INVALID_NAME",
            TallyError::BadRequest(_) => "INVALID_REQUEST",
            TallyError::Config(_) | TallyError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            TallyError::Internal(_) | TallyError::Config(_) => {
                "An internal error occurred".to_string()
            }
            TallyError::RoomNotFound(_) => "Room not found".to_string(),
            TallyError::RoomInactive(_) => "Room is no longer active".to_string(),
            TallyError::RoomFull { max } => format!("Room is full ({max} participants)"),
            TallyError::RegistryFull { .. } => {
                "Server is at capacity, please try again later".to_string()
            }
            TallyError::AlreadyPresent => "Name is already taken in this room".to_string(),
            TallyError::NotPresent => "Participant is not in this room".to_string(),
            TallyError::Unauthorized => "Invalid or missing admission token".to_string(),
            TallyError::FacilitatorPresent => {
                "A facilitator is already connected to this room".to_string()
            }
            TallyError::InvalidName(e) => e.to_string(),
            TallyError::BadRequest(msg) => msg.clone(),
        }
    }
}

impl From<crate::config::ConfigError> for TallyError {
    fn from(err: crate::config::ConfigError) -> Self {
        TallyError::Config(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for TallyError {
    fn into_response(self) -> Response {
        if let TallyError::Internal(detail) | TallyError::Config(detail) = &self {
            tracing::error!(target: "tally.http", error = %detail, "Request failed internally");
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.code_str(),
                message: self.client_message(),
            },
        };

        (self.status_code(), Json(body)).into_response()
    }
}
