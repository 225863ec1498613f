//! Common data types for Tally components.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque room identifier.
///
/// Generated from a CSPRNG at room creation; never sequential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Wrap an already-generated identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RoomId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Participant name validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("name must not be empty")]
    Empty,

    #[error("name must be at most {max} characters")]
    TooLong { max: usize },
}

/// A participant's display name, unique within a room while joined.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ParticipantName(String);

impl ParticipantName {
    /// Maximum name length in characters.
    pub const MAX_LEN: usize = 64;

    /// Validate and normalize a raw name (surrounding whitespace is trimmed).
    pub fn parse(raw: &str) -> Result<Self, NameError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(NameError::Empty);
        }
        if trimmed.chars().count() > Self::MAX_LEN {
            return Err(NameError::TooLong { max: Self::MAX_LEN });
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_name_trims() {
        let name = ParticipantName::parse("  alice ").unwrap();
        assert_eq!(name.as_str(), "alice");
    }

    #[test]
    fn test_participant_name_rejects_empty() {
        assert_eq!(ParticipantName::parse(""), Err(NameError::Empty));
        assert_eq!(ParticipantName::parse("   "), Err(NameError::Empty));
    }

    #[test]
    fn test_participant_name_rejects_too_long() {
        let raw = "x".repeat(ParticipantName::MAX_LEN + 1);
        assert_eq!(
            ParticipantName::parse(&raw),
            Err(NameError::TooLong {
                max: ParticipantName::MAX_LEN
            })
        );

        let raw = "x".repeat(ParticipantName::MAX_LEN);
        assert!(ParticipantName::parse(&raw).is_ok());
    }

    #[test]
    fn test_room_id_serializes_transparently() {
        let id = RoomId::new("abc123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc123\"");
        assert_eq!(id.to_string(), "abc123");
    }
}
