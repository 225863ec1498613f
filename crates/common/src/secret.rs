//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports [`secrecy`] types. Room admission tokens travel as
//! `SecretString` from the moment they are generated until they are handed
//! to the facilitator, so a `{:?}` or a tracing field can never print them.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct CreatedRoom {
//!     room_id: String,
//!     admission_token: SecretString,
//! }
//!
//! let room = CreatedRoom {
//!     room_id: "4fZ9qLm2xT0a".to_string(),
//!     admission_token: SecretString::from("c0ffee"),
//! };
//!
//! assert!(!format!("{room:?}").contains("c0ffee"));
//! assert_eq!(room.admission_token.expose_secret(), "c0ffee");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("token-abc");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("token-abc"));
    }

    #[test]
    fn test_struct_with_secret_is_safe() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct Admission {
            room_id: String,
            token: SecretString,
        }

        let admission = Admission {
            room_id: "room-1".to_string(),
            token: SecretString::from("facilitator-secret"),
        };

        let debug_str = format!("{admission:?}");

        assert!(debug_str.contains("room-1"));
        assert!(!debug_str.contains("facilitator-secret"));
    }

    #[test]
    fn test_deserialize() {
        #[derive(Debug, Deserialize)]
        struct Request {
            token: SecretString,
        }

        let json = r#"{"token": "deadbeef"}"#;
        let req: Request = serde_json::from_str(json).expect("deserialize");

        assert_eq!(req.token.expose_secret(), "deadbeef");
        assert!(!format!("{req:?}").contains("deadbeef"));
    }
}
