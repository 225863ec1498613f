//! Room identifiers and facilitator admission tokens.
//!
//! - **Room id**: 12 base62 characters from 72 bits of CSPRNG output
//! - **Admission token**: 32 random bytes, hex-encoded, handed out once
//! - **Verification**: the room keeps only `HMAC-SHA256(room_key, token)` and
//!   checks candidates with `hmac::verify` (constant-time)

use crate::errors::TallyError;

use common::secret::{ExposeSecret, SecretString};
use common::types::RoomId;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

/// Base62 alphabet for room id generation.
const BASE62_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Length of generated room ids.
pub const ROOM_ID_LENGTH: usize = 12;

/// Number of random bytes behind a room id (72 bits entropy).
const ROOM_ID_RANDOM_BYTES: usize = 9;

/// Length of the admission token secret in bytes (256 bits).
const ADMISSION_TOKEN_BYTES: usize = 32;

/// Generate a fresh room id.
pub fn generate_room_id() -> Result<RoomId, TallyError> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; ROOM_ID_RANDOM_BYTES];

    rng.fill(&mut bytes).map_err(|e| {
        tracing::error!(
            target: "tally.room.tokens",
            error = %e,
            "Failed to generate random bytes for room id"
        );
        TallyError::Internal("RNG failure".to_string())
    })?;

    let mut value: u128 = 0;
    for &b in &bytes {
        value = (value << 8) | u128::from(b);
    }

    let mut code = Vec::with_capacity(ROOM_ID_LENGTH);
    for _ in 0..ROOM_ID_LENGTH {
        #[allow(clippy::cast_possible_truncation)] // value % 62 always fits in usize
        let idx = (value % 62) as usize;
        let ch = BASE62_CHARS
            .get(idx)
            .ok_or_else(|| TallyError::Internal("Base62 index out of range".to_string()))?;
        code.push(*ch);
        value /= 62;
    }
    code.reverse();

    String::from_utf8(code)
        .map(RoomId::new)
        .map_err(|_| TallyError::Internal("Room id contained invalid UTF-8".to_string()))
}

/// Verifier for a room's admission token.
///
/// Holds a per-room random HMAC key and the tag of the issued token; the
/// token itself is not retained.
pub struct AdmissionGuard {
    key: hmac::Key,
    tag: hmac::Tag,
}

impl std::fmt::Debug for AdmissionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGuard").finish_non_exhaustive()
    }
}

impl AdmissionGuard {
    /// Issue a new admission token and the guard that verifies it.
    pub fn issue() -> Result<(Self, SecretString), TallyError> {
        let rng = SystemRandom::new();

        let key = hmac::Key::generate(hmac::HMAC_SHA256, &rng).map_err(|e| {
            tracing::error!(
                target: "tally.room.tokens",
                error = %e,
                "Failed to generate admission key"
            );
            TallyError::Internal("RNG failure".to_string())
        })?;

        let mut bytes = [0u8; ADMISSION_TOKEN_BYTES];
        rng.fill(&mut bytes).map_err(|e| {
            tracing::error!(
                target: "tally.room.tokens",
                error = %e,
                "Failed to generate admission token"
            );
            TallyError::Internal("RNG failure".to_string())
        })?;
        let token = SecretString::from(hex::encode(bytes));

        let tag = hmac::sign(&key, token.expose_secret().as_bytes());

        Ok((Self { key, tag }, token))
    }

    /// Check a candidate token. Constant-time with respect to the token contents.
    #[must_use]
    pub fn verify(&self, candidate: &str) -> bool {
        hmac::verify(&self.key, candidate.as_bytes(), self.tag.as_ref()).is_ok()
    }
}
