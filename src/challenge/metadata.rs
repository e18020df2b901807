//! Helpers for the JSON shapes exchanged with the challenge endpoints.
//!
//! The continuation response carries `challengeMetadata` as a JSON *string*, so it is
//! decoded twice: once as part of the body and once on its own.

use super::error::ChallengeError;
use serde_json::{Map, Value};

pub const VERIFICATION_TOKEN_FIELD: &str = "verificationToken";

/// Decode the nested metadata string returned by the continuation endpoint.
///
/// # Errors
/// Returns `ChallengeError::Protocol` if the string is not a JSON object.
pub fn decode_continuation_metadata(raw: &str) -> Result<Map<String, Value>, ChallengeError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ChallengeError::Protocol(
            "Challenge metadata is not a JSON object".to_string(),
        )),
        Err(err) => Err(ChallengeError::Protocol(format!(
            "Challenge metadata could not be decoded: {err}"
        ))),
    }
}

/// # Errors
/// Returns `ChallengeError::Protocol` if `userId` is absent.
pub fn user_id(metadata: &Map<String, Value>) -> Result<String, ChallengeError> {
    opaque_field(metadata, "userId")
        .ok_or_else(|| ChallengeError::Protocol("Challenge metadata missing userId".to_string()))
}

/// # Errors
/// Returns `ChallengeError::Protocol` if the inner `challengeId` is absent.
pub fn inner_challenge_id(metadata: &Map<String, Value>) -> Result<String, ChallengeError> {
    opaque_field(metadata, "challengeId").ok_or_else(|| {
        ChallengeError::Protocol("Challenge metadata missing challengeId".to_string())
    })
}

// Identifiers arrive as strings or numbers; both are passed through untouched.
fn opaque_field(metadata: &Map<String, Value>, key: &str) -> Option<String> {
    match metadata.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Shallow merge; the verification token overwrites any field of the same name.
#[must_use]
pub fn merge_verification_token(metadata: &Map<String, Value>, token: &str) -> Map<String, Value> {
    let mut merged = metadata.clone();
    merged.insert(
        VERIFICATION_TOKEN_FIELD.to_string(),
        Value::String(token.to_string()),
    );
    merged
}

/// First `errors[].message` in an upstream error body, if any.
#[must_use]
pub fn first_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("errors")?
        .get(0)?
        .get("message")?
        .as_str()
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

/// Log-safe prefix of a token.
#[must_use]
pub fn token_preview(token: &str) -> String {
    let prefix: String = token.chars().take(20).collect();
    format!("{prefix}...")
}
