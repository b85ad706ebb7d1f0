//! Binary-to-text encoding for CRDT payloads.
//!
//! Update fragments and snapshots travel through string-keyed stores and
//! JSON payloads, so they are carried as standard base64. Decoding is the
//! first validation layer: malformed text fails here before any bytes
//! reach a live document.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("empty payload")]
    Empty,
}

/// Encode CRDT bytes for storage or transport.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a stored or received CRDT payload.
pub fn decode(text: &str) -> Result<Vec<u8>, DecodeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(STANDARD.decode(trimmed)?)
}
