//! Validated identifier newtypes.
//!
//! All persisted sync state is scoped by `(UserId, NoteId)` or `(UserId)`.
//! Identifiers are opaque strings; validation only rejects empty or
//! whitespace-only input so a bad caller cannot create unkeyable state.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,
}

/// Stable, opaque identifier for a note.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    pub fn new(raw: &str) -> Result<Self, IdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IdError::Empty);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable, opaque identifier for a user account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(raw: &str) -> Result<Self, IdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IdError::Empty);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_id_trims_whitespace() {
        let id = NoteId::new("  n1  ").unwrap();
        assert_eq!(id.as_str(), "n1");
    }

    #[test]
    fn test_empty_ids_rejected() {
        assert_eq!(NoteId::new("   ").unwrap_err(), IdError::Empty);
        assert_eq!(UserId::new("").unwrap_err(), IdError::Empty);
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = NoteId::new("n1").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"n1\"");
    }
}
