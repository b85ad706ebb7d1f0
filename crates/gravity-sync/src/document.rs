//! NoteDocument: Loro document wrapper for a single note.
//!
//! Each note is one Loro document with:
//! - `body`: LoroText holding the markdown source
//! - `meta`: LoroMap with timestamps and optional attributes
//!   (`classification`, `pinned`), merged key-by-key as last-writer-wins
//!
//! Merge of concurrent edits is commutative, associative, and idempotent
//! by construction of the underlying structure; re-importing an already
//! merged fragment is a no-op. The application-facing `NoteRecord` is a
//! projection of this document, never a source of truth.

use crate::encoding::{self, DecodeError};
use loro::{ExportMode, LoroDoc, LoroMap, LoroText, UpdateOptions, VersionVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BODY_CONTAINER: &str = "body";
const META_CONTAINER: &str = "meta";

const META_CREATED_AT: &str = "created_at_s";
const META_UPDATED_AT: &str = "updated_at_s";
const META_LAST_ACTIVITY: &str = "last_activity_s";
const META_CLASSIFICATION: &str = "classification";
const META_PINNED: &str = "pinned";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("loro error: {0}")]
    Loro(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// The application-facing view of a note, projected from the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRecord {
    pub note_id: String,
    pub markdown_text: String,
    pub created_at_iso: String,
    pub updated_at_iso: String,
    pub last_activity_iso: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
}

/// A single note as a mergeable Loro document.
pub struct NoteDocument {
    doc: LoroDoc,
}

impl NoteDocument {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self { doc: LoroDoc::new() }
    }

    /// Reconstruct a document from a full snapshot.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self> {
        validate_import(bytes)?;
        let doc = LoroDoc::new();
        doc.import(bytes)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        Ok(Self { doc })
    }

    fn body(&self) -> LoroText {
        self.doc.get_text(BODY_CONTAINER)
    }

    fn meta(&self) -> LoroMap {
        self.doc.get_map(META_CONTAINER)
    }

    /// Current markdown text of the note.
    pub fn markdown(&self) -> String {
        self.body().to_string()
    }

    /// Apply a local markdown edit via a line-based diff.
    ///
    /// Returns false when the new text matches the current body, in which
    /// case nothing is committed and no fragment should be produced.
    pub fn edit_markdown(&self, new_text: &str, now_s: i64) -> Result<bool> {
        let body = self.body();
        if body.to_string() == new_text {
            return Ok(false);
        }

        body.update_by_line(new_text, UpdateOptions::default())
            .map_err(|e| DocumentError::Loro(format!("{:?}", e)))?;
        self.touch(now_s)?;
        self.doc.commit();
        Ok(true)
    }

    /// Set or clear the note's classification label.
    pub fn set_classification(&self, classification: Option<&str>, now_s: i64) -> Result<()> {
        let meta = self.meta();
        match classification {
            Some(value) => meta
                .insert(META_CLASSIFICATION, value)
                .map_err(|e| DocumentError::Loro(e.to_string()))?,
            None => meta
                .delete(META_CLASSIFICATION)
                .map_err(|e| DocumentError::Loro(e.to_string()))?,
        }
        self.touch(now_s)?;
        self.doc.commit();
        Ok(())
    }

    /// Set the pinned flag.
    pub fn set_pinned(&self, pinned: bool, now_s: i64) -> Result<()> {
        self.meta()
            .insert(META_PINNED, pinned)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.touch(now_s)?;
        self.doc.commit();
        Ok(())
    }

    fn touch(&self, now_s: i64) -> Result<()> {
        let meta = self.meta();
        if meta_i64(&meta, META_CREATED_AT).is_none() {
            meta.insert(META_CREATED_AT, now_s)
                .map_err(|e| DocumentError::Loro(e.to_string()))?;
        }
        meta.insert(META_UPDATED_AT, now_s)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        meta.insert(META_LAST_ACTIVITY, now_s)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        Ok(())
    }

    /// Creation time in epoch seconds, if the note was ever touched.
    pub fn created_at_s(&self) -> Option<i64> {
        meta_i64(&self.meta(), META_CREATED_AT)
    }

    /// Current version vector.
    pub fn version(&self) -> VersionVector {
        self.doc.state_vv()
    }

    /// Export the full current state.
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }

    /// Export a delta of everything newer than `from`.
    pub fn export_updates_since(&self, from: &VersionVector) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::updates(from))
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }

    /// Merge a remote update fragment or snapshot into this document.
    ///
    /// Bytes are validated on a scratch document first so a malformed
    /// fragment cannot corrupt the live state.
    pub fn import(&self, bytes: &[u8]) -> Result<()> {
        validate_import(bytes)?;
        self.doc
            .import(bytes)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        Ok(())
    }

    /// Project the application-facing record.
    pub fn record(&self, note_id: &str) -> NoteRecord {
        let meta = self.meta();
        let created = meta_i64(&meta, META_CREATED_AT).unwrap_or(0);
        let updated = meta_i64(&meta, META_UPDATED_AT).unwrap_or(created);
        let activity = meta_i64(&meta, META_LAST_ACTIVITY).unwrap_or(updated);

        NoteRecord {
            note_id: note_id.to_string(),
            markdown_text: self.markdown(),
            created_at_iso: iso_from_seconds(created),
            updated_at_iso: iso_from_seconds(updated),
            last_activity_iso: iso_from_seconds(activity),
            classification: meta_string(&meta, META_CLASSIFICATION),
            pinned: meta_bool(&meta, META_PINNED),
        }
    }
}

impl Default for NoteDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode-check bytes against a scratch document before touching live state.
fn validate_import(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(DocumentError::Decode(DecodeError::Empty));
    }
    let probe = LoroDoc::new();
    probe
        .import(bytes)
        .map_err(|e| DocumentError::Loro(e.to_string()))?;
    Ok(())
}

fn meta_i64(meta: &LoroMap, key: &str) -> Option<i64> {
    if let loro::LoroValue::Map(map) = meta.get_deep_value() {
        if let Some(loro::LoroValue::I64(n)) = map.get(key) {
            return Some(*n);
        }
    }
    None
}

fn meta_string(meta: &LoroMap, key: &str) -> Option<String> {
    if let loro::LoroValue::Map(map) = meta.get_deep_value() {
        if let Some(loro::LoroValue::String(s)) = map.get(key) {
            return Some(s.to_string());
        }
    }
    None
}

fn meta_bool(meta: &LoroMap, key: &str) -> Option<bool> {
    if let loro::LoroValue::Map(map) = meta.get_deep_value() {
        if let Some(loro::LoroValue::Bool(b)) = map.get(key) {
            return Some(*b);
        }
    }
    None
}

fn iso_from_seconds(seconds: i64) -> String {
    chrono::DateTime::from_timestamp(seconds, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Encode a snapshot for string-keyed storage.
pub fn snapshot_to_text(doc: &NoteDocument) -> Result<String> {
    Ok(encoding::encode(&doc.export_snapshot()?))
}
