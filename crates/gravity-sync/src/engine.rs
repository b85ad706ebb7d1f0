//! Per-session registry of open note documents.
//!
//! The sync manager owns one `NoteEngine` per signed-in session and tears
//! it down on sign-out; nothing here is global. Documents are created on
//! first local edit or first remote fragment, may be rehydrated from the
//! snapshot store, and track whether they carry local edits that the
//! backend has not acknowledged yet (which makes a remote snapshot apply
//! unsafe — a snapshot would silently drop history a delta preserves).

use crate::document::{DocumentError, NoteDocument, NoteRecord};
use crate::ids::NoteId;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("unknown note: {0}")]
    UnknownNote(NoteId),

    #[error("snapshot refused for {0}: document already open")]
    SnapshotRefused(NoteId),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// In-memory arena of note documents for one session.
#[derive(Default)]
pub struct NoteEngine {
    docs: HashMap<NoteId, NoteDocument>,
    /// Notes with local edits not yet acknowledged by the backend.
    dirty: HashSet<NoteId>,
}

impl NoteEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, note_id: &NoteId) -> bool {
        self.docs.contains_key(note_id)
    }

    pub fn has_unsynced_edits(&self, note_id: &NoteId) -> bool {
        self.dirty.contains(note_id)
    }

    pub fn note_ids(&self) -> impl Iterator<Item = &NoteId> {
        self.docs.keys()
    }

    /// Record a local edit, returning the update fragment it produced.
    ///
    /// Returns `None` when the text is unchanged and no fragment exists.
    pub fn record_local_edit(
        &mut self,
        note_id: &NoteId,
        markdown: &str,
        now_s: i64,
    ) -> Result<Option<Vec<u8>>> {
        let doc = self.docs.entry(note_id.clone()).or_default();
        let before = doc.version();
        if !doc.edit_markdown(markdown, now_s)? {
            return Ok(None);
        }
        self.dirty.insert(note_id.clone());
        Ok(Some(doc.export_updates_since(&before)?))
    }

    /// Set or clear a note's classification label, returning the update
    /// fragment the change produced.
    pub fn set_classification(
        &mut self,
        note_id: &NoteId,
        classification: Option<&str>,
        now_s: i64,
    ) -> Result<Vec<u8>> {
        let doc = self.docs.entry(note_id.clone()).or_default();
        let before = doc.version();
        doc.set_classification(classification, now_s)?;
        self.dirty.insert(note_id.clone());
        Ok(doc.export_updates_since(&before)?)
    }

    /// Set a note's pinned flag, returning the update fragment.
    pub fn set_pinned(&mut self, note_id: &NoteId, pinned: bool, now_s: i64) -> Result<Vec<u8>> {
        let doc = self.docs.entry(note_id.clone()).or_default();
        let before = doc.version();
        doc.set_pinned(pinned, now_s)?;
        self.dirty.insert(note_id.clone());
        Ok(doc.export_updates_since(&before)?)
    }

    /// Merge a remote update fragment, creating the document if needed.
    pub fn apply_update(&mut self, note_id: &NoteId, update: &[u8]) -> Result<()> {
        let doc = self.docs.entry(note_id.clone()).or_default();
        doc.import(update)?;
        Ok(())
    }

    /// Hydrate a document from a full snapshot.
    ///
    /// Only legal when no document is open for the note: an open document
    /// may hold unsynced local history that a snapshot would discard.
    /// Incremental fragments are always safe instead.
    pub fn apply_remote_snapshot(&mut self, note_id: &NoteId, snapshot: &[u8]) -> Result<()> {
        if self.docs.contains_key(note_id) {
            return Err(EngineError::SnapshotRefused(note_id.clone()));
        }
        let doc = NoteDocument::from_snapshot(snapshot)?;
        self.docs.insert(note_id.clone(), doc);
        Ok(())
    }

    /// Export the full current state of a note.
    pub fn snapshot(&self, note_id: &NoteId) -> Result<Vec<u8>> {
        let doc = self
            .docs
            .get(note_id)
            .ok_or_else(|| EngineError::UnknownNote(note_id.clone()))?;
        Ok(doc.export_snapshot()?)
    }

    /// Project the application-facing record for a note.
    pub fn note_record(&self, note_id: &NoteId) -> Option<NoteRecord> {
        self.docs.get(note_id).map(|doc| doc.record(note_id.as_str()))
    }

    /// Creation time of a note in epoch seconds.
    pub fn created_at_s(&self, note_id: &NoteId) -> Option<i64> {
        self.docs.get(note_id).and_then(|doc| doc.created_at_s())
    }

    /// Mark a note's local edits as acknowledged by the backend.
    pub fn mark_synced(&mut self, note_id: &NoteId) {
        self.dirty.remove(note_id);
    }

    /// Evict a note's document (it can be rehydrated from a snapshot).
    pub fn remove(&mut self, note_id: &NoteId) {
        self.docs.remove(note_id);
        self.dirty.remove(note_id);
    }

    /// Drop all documents, e.g. on sign-out.
    pub fn clear(&mut self) {
        self.docs.clear();
        self.dirty.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: &str) -> NoteId {
        NoteId::new(id).unwrap()
    }

    #[test]
    fn test_local_edit_produces_fragment_and_marks_dirty() {
        let mut engine = NoteEngine::new();
        let n1 = note("n1");

        let fragment = engine.record_local_edit(&n1, "Hello", 10).unwrap();
        assert!(fragment.is_some());
        assert!(engine.has_unsynced_edits(&n1));

        engine.mark_synced(&n1);
        assert!(!engine.has_unsynced_edits(&n1));
    }

    #[test]
    fn test_unchanged_edit_produces_no_fragment() {
        let mut engine = NoteEngine::new();
        let n1 = note("n1");
        engine.record_local_edit(&n1, "same", 10).unwrap();
        engine.mark_synced(&n1);

        let fragment = engine.record_local_edit(&n1, "same", 20).unwrap();
        assert!(fragment.is_none());
        assert!(!engine.has_unsynced_edits(&n1));
    }

    #[test]
    fn test_snapshot_refused_for_open_document() {
        let mut engine = NoteEngine::new();
        let n1 = note("n1");
        engine.record_local_edit(&n1, "local work", 10).unwrap();

        let other = NoteDocument::new();
        other.edit_markdown("remote state", 5).unwrap();
        let snapshot = other.export_snapshot().unwrap();

        let err = engine.apply_remote_snapshot(&n1, &snapshot).unwrap_err();
        assert!(matches!(err, EngineError::SnapshotRefused(_)));
        assert_eq!(engine.note_record(&n1).unwrap().markdown_text, "local work");
    }

    #[test]
    fn test_snapshot_hydrates_fresh_note() {
        let mut engine = NoteEngine::new();
        let n1 = note("n1");

        let other = NoteDocument::new();
        other.edit_markdown("remote state", 5).unwrap();
        let snapshot = other.export_snapshot().unwrap();

        engine.apply_remote_snapshot(&n1, &snapshot).unwrap();
        assert_eq!(engine.note_record(&n1).unwrap().markdown_text, "remote state");
        assert!(!engine.has_unsynced_edits(&n1));
    }

    #[test]
    fn test_apply_update_creates_document() {
        let source = NoteDocument::new();
        source.edit_markdown("from remote", 5).unwrap();
        let update = source
            .export_updates_since(&loro::VersionVector::new())
            .unwrap();

        let mut engine = NoteEngine::new();
        let n1 = note("n1");
        engine.apply_update(&n1, &update).unwrap();
        assert_eq!(engine.note_record(&n1).unwrap().markdown_text, "from remote");
    }

    #[test]
    fn test_malformed_update_keeps_document() {
        let mut engine = NoteEngine::new();
        let n1 = note("n1");
        engine.record_local_edit(&n1, "intact", 10).unwrap();

        assert!(engine.apply_update(&n1, &[1, 2, 3]).is_err());
        assert_eq!(engine.note_record(&n1).unwrap().markdown_text, "intact");
    }

    #[test]
    fn test_attribute_edits_produce_fragments() {
        let mut engine = NoteEngine::new();
        let n1 = note("n1");
        engine.record_local_edit(&n1, "body", 10).unwrap();
        engine.mark_synced(&n1);

        let fragment = engine.set_pinned(&n1, true, 20).unwrap();
        assert!(!fragment.is_empty());
        assert!(engine.has_unsynced_edits(&n1));

        // The fragment alone carries the attribute to another replica.
        let mut other = NoteEngine::new();
        other.apply_update(&n1, &engine.snapshot(&n1).unwrap()).unwrap();
        let fragment = engine
            .set_classification(&n1, Some("work"), 30)
            .unwrap();
        other.apply_update(&n1, &fragment).unwrap();
        let record = other.note_record(&n1).unwrap();
        assert_eq!(record.pinned, Some(true));
        assert_eq!(record.classification.as_deref(), Some("work"));
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut engine = NoteEngine::new();
        engine.record_local_edit(&note("n1"), "a", 1).unwrap();
        engine.record_local_edit(&note("n2"), "b", 2).unwrap();
        engine.clear();
        assert!(!engine.contains(&note("n1")));
        assert!(engine.note_ids().next().is_none());
    }
}
