//! The collaborative document owned by a session.
//!
//! Wraps a [`Replica`] and its local [`UndoManager`] behind one lock, bumps a
//! revision counter on every change and forwards local updates to the sync
//! provider through an outbox channel.

use crate::error::{Result, SyncError};
use parking_lot::Mutex;
use quire_doc::{ApplyOutcome, ClientId, DocError, Replica, StateVector, UndoManager, Update};
use tokio::sync::{mpsc, watch};

/// Replica and undo history, always mutated together.
pub struct DocState {
    pub replica: Replica,
    pub undo: UndoManager,
}

/// A replica shared between a session, its provider and its binding.
pub struct CollaborativeDoc {
    document_id: String,
    state: Mutex<DocState>,
    revision: watch::Sender<u64>,
    outbox: mpsc::UnboundedSender<Update>,
}

impl CollaborativeDoc {
    /// Create an empty document. The receiver carries local updates to the
    /// provider.
    pub fn new(
        document_id: impl Into<String>,
        client: ClientId,
    ) -> (Self, mpsc::UnboundedReceiver<Update>) {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (revision, _) = watch::channel(0);
        let doc = Self {
            document_id: document_id.into(),
            state: Mutex::new(DocState {
                replica: Replica::new(client),
                undo: UndoManager::new(),
            }),
            revision,
            outbox,
        };
        (doc, outbox_rx)
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn client_id(&self) -> ClientId {
        self.state.lock().replica.client_id()
    }

    /// Read the replica.
    pub fn read<R>(&self, f: impl FnOnce(&Replica) -> R) -> R {
        f(&self.state.lock().replica)
    }

    pub fn text(&self) -> String {
        self.read(|replica| replica.text())
    }

    pub fn state_vector(&self) -> StateVector {
        self.read(|replica| replica.state_vector())
    }

    /// Run a local edit. The produced update is recorded for undo and queued
    /// for the provider.
    pub fn edit(
        &self,
        f: impl FnOnce(&mut Replica) -> std::result::Result<Update, DocError>,
    ) -> Result<Update> {
        let update = {
            let mut state = self.state.lock();
            let DocState { replica, undo } = &mut *state;
            let update = f(replica)?;
            undo.record(replica, &update);
            update
        };
        self.publish(&update);
        Ok(update)
    }

    /// Run several edits as one undo step.
    pub fn edit_group(
        &self,
        f: impl FnOnce(&mut Replica) -> std::result::Result<Update, DocError>,
    ) -> Result<Update> {
        self.state.lock().undo.start_group();
        let result = self.edit(f);
        self.state.lock().undo.end_group();
        result
    }

    /// Undo the last local change. Returns whether anything changed.
    pub fn undo(&self) -> Result<bool> {
        self.history(|replica, undo| undo.undo(replica))
    }

    pub fn redo(&self) -> Result<bool> {
        self.history(|replica, undo| undo.redo(replica))
    }

    pub fn can_undo(&self) -> bool {
        self.state.lock().undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.state.lock().undo.can_redo()
    }

    fn history(
        &self,
        f: impl FnOnce(&mut Replica, &mut UndoManager) -> std::result::Result<Option<Update>, DocError>,
    ) -> Result<bool> {
        let update = {
            let mut state = self.state.lock();
            let DocState { replica, undo } = &mut *state;
            f(replica, undo)?
        };
        match update {
            Some(update) if !update.is_empty() => {
                self.publish(&update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Merge a remote update. Never recorded for undo.
    pub fn apply_remote(&self, bytes: &[u8]) -> Result<ApplyOutcome> {
        let outcome = self
            .state
            .lock()
            .replica
            .apply_remote_update(bytes)
            .map_err(|e| match e {
                DocError::MalformedUpdate(reason) => SyncError::MalformedRemoteData(reason),
                other => SyncError::Doc(other),
            })?;
        if !outcome.is_noop() {
            self.bump();
        }
        Ok(outcome)
    }

    /// Encoded diff of everything `remote` has not seen.
    pub fn encode_diff_since(&self, remote: &StateVector) -> Result<Vec<u8>> {
        Ok(self.read(|replica| replica.encode_diff_since(remote))?)
    }

    /// Current revision; increases on every local or remote change.
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn publish(&self, update: &Update) {
        if update.is_empty() {
            return;
        }
        self.bump();
        // The provider may be gone; the edit is still applied locally.
        let _ = self.outbox.send(update.clone());
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_edits_reach_the_outbox() {
        let (doc, mut outbox) = CollaborativeDoc::new("doc", ClientId::new(1));
        doc.edit(|replica| replica.insert_text(0, "hi")).unwrap();

        let update = outbox.try_recv().unwrap();
        assert_eq!(update.ops.len(), 2);
        assert_eq!(doc.revision(), 1);
    }

    #[test]
    fn test_remote_updates_are_not_undoable() {
        let (doc, _outbox) = CollaborativeDoc::new("doc", ClientId::new(1));
        let mut other = Replica::new(ClientId::new(2));
        let bytes = other.insert_text(0, "remote").unwrap().encode().unwrap();

        doc.apply_remote(&bytes).unwrap();
        assert_eq!(doc.text(), "remote");
        assert!(!doc.can_undo());
        assert!(!doc.undo().unwrap());
        assert_eq!(doc.text(), "remote");
    }

    #[test]
    fn test_failed_edit_changes_nothing() {
        let (doc, mut outbox) = CollaborativeDoc::new("doc", ClientId::new(1));
        let err = doc.edit(|replica| replica.insert_text(5, "x")).unwrap_err();

        assert!(matches!(err, SyncError::Doc(_)));
        assert!(outbox.try_recv().is_err());
        assert_eq!(doc.revision(), 0);
    }

    #[test]
    fn test_undo_publishes_inverse() {
        let (doc, mut outbox) = CollaborativeDoc::new("doc", ClientId::new(1));
        doc.edit(|replica| replica.insert_text(0, "abc")).unwrap();
        outbox.try_recv().unwrap();

        assert!(doc.undo().unwrap());
        let inverse = outbox.try_recv().unwrap();
        assert_eq!(inverse.deletes.len(), 3);
        assert!(doc.redo().unwrap());
        assert_eq!(doc.text(), "abc");
    }

    #[test]
    fn test_malformed_remote_bytes() {
        let (doc, _outbox) = CollaborativeDoc::new("doc", ClientId::new(1));
        let err = doc.apply_remote(&[0xff, 0x00]).unwrap_err();
        assert!(matches!(err, SyncError::MalformedRemoteData(_)));
        assert_eq!(doc.revision(), 0);
    }
}
