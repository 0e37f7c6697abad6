//! Undo/Redo - local-only history for one replica.
//!
//! Each entry remembers which operations a local transaction produced:
//! - undoing an insert tombstones exactly the units this client created
//! - undoing a delete inserts fresh copies right after the tombstones
//! - undoing formatting removes or re-creates the affected marks
//!
//! Remote operations are never recorded, so undo cannot revert another
//! client's edit. Every replica/session owns its own manager.

use crate::error::Result;
use crate::id::OpId;
use crate::replica::Replica;
use crate::update::{OpBody, Update};
use std::collections::BTreeSet;

/// Default number of entries kept on the undo stack.
pub const DEFAULT_MAX_DEPTH: usize = 500;

/// One undoable unit of local work.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StackItem {
    inserted: BTreeSet<OpId>,
    deleted: BTreeSet<OpId>,
    marks_added: BTreeSet<OpId>,
    marks_removed: BTreeSet<OpId>,
}

impl StackItem {
    /// Classify a local update against the replica it was applied to.
    pub fn capture(replica: &Replica, update: &Update) -> Self {
        let mut item = Self::default();
        for op in &update.ops {
            match op.body {
                OpBody::Insert { .. } => {
                    item.inserted.insert(op.id);
                }
                OpBody::Mark { .. } => {
                    item.marks_added.insert(op.id);
                }
            }
        }
        for id in &update.deletes {
            if replica.is_mark(id) {
                item.marks_removed.insert(*id);
            } else {
                item.deleted.insert(*id);
            }
        }
        item.normalize();
        item
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.deleted.is_empty()
            && self.marks_added.is_empty()
            && self.marks_removed.is_empty()
    }

    fn absorb(&mut self, other: StackItem) {
        self.inserted.extend(other.inserted);
        self.deleted.extend(other.deleted);
        self.marks_added.extend(other.marks_added);
        self.marks_removed.extend(other.marks_removed);
        self.normalize();
    }

    /// Work both created and removed within one entry has nothing to restore.
    fn normalize(&mut self) {
        let inserted = &self.inserted;
        self.deleted.retain(|id| !inserted.contains(id));
        let marks_added = &self.marks_added;
        self.marks_removed.retain(|id| !marks_added.contains(id));
    }

    /// Apply the inverse of this entry. Returns the produced update and the
    /// entry that would invert it again.
    fn revert(&self, replica: &mut Replica) -> (Update, StackItem) {
        let mut update = Update::new();

        // Restore first so the ids we are about to tombstone are still known.
        let restored = replica.restore(&self.deleted);
        let readded = replica.readd_marks(&self.marks_removed);

        let removable: Vec<OpId> = self
            .inserted
            .iter()
            .chain(self.marks_added.iter())
            .filter(|id| !replica.is_deleted(id))
            .copied()
            .collect();
        let removed = replica.delete_ids(&removable);

        let inverse = StackItem::capture(replica, &restored)
            .merged(StackItem::capture(replica, &readded))
            .merged(StackItem::capture(replica, &removed));

        update.merge(restored);
        update.merge(readded);
        update.merge(removed);
        (update, inverse)
    }

    fn merged(mut self, other: StackItem) -> Self {
        self.absorb(other);
        self
    }
}

/// Undo manager scoped to a single replica.
#[derive(Clone, Debug)]
pub struct UndoManager {
    undo_stack: Vec<StackItem>,
    redo_stack: Vec<StackItem>,
    /// Entry being built while a group is open.
    current_group: Option<StackItem>,
    max_depth: usize,
}

impl UndoManager {
    pub fn new() -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            current_group: None,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Set the maximum number of undo entries.
    pub fn set_max_depth(&mut self, max: usize) {
        self.max_depth = max.max(1);
        self.trim();
    }

    /// Record a local update. Must be called with updates this client produced.
    pub fn record(&mut self, replica: &Replica, update: &Update) {
        let item = StackItem::capture(replica, update);
        if item.is_empty() {
            return;
        }
        match self.current_group.as_mut() {
            Some(group) => group.absorb(item),
            None => {
                self.undo_stack.push(item);
                self.trim();
            }
        }
        self.redo_stack.clear();
    }

    /// Start grouping recorded updates into one entry.
    pub fn start_group(&mut self) {
        if self.current_group.is_none() {
            self.current_group = Some(StackItem::default());
        }
    }

    /// Close the current group.
    pub fn end_group(&mut self) {
        if let Some(group) = self.current_group.take() {
            if !group.is_empty() {
                self.undo_stack.push(group);
                self.trim();
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Undo the most recent local entry. Returns the update to broadcast, or
    /// `None` when there is nothing to undo.
    pub fn undo(&mut self, replica: &mut Replica) -> Result<Option<Update>> {
        self.end_group();
        let Some(item) = self.undo_stack.pop() else {
            return Ok(None);
        };
        let (update, inverse) = item.revert(replica);
        if !inverse.is_empty() {
            self.redo_stack.push(inverse);
        }
        Ok(Some(update))
    }

    /// Redo the most recently undone entry.
    pub fn redo(&mut self, replica: &mut Replica) -> Result<Option<Update>> {
        let Some(item) = self.redo_stack.pop() else {
            return Ok(None);
        };
        let (update, inverse) = item.revert(replica);
        if !inverse.is_empty() {
            self.undo_stack.push(inverse);
            self.trim();
        }
        Ok(Some(update))
    }

    /// Clear all history.
    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.current_group = None;
    }

    fn trim(&mut self) {
        if self.undo_stack.len() > self.max_depth {
            let excess = self.undo_stack.len() - self.max_depth;
            self.undo_stack.drain(..excess);
        }
    }
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new()
    }
}
