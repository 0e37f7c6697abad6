//! Replica - the replicated rich-text document.
//!
//! The document is a Replicated Growable Array of [`Content`] units:
//! - every unit records the unit it was inserted after (its origin)
//! - siblings under one origin are ordered by descending (stamp, client),
//!   so concurrent inserts at the same place resolve identically everywhere
//! - deletes only add the unit id to a delete set (tombstones)
//! - inline marks are anchored to unit ids, not offsets
//!
//! Operations from a client are integrated strictly in clock order and only
//! once their dependencies are present; anything that arrives early waits in
//! a pending buffer. The buffer is indexed by the unit each op is blocked on,
//! so integrating an op only re-examines the ops it can unblock.

use crate::content::{Block, BlockKind, Content, Image, Inline, MarkKind};
use crate::error::{DocError, Result};
use crate::id::{ClientId, OpId, StateVector};
use crate::lattice::Lattice;
use crate::update::{Op, OpBody, Update};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Range;

/// An integrated unit.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Item {
    origin: Option<OpId>,
    stamp: u64,
    content: Content,
}

/// An integrated mark.
#[derive(Clone, Debug, PartialEq, Eq)]
struct MarkRecord {
    kind: MarkKind,
    start: OpId,
    end: OpId,
}

/// A position that follows the unit it points at through concurrent edits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Anchor {
    /// Right before the given unit (its slot if the unit was deleted).
    Before(OpId),
    /// After the last unit.
    End,
}

/// What applying an update changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Operations integrated (including previously pending ones).
    pub integrated: usize,
    /// Known units or marks newly tombstoned.
    pub deleted: usize,
    /// Operations still waiting for dependencies.
    pub pending: usize,
}

impl ApplyOutcome {
    pub fn is_noop(&self) -> bool {
        self.integrated == 0 && self.deleted == 0
    }
}

/// A replica of one collaborative document.
#[derive(Clone, Debug)]
pub struct Replica {
    client: ClientId,
    /// Lamport clock, the highest stamp seen so far.
    lamport: u64,
    items: HashMap<OpId, Item>,
    /// origin -> children, sorted by descending (stamp, client).
    children: HashMap<Option<OpId>, Vec<OpId>>,
    marks: BTreeMap<OpId, MarkRecord>,
    deleted: BTreeSet<OpId>,
    state: StateVector,
    pending: BTreeMap<OpId, Op>,
    /// missing dependency -> pending ops blocked on it.
    waiting: HashMap<OpId, BTreeSet<OpId>>,
}

impl Replica {
    /// Create an empty replica owned by `client`.
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            lamport: 0,
            items: HashMap::new(),
            children: HashMap::new(),
            marks: BTreeMap::new(),
            deleted: BTreeSet::new(),
            state: StateVector::new(),
            pending: BTreeMap::new(),
            waiting: HashMap::new(),
        }
    }

    /// Get the client id used for local operations.
    pub fn client_id(&self) -> ClientId {
        self.client
    }

    // === Queries ===

    /// Number of visible units.
    pub fn len(&self) -> usize {
        self.items
            .keys()
            .filter(|id| !self.deleted.contains(id))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Plain-text view: breaks become newlines, images U+FFFC.
    pub fn text(&self) -> String {
        self.order()
            .iter()
            .filter(|id| !self.deleted.contains(id))
            .filter_map(|id| self.items.get(id))
            .map(|item| item.content.as_char())
            .collect()
    }

    /// The unit at a visible position.
    pub fn content_at(&self, position: usize) -> Option<&Content> {
        self.visible()
            .get(position)
            .and_then(|id| self.items.get(id))
            .map(|item| &item.content)
    }

    /// Marks applied to the unit at a visible position.
    pub fn marks_at(&self, position: usize) -> Vec<MarkKind> {
        let order = self.order();
        let visible = self.visible_from(&order);
        let Some(id) = visible.get(position) else {
            return Vec::new();
        };
        self.mark_coverage(&order).remove(id).unwrap_or_default()
    }

    /// Derive the block tree.
    pub fn blocks(&self) -> Vec<Block> {
        let order = self.order();
        let coverage = self.mark_coverage(&order);
        let mut blocks = Vec::new();
        let mut current = Block::new(BlockKind::Paragraph);

        for id in order.iter().filter(|id| !self.deleted.contains(id)) {
            let Some(item) = self.items.get(id) else {
                continue;
            };
            match &item.content {
                Content::Char(ch) => {
                    current.push_char(*ch, coverage.get(id).cloned().unwrap_or_default())
                }
                Content::Image(image) => current.children.push(Inline::Image(image.clone())),
                Content::Break(kind) => {
                    let mut block =
                        std::mem::replace(&mut current, Block::new(BlockKind::Paragraph));
                    block.kind = kind.clone();
                    blocks.push(block);
                }
            }
        }

        if !current.children.is_empty() || blocks.is_empty() {
            blocks.push(current);
        }
        blocks
    }

    /// Current state vector.
    pub fn state_vector(&self) -> StateVector {
        self.state.clone()
    }

    /// Number of received operations still waiting for dependencies.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // === Local operations ===

    /// Insert units at a visible position.
    pub fn apply_local_insert(&mut self, position: usize, content: &[Content]) -> Result<Update> {
        let visible = self.visible();
        if position > visible.len() {
            return Err(DocError::IndexOutOfBounds {
                index: position,
                length: visible.len(),
            });
        }

        let mut origin = position.checked_sub(1).map(|i| visible[i]);
        let mut update = Update::new();

        for unit in content {
            let id = self.next_id();
            self.lamport += 1;
            let content = match unit {
                Content::Break(kind) => Content::Break(kind.clone().normalized()),
                other => other.clone(),
            };
            let op = Op {
                id,
                body: OpBody::Insert {
                    origin,
                    stamp: self.lamport,
                    content,
                },
            };
            self.integrate(op.clone());
            update.ops.push(op);
            origin = Some(id);
        }

        Ok(update)
    }

    /// Insert text; newlines become paragraph breaks.
    pub fn insert_text(&mut self, position: usize, text: &str) -> Result<Update> {
        self.apply_local_insert(position, &Content::from_text(text))
    }

    /// Insert a break that closes the block before `position` as `kind`.
    pub fn insert_block_break(&mut self, position: usize, kind: BlockKind) -> Result<Update> {
        self.apply_local_insert(position, &[Content::Break(kind)])
    }

    /// Insert an image embed.
    pub fn insert_image(&mut self, position: usize, image: Image) -> Result<Update> {
        self.apply_local_insert(position, &[Content::Image(image)])
    }

    /// Tombstone the visible units in `range`.
    pub fn apply_local_delete(&mut self, range: Range<usize>) -> Result<Update> {
        let visible = self.visible();
        check_range(&range, visible.len())?;
        Ok(self.delete_ids(&visible[range]))
    }

    /// Apply a mark to the visible units in `range`.
    pub fn apply_local_format(&mut self, range: Range<usize>, kind: MarkKind) -> Result<Update> {
        let visible = self.visible();
        check_range(&range, visible.len())?;
        if range.is_empty() {
            return Ok(Update::new());
        }
        Ok(self.add_mark(kind, visible[range.start], visible[range.end - 1]))
    }

    /// Remove a mark kind from `range`. Marks reaching outside the range are
    /// split so the outside parts keep their formatting.
    pub fn apply_local_unformat(&mut self, range: Range<usize>, kind: &MarkKind) -> Result<Update> {
        let order = self.order();
        let visible = self.visible_from(&order);
        check_range(&range, visible.len())?;
        if range.is_empty() {
            return Ok(Update::new());
        }

        let spans: Vec<(OpId, Range<usize>)> = self
            .mark_spans(&order)
            .into_iter()
            .filter(|(id, _)| {
                self.marks
                    .get(id)
                    .map(|m| &m.kind == kind || m.kind.conflicts_with(kind))
                    .unwrap_or(false)
            })
            .collect();

        let mut update = Update::new();
        for (mark_id, covered) in spans {
            if covered.end <= range.start || covered.start >= range.end {
                continue;
            }
            let Some(mark_kind) = self.marks.get(&mark_id).map(|m| m.kind.clone()) else {
                continue;
            };
            update.merge(self.delete_ids(&[mark_id]));
            if covered.start < range.start {
                update.merge(self.add_mark(
                    mark_kind.clone(),
                    visible[covered.start],
                    visible[range.start - 1],
                ));
            }
            if covered.end > range.end {
                update.merge(self.add_mark(mark_kind, visible[range.end], visible[covered.end - 1]));
            }
        }

        Ok(update)
    }

    // === Remote operations ===

    /// Decode and merge an update from another replica.
    pub fn apply_remote_update(&mut self, bytes: &[u8]) -> Result<ApplyOutcome> {
        let update = Update::decode(bytes)?;
        Ok(self.apply_update(update))
    }

    /// Merge an already decoded update. Duplicates are ignored.
    pub fn apply_update(&mut self, update: Update) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();

        for id in update.deletes {
            let known = self.items.contains_key(&id) || self.marks.contains_key(&id);
            if self.deleted.insert(id) && known {
                outcome.deleted += 1;
            }
        }

        let mut candidates = Vec::with_capacity(update.ops.len());
        for op in update.ops {
            if !self.state.contains(&op.id) && !self.pending.contains_key(&op.id) {
                candidates.push(op.id);
                self.pending.insert(op.id, op);
            }
        }

        outcome.integrated = self.drain_pending(candidates);
        outcome.pending = self.pending.len();
        outcome
    }

    /// Everything this replica has that `remote` has not seen.
    ///
    /// The delete set is always sent in full.
    pub fn diff_since(&self, remote: &StateVector) -> Update {
        let mut ops: Vec<Op> = self
            .items
            .iter()
            .filter(|(id, _)| !remote.contains(id))
            .map(|(id, item)| Op {
                id: *id,
                body: OpBody::Insert {
                    origin: item.origin,
                    stamp: item.stamp,
                    content: item.content.clone(),
                },
            })
            .collect();

        ops.extend(
            self.marks
                .iter()
                .filter(|(id, _)| !remote.contains(id))
                .map(|(id, mark)| Op {
                    id: *id,
                    body: OpBody::Mark {
                        kind: mark.kind.clone(),
                        start: mark.start,
                        end: mark.end,
                    },
                }),
        );
        ops.sort_by_key(|op| op.id);

        Update {
            ops,
            deletes: self.deleted.iter().copied().collect(),
        }
    }

    /// Encoded form of [`Replica::diff_since`].
    pub fn encode_diff_since(&self, remote: &StateVector) -> Result<Vec<u8>> {
        self.diff_since(remote).encode()
    }

    /// Encode the whole document. Converged replicas produce identical bytes.
    pub fn encode_state_as_update(&self) -> Result<Vec<u8>> {
        self.encode_diff_since(&StateVector::new())
    }

    // === Anchors ===

    /// Anchor for a visible position.
    pub fn anchor_at(&self, position: usize) -> Anchor {
        self.visible()
            .get(position)
            .map(|id| Anchor::Before(*id))
            .unwrap_or(Anchor::End)
    }

    /// Current visible position of an anchor, `None` if its unit is unknown here.
    pub fn resolve_anchor(&self, anchor: &Anchor) -> Option<usize> {
        match anchor {
            Anchor::End => Some(self.len()),
            Anchor::Before(target) => {
                if !self.items.contains_key(target) {
                    return None;
                }
                let mut position = 0;
                for id in self.order() {
                    if id == *target {
                        return Some(position);
                    }
                    if !self.deleted.contains(&id) {
                        position += 1;
                    }
                }
                None
            }
        }
    }

    // === Undo support ===

    pub(crate) fn is_mark(&self, id: &OpId) -> bool {
        self.marks.contains_key(id)
    }

    pub(crate) fn is_deleted(&self, id: &OpId) -> bool {
        self.deleted.contains(id)
    }

    /// Tombstone known units or marks by id.
    pub(crate) fn delete_ids(&mut self, ids: &[OpId]) -> Update {
        let mut update = Update::new();
        for id in ids {
            let known = self.items.contains_key(id) || self.marks.contains_key(id);
            if known && self.deleted.insert(*id) {
                update.deletes.push(*id);
            }
        }
        update
    }

    /// Insert fresh copies of deleted units, each right after its tombstone.
    pub(crate) fn restore(&mut self, ids: &BTreeSet<OpId>) -> Update {
        let mut update = Update::new();
        for id in self.order() {
            if !ids.contains(&id) || !self.deleted.contains(&id) {
                continue;
            }
            let Some(content) = self.items.get(&id).map(|item| item.content.clone()) else {
                continue;
            };
            let new_id = self.next_id();
            self.lamport += 1;
            let op = Op {
                id: new_id,
                body: OpBody::Insert {
                    origin: Some(id),
                    stamp: self.lamport,
                    content,
                },
            };
            self.integrate(op.clone());
            update.ops.push(op);
        }
        update
    }

    /// Re-create removed marks with their original anchors.
    pub(crate) fn readd_marks(&mut self, ids: &BTreeSet<OpId>) -> Update {
        let mut update = Update::new();
        for id in ids {
            if !self.deleted.contains(id) {
                continue;
            }
            if let Some(mark) = self.marks.get(id).cloned() {
                update.merge(self.add_mark(mark.kind, mark.start, mark.end));
            }
        }
        update
    }

    // === Internals ===

    fn next_id(&self) -> OpId {
        OpId::new(self.client, self.state.get(self.client))
    }

    fn add_mark(&mut self, kind: MarkKind, start: OpId, end: OpId) -> Update {
        let op = Op {
            id: self.next_id(),
            body: OpBody::Mark { kind, start, end },
        };
        self.integrate(op.clone());
        Update {
            ops: vec![op],
            deletes: Vec::new(),
        }
    }

    /// The first dependency of `op` that is not integrated yet.
    fn missing_dependency(&self, op: &Op) -> Option<OpId> {
        op.dependencies()
            .into_iter()
            .find(|dep| !self.items.contains_key(dep))
    }

    /// Integrate every pending op reachable from `candidates`.
    ///
    /// An op is examined when it arrives, when the previous clock of its
    /// client is integrated, and when the dependency it was blocked on is.
    fn drain_pending(&mut self, candidates: Vec<OpId>) -> usize {
        let mut integrated = 0;
        let mut queue: VecDeque<OpId> = candidates.into();

        while let Some(id) = queue.pop_front() {
            let Some(op) = self.pending.get(&id) else {
                continue;
            };
            let expected = self.state.get(id.client);
            if id.clock < expected {
                self.pending.remove(&id);
                continue;
            }
            if id.clock > expected {
                continue;
            }
            if let Some(dep) = self.missing_dependency(op) {
                self.waiting.entry(dep).or_default().insert(id);
                continue;
            }

            if let Some(op) = self.pending.remove(&id) {
                self.integrate(op);
                integrated += 1;
                queue.push_back(OpId::new(id.client, id.clock + 1));
                if let Some(blocked) = self.waiting.remove(&id) {
                    queue.extend(blocked);
                }
            }
        }

        if integrated > 0 && !self.waiting.is_empty() {
            let pending = &self.pending;
            self.waiting.retain(|_, ids| {
                ids.retain(|id| pending.contains_key(id));
                !ids.is_empty()
            });
        }
        integrated
    }

    fn integrate(&mut self, op: Op) {
        let Op { id, body } = op;
        self.state.advance(id.client, id.clock + 1);

        match body {
            OpBody::Insert {
                origin,
                stamp,
                content,
            } => {
                self.lamport = self.lamport.max(stamp);
                let key = (stamp, id.client);
                let items = &self.items;
                let siblings = self.children.entry(origin).or_default();
                let at = siblings
                    .partition_point(|s| items.get(s).map(|i| (i.stamp, s.client)) > Some(key));
                siblings.insert(at, id);
                self.items.insert(
                    id,
                    Item {
                        origin,
                        stamp,
                        content,
                    },
                );
            }
            OpBody::Mark { kind, start, end } => {
                self.marks.insert(id, MarkRecord { kind, start, end });
            }
        }
    }

    /// All integrated units in document order, tombstones included.
    fn order(&self) -> Vec<OpId> {
        let mut out = Vec::with_capacity(self.items.len());
        let mut stack: Vec<OpId> = Vec::new();
        if let Some(roots) = self.children.get(&None) {
            stack.extend(roots.iter().rev());
        }
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(kids) = self.children.get(&Some(id)) {
                stack.extend(kids.iter().rev());
            }
        }
        out
    }

    fn visible(&self) -> Vec<OpId> {
        self.visible_from(&self.order())
    }

    fn visible_from(&self, order: &[OpId]) -> Vec<OpId> {
        order
            .iter()
            .filter(|id| !self.deleted.contains(id))
            .copied()
            .collect()
    }

    /// Visible position range covered by each live mark.
    fn mark_spans(&self, order: &[OpId]) -> Vec<(OpId, Range<usize>)> {
        let index: HashMap<OpId, usize> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let mut visible_before = Vec::with_capacity(order.len() + 1);
        let mut count = 0;
        visible_before.push(0);
        for id in order {
            if !self.deleted.contains(id) {
                count += 1;
            }
            visible_before.push(count);
        }

        self.marks
            .iter()
            .filter(|(id, _)| !self.deleted.contains(id))
            .filter_map(|(id, mark)| {
                let s = *index.get(&mark.start)?;
                let e = *index.get(&mark.end)?;
                if s > e {
                    return None;
                }
                let covered = visible_before[s]..visible_before[e + 1];
                (!covered.is_empty()).then_some((*id, covered))
            })
            .collect()
    }

    /// Marks per visible unit. Marks are applied in id order, so when two
    /// conflicting marks overlap the greater id wins.
    fn mark_coverage(&self, order: &[OpId]) -> HashMap<OpId, Vec<MarkKind>> {
        let index: HashMap<OpId, usize> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let mut coverage: HashMap<OpId, Vec<MarkKind>> = HashMap::new();

        for (id, mark) in &self.marks {
            if self.deleted.contains(id) {
                continue;
            }
            let (Some(&s), Some(&e)) = (index.get(&mark.start), index.get(&mark.end)) else {
                continue;
            };
            if s > e {
                continue;
            }
            for unit in &order[s..=e] {
                if self.deleted.contains(unit) {
                    continue;
                }
                let kinds = coverage.entry(*unit).or_default();
                kinds.retain(|k| k != &mark.kind && !k.conflicts_with(&mark.kind));
                kinds.push(mark.kind.clone());
            }
        }

        for kinds in coverage.values_mut() {
            kinds.sort();
        }
        coverage
    }
}

fn check_range(range: &Range<usize>, length: usize) -> Result<()> {
    if range.start > range.end || range.end > length {
        return Err(DocError::InvalidRange {
            start: range.start,
            end: range.end,
            length,
        });
    }
    Ok(())
}

impl std::fmt::Display for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text())
    }
}

/// Two replicas are equal when they hold the same integrated state; the
/// owning client and pending buffer are not part of it.
impl PartialEq for Replica {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
            && self.items == other.items
            && self.marks == other.marks
            && self.deleted == other.deleted
    }
}

impl Eq for Replica {}

impl Lattice for Replica {
    fn bottom() -> Self {
        Self::new(ClientId::new(0))
    }

    fn join(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.apply_update(other.diff_since(&self.state));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(id: u64) -> Replica {
        Replica::new(ClientId::new(id))
    }

    fn sync(a: &mut Replica, b: &mut Replica) {
        let to_b = a.diff_since(&b.state_vector());
        let to_a = b.diff_since(&a.state_vector());
        b.apply_update(to_b);
        a.apply_update(to_a);
    }

    #[test]
    fn test_basic_insert() {
        let mut doc = replica(1);
        doc.insert_text(0, "Hello").unwrap();
        assert_eq!(doc.text(), "Hello");
        assert_eq!(doc.len(), 5);
    }

    #[test]
    fn test_insert_in_middle() {
        let mut doc = replica(1);
        doc.insert_text(0, "Helo").unwrap();
        doc.insert_text(2, "l").unwrap();
        assert_eq!(doc.text(), "Hello");
    }

    #[test]
    fn test_insert_out_of_bounds() {
        let mut doc = replica(1);
        let err = doc.insert_text(3, "x").unwrap_err();
        assert_eq!(err, DocError::IndexOutOfBounds { index: 3, length: 0 });
    }

    #[test]
    fn test_delete() {
        let mut doc = replica(1);
        doc.insert_text(0, "Hello World").unwrap();
        let update = doc.apply_local_delete(5..11).unwrap();
        assert_eq!(doc.text(), "Hello");
        assert_eq!(update.deletes.len(), 6);
    }

    #[test]
    fn test_delete_invalid_range() {
        let mut doc = replica(1);
        doc.insert_text(0, "abc").unwrap();
        assert!(matches!(
            doc.apply_local_delete(2..9),
            Err(DocError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_insert_after_remote_sibling_keeps_intent() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.insert_text(0, "ac").unwrap();
        sync(&mut a, &mut b);

        // b types twice after 'a', a inserts once, then b inserts again.
        b.insert_text(1, "x").unwrap();
        sync(&mut a, &mut b);
        a.insert_text(1, "b").unwrap();
        sync(&mut a, &mut b);

        assert_eq!(a.text(), "abxc");
        assert_eq!(a, b);
    }

    #[test]
    fn test_concurrent_inserts_same_position() {
        let mut a = replica(1);
        let mut b = replica(2);

        a.insert_text(0, "Hello").unwrap();
        b.insert_text(0, "World").unwrap();
        sync(&mut a, &mut b);

        assert_eq!(a.text(), b.text());
        assert_eq!(a.len(), 10);
        // Runs never interleave.
        assert!(a.text() == "HelloWorld" || a.text() == "WorldHello");
    }

    #[test]
    fn test_concurrent_insert_inside_deleted_range() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.insert_text(0, "Hello").unwrap();
        sync(&mut a, &mut b);

        a.apply_local_delete(1..4).unwrap();
        b.insert_text(2, "x").unwrap();
        sync(&mut a, &mut b);

        assert_eq!(a.text(), "Hxo");
        assert_eq!(a, b);
    }

    #[test]
    fn test_duplicate_update_is_noop() {
        let mut a = replica(1);
        let mut b = replica(2);
        let update = a.insert_text(0, "Hi").unwrap();

        let first = b.apply_update(update.clone());
        let snapshot = b.clone();
        let second = b.apply_update(update);

        assert_eq!(first.integrated, 2);
        assert!(second.is_noop());
        assert_eq!(b, snapshot);
    }

    #[test]
    fn test_out_of_order_delivery_waits_for_dependencies() {
        let mut a = replica(1);
        let mut b = replica(2);
        let first = a.insert_text(0, "ab").unwrap();
        let second = a.insert_text(2, "cd").unwrap();

        let outcome = b.apply_update(second);
        assert_eq!(outcome.integrated, 0);
        assert_eq!(outcome.pending, 2);
        assert_eq!(b.text(), "");

        let outcome = b.apply_update(first);
        assert_eq!(outcome.integrated, 4);
        assert_eq!(b.pending_len(), 0);
        assert_eq!(b.text(), "abcd");
    }

    #[test]
    fn test_delete_before_insert_arrives() {
        let mut a = replica(1);
        let mut b = replica(2);
        let insert = a.insert_text(0, "abc").unwrap();
        let delete = a.apply_local_delete(1..2).unwrap();

        b.apply_update(delete);
        b.apply_update(insert);
        assert_eq!(b.text(), "ac");
        assert_eq!(a, b);
    }

    #[test]
    fn test_op_waiting_on_other_client_is_released() {
        let mut a = replica(1);
        let mut b = replica(2);
        let mut c = replica(3);
        let base = a.insert_text(0, "ab").unwrap();
        b.apply_update(base.clone());
        let reply = b.insert_text(1, "X").unwrap();

        c.apply_update(reply);
        assert_eq!(c.pending_len(), 1);
        let outcome = c.apply_update(base);
        assert_eq!(outcome.integrated, 3);
        assert_eq!(c.pending_len(), 0);
        assert_eq!(c.text(), "aXb");
    }

    #[test]
    fn test_reversed_batch_integrates_fully() {
        let mut a = replica(1);
        let mut b = replica(2);
        let mut update = a.insert_text(0, "hello").unwrap();
        update.merge(a.apply_local_format(1..4, MarkKind::Bold).unwrap());
        update.ops.reverse();

        let outcome = b.apply_update(update);
        assert_eq!(outcome.integrated, 6);
        assert_eq!(outcome.pending, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_large_snapshot_applies_quickly() {
        let mut a = replica(1);
        let mut b = replica(2);
        let text = "lorem ipsum ".repeat(50_000 / 12 + 1);
        let text = &text[..50_000];
        a.insert_text(0, text).unwrap();
        let bytes = a.encode_state_as_update().unwrap();

        let started = std::time::Instant::now();
        let outcome = b.apply_remote_update(&bytes).unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outcome.integrated, 50_000);
        assert_eq!(b.pending_len(), 0);
        assert!(
            elapsed < std::time::Duration::from_secs(5),
            "snapshot took {:?}",
            elapsed
        );
        assert_eq!(b.text(), a.text());
    }

    #[test]
    fn test_remote_update_bytes() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.insert_text(0, "bytes").unwrap();

        let bytes = a.encode_state_as_update().unwrap();
        b.apply_remote_update(&bytes).unwrap();
        assert_eq!(b.text(), "bytes");

        assert!(matches!(
            b.apply_remote_update(b"not an update"),
            Err(DocError::MalformedUpdate(_))
        ));
        assert_eq!(b.text(), "bytes");
    }

    #[test]
    fn test_diff_since_only_sends_missing_ops() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.insert_text(0, "abc").unwrap();
        sync(&mut a, &mut b);

        a.insert_text(3, "d").unwrap();
        let diff = a.diff_since(&b.state_vector());
        assert_eq!(diff.ops.len(), 1);

        b.apply_update(diff);
        assert_eq!(b.text(), "abcd");
    }

    #[test]
    fn test_converged_replicas_encode_identically() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.insert_text(0, "one").unwrap();
        b.insert_text(0, "two").unwrap();
        b.apply_local_format(0..2, MarkKind::Bold).unwrap();
        sync(&mut a, &mut b);

        assert_eq!(
            a.encode_state_as_update().unwrap(),
            b.encode_state_as_update().unwrap()
        );
    }

    #[test]
    fn test_blocks() {
        let mut doc = replica(1);
        doc.insert_text(0, "Title").unwrap();
        doc.insert_block_break(5, BlockKind::Heading { level: 1 })
            .unwrap();
        doc.insert_text(6, "buy milk").unwrap();
        doc.insert_block_break(14, BlockKind::TaskItem { checked: false })
            .unwrap();
        doc.insert_image(15, Image::new("https://img/cat.png", "cat"))
            .unwrap();

        let blocks = doc.blocks();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].kind, BlockKind::Heading { level: 1 });
        assert_eq!(blocks[0].text(), "Title");
        assert_eq!(blocks[1].kind, BlockKind::TaskItem { checked: false });
        assert_eq!(blocks[2].kind, BlockKind::Paragraph);
        assert!(matches!(blocks[2].children[0], Inline::Image(_)));
    }

    #[test]
    fn test_empty_document_has_one_block() {
        let doc = replica(1);
        assert_eq!(doc.blocks(), vec![Block::new(BlockKind::Paragraph)]);
    }

    #[test]
    fn test_formatting() {
        let mut doc = replica(1);
        doc.insert_text(0, "Hello World").unwrap();
        doc.apply_local_format(0..5, MarkKind::Bold).unwrap();

        assert_eq!(doc.marks_at(2), vec![MarkKind::Bold]);
        assert!(doc.marks_at(6).is_empty());

        let blocks = doc.blocks();
        assert_eq!(
            blocks[0].children[0],
            Inline::Text {
                text: "Hello".into(),
                marks: vec![MarkKind::Bold],
            }
        );
    }

    #[test]
    fn test_unformat_splits_mark() {
        let mut doc = replica(1);
        doc.insert_text(0, "abcdef").unwrap();
        doc.apply_local_format(0..6, MarkKind::Italic).unwrap();
        doc.apply_local_unformat(2..4, &MarkKind::Italic).unwrap();

        assert_eq!(doc.marks_at(1), vec![MarkKind::Italic]);
        assert!(doc.marks_at(2).is_empty());
        assert!(doc.marks_at(3).is_empty());
        assert_eq!(doc.marks_at(4), vec![MarkKind::Italic]);
    }

    #[test]
    fn test_conflicting_links_resolve_identically() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.insert_text(0, "link").unwrap();
        sync(&mut a, &mut b);

        a.apply_local_format(0..4, MarkKind::Link { url: "https://a".into() })
            .unwrap();
        b.apply_local_format(0..4, MarkKind::Link { url: "https://b".into() })
            .unwrap();
        sync(&mut a, &mut b);

        assert_eq!(a.marks_at(0).len(), 1);
        assert_eq!(a.marks_at(0), b.marks_at(0));
    }

    #[test]
    fn test_mark_on_text_inserted_concurrently() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.insert_text(0, "ac").unwrap();
        sync(&mut a, &mut b);

        a.apply_local_format(0..2, MarkKind::Bold).unwrap();
        b.insert_text(1, "b").unwrap();
        sync(&mut a, &mut b);

        assert_eq!(a.text(), "abc");
        assert_eq!(a.marks_at(1), vec![MarkKind::Bold]);
        assert_eq!(a.blocks(), b.blocks());
    }

    #[test]
    fn test_anchor_follows_remote_insert() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.insert_text(0, "world").unwrap();
        sync(&mut a, &mut b);

        let anchor = a.anchor_at(2);
        b.insert_text(0, "hello ").unwrap();
        sync(&mut a, &mut b);

        assert_eq!(a.resolve_anchor(&anchor), Some(8));
    }

    #[test]
    fn test_anchor_on_deleted_unit() {
        let mut doc = replica(1);
        doc.insert_text(0, "abcd").unwrap();
        let anchor = doc.anchor_at(2);
        doc.apply_local_delete(1..3).unwrap();

        assert_eq!(doc.resolve_anchor(&anchor), Some(1));
        assert_eq!(doc.resolve_anchor(&Anchor::End), Some(2));
    }

    #[test]
    fn test_unknown_anchor() {
        let doc = replica(1);
        let foreign = Anchor::Before(OpId::new(ClientId::new(7), 3));
        assert_eq!(doc.resolve_anchor(&foreign), None);
    }

    #[test]
    fn test_lattice_join() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.insert_text(0, "Hello").unwrap();
        b.insert_text(0, "World").unwrap();

        let ab = a.join(&b);
        let ba = b.join(&a);
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 10);
        assert!(a.is_covered_by(&ab));
        assert!(!ab.is_covered_by(&a));

        let mut c = replica(3);
        c.merge_from(&ab);
        assert_eq!(c.text(), ab.text());
    }
}
