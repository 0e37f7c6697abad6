//! Operations and the binary update format exchanged between replicas.

use crate::content::{Content, MarkKind};
use crate::error::{DocError, Result};
use crate::id::OpId;
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Upper bound on the size of a single encoded update.
pub const MAX_UPDATE_BYTES: u64 = 16 * 1024 * 1024;

/// What an operation does.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpBody {
    /// Insert a unit right after `origin` (`None` = document start).
    Insert {
        origin: Option<OpId>,
        /// Lamport stamp; orders concurrent siblings.
        stamp: u64,
        content: Content,
    },
    /// Format every unit between `start` and `end` (inclusive, document order).
    Mark {
        kind: MarkKind,
        start: OpId,
        end: OpId,
    },
}

/// A single replicated operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub id: OpId,
    pub body: OpBody,
}

impl Op {
    /// Operations this one cannot be integrated without.
    pub fn dependencies(&self) -> Vec<OpId> {
        match &self.body {
            OpBody::Insert { origin, .. } => origin.iter().copied().collect(),
            OpBody::Mark { start, end, .. } => vec![*start, *end],
        }
    }
}

/// A batch of operations plus a delete set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub ops: Vec<Op>,
    /// Tombstoned inserts and removed marks.
    pub deletes: Vec<OpId>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.deletes.is_empty()
    }

    /// Append another update to this one.
    pub fn merge(&mut self, other: Update) {
        self.ops.extend(other.ops);
        self.deletes.extend(other.deletes);
    }

    /// Encode to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        codec()
            .serialize(self)
            .map_err(|e| DocError::Encoding(e.to_string()))
    }

    /// Decode from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        codec()
            .deserialize(bytes)
            .map_err(|e| DocError::MalformedUpdate(e.to_string()))
    }
}

/// Binary codec shared by updates and state vectors.
pub(crate) fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_UPDATE_BYTES)
}
