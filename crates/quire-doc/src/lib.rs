//! # quire-doc
//!
//! Replicated document model for the Quire collaborative editor.
//!
//! This crate provides:
//! - A rich-text sequence CRDT ([`Replica`]) with block structure, inline
//!   marks and image embeds
//! - Causal delivery with state vectors and a pending buffer
//! - A compact binary update format
//! - Relative positions ([`Anchor`]) for cursors and selections
//! - Local-only undo/redo
//!
//! ## Example
//!
//! ```rust
//! use quire_doc::{ClientId, MarkKind, Replica};
//!
//! let mut alice = Replica::new(ClientId::new(1));
//! let mut bob = Replica::new(ClientId::new(2));
//!
//! let update = alice.insert_text(0, "Hello").unwrap();
//! alice.apply_local_format(0..5, MarkKind::Bold).unwrap();
//!
//! // Ship bytes to the other replica.
//! let bytes = update.encode().unwrap();
//! bob.apply_remote_update(&bytes).unwrap();
//! assert_eq!(bob.text(), "Hello");
//!
//! // Catch up on everything else.
//! let missing = alice.encode_diff_since(&bob.state_vector()).unwrap();
//! bob.apply_remote_update(&missing).unwrap();
//! assert_eq!(alice, bob);
//! ```

pub mod content;
pub mod error;
pub mod id;
pub mod lattice;
pub mod replica;
pub mod undo;
pub mod update;

pub use content::{Block, BlockKind, Content, Image, Inline, MarkKind, OBJECT_REPLACEMENT};
pub use error::{DocError, Result};
pub use id::{ClientId, OpId, StateVector};
pub use lattice::Lattice;
pub use replica::{Anchor, ApplyOutcome, Replica};
pub use undo::{StackItem, UndoManager};
pub use update::{Op, OpBody, Update, MAX_UPDATE_BYTES};
