//! Error types for the document layer.

use thiserror::Error;

/// Errors that can occur while editing or merging a replica.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocError {
    #[error("Invalid index: {index} (length: {length})")]
    IndexOutOfBounds { index: usize, length: usize },

    #[error("Invalid range: {start}..{end} (length: {length})")]
    InvalidRange {
        start: usize,
        end: usize,
        length: usize,
    },

    #[error("Malformed update: {0}")]
    MalformedUpdate(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, DocError>;
