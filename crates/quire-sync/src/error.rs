//! Error types for the sync layer.

use quire_doc::DocError;
use std::time::Duration;
use thiserror::Error;

/// Failures of a single transport connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Frame codec error: {0}")]
    Codec(String),
}

/// Error type for sync, session and binding operations.
///
/// Connection and authentication conditions are normally observed through
/// the status signal; these variants are what the fallible calls return.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// The endpoint rejected the credential. Terminal.
    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    /// The channel dropped. Retried automatically.
    #[error("Network disconnect: {0}")]
    NetworkDisconnect(String),

    /// Connected but the first sync did not complete in time.
    #[error("Sync did not complete within {0:?}")]
    SyncTimeout(Duration),

    /// The editing surface panicked. Only a session retry recovers.
    #[error("Editor binding crashed: {0}")]
    BindingCrash(String),

    /// A peer sent something that could not be used.
    #[error("Malformed remote data: {0}")]
    MalformedRemoteData(String),

    /// The image uploader failed or is not configured.
    #[error("Image upload failed: {0}")]
    ImageUpload(String),

    /// The owning session has been closed.
    #[error("Session closed")]
    SessionClosed,

    #[error(transparent)]
    Doc(#[from] DocError),
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        SyncError::NetworkDisconnect(err.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
