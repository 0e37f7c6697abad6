//! Frames exchanged on the collaboration channel.
//!
//! Frames are JSON objects tagged by `type`. Update and state-vector payloads
//! are the binary encodings produced by `quire-doc`.
//!
//! Handshake:
//! 1. client -> `Auth { document_id, token, state_vector }`
//! 2. server -> `AuthRejected` and close, or `SyncStep { update, state_vector }`
//! 3. client -> `Update` with whatever the server is missing
//! 4. server -> `Synced`
//!
//! After that both sides exchange `Update` and `Awareness` frames freely.

use crate::error::TransportError;
use quire_doc::ClientId;
use serde::{Deserialize, Serialize};

/// One awareness record. `state: None` removes the entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client: ClientId,
    /// Per-client logical clock; higher replaces lower.
    pub clock: u64,
    /// Untrusted JSON; sanitized by the receiver.
    pub state: Option<serde_json::Value>,
}

/// Messages on the collaboration channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Opening frame from the client.
    Auth {
        document_id: String,
        token: String,
        state_vector: Vec<u8>,
    },
    /// The credential was refused. The server closes after sending it.
    AuthRejected { reason: String },
    /// Everything the client is missing, plus the server's state vector.
    SyncStep {
        update: Vec<u8>,
        state_vector: Vec<u8>,
    },
    /// First-sync acknowledgment.
    Synced,
    /// Incremental document update.
    Update { update: Vec<u8> },
    /// Awareness changes.
    Awareness { entries: Vec<AwarenessEntry> },
}

impl Frame {
    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Codec(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|e| TransportError::Codec(e.to_string()))
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Auth { .. } => "auth",
            Frame::AuthRejected { .. } => "auth_rejected",
            Frame::SyncStep { .. } => "sync_step",
            Frame::Synced => "synced",
            Frame::Update { .. } => "update",
            Frame::Awareness { .. } => "awareness",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_is_tagged_json() {
        let text = Frame::Synced.to_json().unwrap();
        assert_eq!(text, r#"{"type":"synced"}"#);

        let frame = Frame::Update {
            update: vec![1, 2, 3],
        };
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "update");
        assert_eq!(Frame::from_json(&frame.to_json().unwrap()).unwrap(), frame);
    }

    #[test]
    fn test_awareness_frame_keeps_raw_state() {
        let raw = json!({
            "type": "awareness",
            "entries": [
                { "client": 7, "clock": 3, "state": { "user": { "name": 42 } } },
                { "client": 8, "clock": 1, "state": null }
            ]
        });
        let frame = Frame::from_json(&raw.to_string()).unwrap();
        let Frame::Awareness { entries } = frame else {
            panic!("expected awareness frame");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].client, ClientId::new(7));
        assert!(entries[1].state.is_none());
    }

    #[test]
    fn test_wide_client_id_survives_json() {
        let frame = Frame::Awareness {
            entries: vec![AwarenessEntry {
                client: ClientId::new(u64::MAX - 1),
                clock: 2,
                state: None,
            }],
        };
        assert_eq!(Frame::from_json(&frame.to_json().unwrap()).unwrap(), frame);
    }

    #[test]
    fn test_unknown_frame_is_codec_error() {
        let err = Frame::from_json(r#"{"type":"explode"}"#).unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));
    }
}
