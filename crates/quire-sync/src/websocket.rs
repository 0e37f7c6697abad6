//! WebSocket transport.
//!
//! Connects to `<base_url>/<document_id>` (id percent-encoded) and exchanges JSON text frames.
//! A writer task forwards outgoing frames to the socket, a reader task
//! decodes incoming messages. Undecodable messages are logged and skipped;
//! a close frame or socket error ends the connection.

use crate::error::TransportError;
use crate::protocol::Frame;
use crate::transport::{Connection, Connector, DEFAULT_CHANNEL_CAPACITY};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Connector for a WebSocket collaboration server.
#[derive(Clone, Debug)]
pub struct WsConnector {
    base_url: String,
    capacity: usize,
}

impl WsConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Endpoint for a document; the id is percent-encoded as one path segment.
    pub fn url_for(&self, document_id: &str) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(document_id))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, document_id: &str) -> Result<Connection, TransportError> {
        let url = self.url_for(document_id);
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        debug!(%url, "websocket connected");
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(self.capacity);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(self.capacity);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match frame.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => Frame::from_json(&text),
                    Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                        Ok(text) => Frame::from_json(text),
                        Err(e) => Err(TransportError::Codec(e.to_string())),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "websocket read failed");
                        break;
                    }
                };
                match frame {
                    Ok(frame) => {
                        if in_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping malformed frame"),
                }
            }
        });

        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_document() {
        let connector = WsConnector::new("ws://localhost:1234/");
        assert_eq!(connector.url_for("notes"), "ws://localhost:1234/notes");
    }

    #[test]
    fn test_url_for_escapes_document_id() {
        let connector = WsConnector::new("wss://collab.example.com/docs");
        assert_eq!(
            connector.url_for("team/q3 plan?draft#1"),
            "wss://collab.example.com/docs/team%2Fq3%20plan%3Fdraft%231"
        );
        assert_eq!(connector.url_for("notes-1_v2.~x"), "wss://collab.example.com/docs/notes-1_v2.~x");
    }

    #[tokio::test]
    async fn test_unreachable_server_fails() {
        let connector = WsConnector::new("ws://127.0.0.1:1");
        let err = connector.connect("notes").await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }
}
