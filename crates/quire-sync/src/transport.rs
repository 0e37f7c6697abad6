//! Transport abstraction for the collaboration channel.

use crate::error::TransportError;
use crate::protocol::Frame;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Default buffer size of connection channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// An open bidirectional channel for one document.
///
/// The connection is closed when `incoming` yields `None` or a send on
/// `outgoing` fails. Dropping `outgoing` closes it from this side.
#[derive(Debug)]
pub struct Connection {
    pub outgoing: mpsc::Sender<Frame>,
    pub incoming: mpsc::Receiver<Frame>,
}

/// Something that can open a channel to a collaboration endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a channel for `document_id`. Authentication happens on the channel.
    async fn connect(&self, document_id: &str) -> Result<Connection, TransportError>;
}
