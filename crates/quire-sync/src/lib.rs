//! # Quire Sync
//!
//! Real-time collaboration around a [`quire_doc::Replica`]:
//!
//! - **Sync provider**: handshake, update exchange, reconnect with backoff
//! - **Connection status**: state machine with a sticky first-sync flag
//! - **Awareness**: ephemeral presence with sanitized remote state
//! - **Editor binding**: transactions in, render patches and cursors out
//! - **Presence renderer**: the list of other people in the document
//! - **Transports**: WebSocket, plus an in-process server for tests
//!
//! ## Quick start
//!
//! ```rust
//! use quire_sync::{Client, ClientConfig, LocalServer, Transaction};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let server = LocalServer::new();
//! let alice = Client::with_local_server(&server, ClientConfig::default());
//! let bob = Client::with_local_server(&server, ClientConfig::default());
//!
//! let a = alice.open_session("notes");
//! let b = bob.open_session("notes");
//! a.wait_synced(Duration::from_secs(5)).await.unwrap();
//! b.wait_synced(Duration::from_secs(5)).await.unwrap();
//!
//! a.binding().unwrap().apply(Transaction::new().insert_text(0, "Hi")).unwrap();
//! # });
//! ```

pub mod auth;
pub mod awareness;
pub mod binding;
pub mod client;
pub mod document;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod session;
pub mod status;
pub mod transport;
pub mod websocket;

pub use auth::{supplier_fn, CredentialSupplier, FnSupplier, StaticToken};
pub use awareness::{
    escape_html, sanitize_color, sanitize_name, Awareness, AwarenessEvent, AwarenessState,
    ChangeOrigin, Collaborator, CursorColors, CursorRange, UserInfo,
};
pub use binding::{
    BindingFactory, BindingKey, CursorDecoration, CursorRenderer, EditStep, EditorBinding,
    HtmlCursorRenderer, ImageUploader, RenderPatch, Transaction,
};
pub use client::{Client, ClientConfig, ClientConfigBuilder};
pub use document::CollaborativeDoc;
pub use error::{Result, SyncError, TransportError};
pub use presence::PresenceRenderer;
pub use protocol::{AwarenessEntry, Frame};
pub use provider::{ProviderConfig, ProviderConfigBuilder, SyncProvider};
pub use server::LocalServer;
pub use session::{Session, SessionSettings};
pub use status::{ConnectionState, ConnectionStatus, StatusTracker, StatusView};
pub use transport::{Connection, Connector};
pub use websocket::WsConnector;
