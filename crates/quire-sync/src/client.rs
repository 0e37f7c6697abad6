//! High-level client for the Quire collaboration stack.

use crate::auth::{CredentialSupplier, StaticToken};
use crate::binding::BindingFactory;
use crate::provider::ProviderConfig;
use crate::server::LocalServer;
use crate::session::{Session, SessionSettings};
use crate::transport::Connector;
use crate::websocket::WsConnector;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Configuration for the Quire client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// User name for presence.
    pub user_name: String,
    /// Cursor color; picked from the palette when absent.
    pub user_color: Option<String>,
    /// Connection and sync settings shared by every session.
    pub provider: ProviderConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_name: "Anonymous".to_string(),
            user_color: None,
            provider: ProviderConfig::default(),
        }
    }
}

/// Builder for client configuration.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn user_name(mut self, name: impl Into<String>) -> Self {
        self.config.user_name = name.into();
        self
    }

    pub fn user_color(mut self, color: impl Into<String>) -> Self {
        self.config.user_color = Some(color.into());
        self
    }

    pub fn provider(mut self, provider: ProviderConfig) -> Self {
        self.config.provider = provider;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The main Quire client.
///
/// Manages one [`Session`] per open document, all sharing a connector,
/// a credential supplier and a binding factory.
///
/// # Example
///
/// ```rust
/// use quire_sync::{Client, ClientConfig, LocalServer, Transaction};
///
/// # tokio_test::block_on(async {
/// let server = LocalServer::new();
/// let client = Client::with_local_server(&server, ClientConfig::default());
///
/// let session = client.open_session("notes");
/// let binding = session.binding().unwrap();
/// binding.apply(Transaction::new().insert_text(0, "Hello")).unwrap();
/// assert_eq!(binding.text().unwrap(), "Hello");
/// # });
/// ```
pub struct Client {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialSupplier>,
    factory: Arc<BindingFactory>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Client {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSupplier>,
        config: ClientConfig,
    ) -> Self {
        Self {
            config,
            connector,
            credentials,
            factory: Arc::new(BindingFactory::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Client for a WebSocket server at `base_url`.
    pub fn with_websocket(
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialSupplier>,
        config: ClientConfig,
    ) -> Self {
        Self::new(Arc::new(WsConnector::new(base_url)), credentials, config)
    }

    /// Client for an in-process server (for testing).
    pub fn with_local_server(server: &LocalServer, config: ClientConfig) -> Self {
        Self::new(
            Arc::new(server.clone()),
            Arc::new(StaticToken::new("local")),
            config,
        )
    }

    pub fn user_name(&self) -> &str {
        &self.config.user_name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn binding_factory(&self) -> &Arc<BindingFactory> {
        &self.factory
    }

    /// Open a document, or return its session if it is already open.
    /// Must be called inside a tokio runtime.
    pub fn open_session(&self, document_id: impl Into<String>) -> Arc<Session> {
        let document_id = document_id.into();
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&document_id) {
            if !existing.is_closed() {
                return existing.clone();
            }
        }
        let settings = SessionSettings {
            connector: self.connector.clone(),
            credentials: self.credentials.clone(),
            provider: self.config.provider.clone(),
            user_name: self.config.user_name.clone(),
            user_color: self.config.user_color.clone(),
            factory: self.factory.clone(),
        };
        let session = Arc::new(Session::open(document_id.clone(), settings));
        sessions.insert(document_id, session.clone());
        session
    }

    pub fn get_session(&self, document_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(document_id).cloned()
    }

    /// Close and forget a session. Returns whether it was open.
    pub fn close_session(&self, document_id: &str) -> bool {
        let removed = self.sessions.write().remove(document_id);
        match removed {
            Some(session) => {
                session.close();
                info!(document = %document_id, "session removed from client");
                true
            }
            None => false,
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every session.
    pub fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close_all();
    }
}
