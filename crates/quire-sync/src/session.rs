//! Editing session - one open document.
//!
//! A session owns the document, its awareness map, the sync provider and
//! the editor binding. Closing it (or dropping it) stops the provider,
//! publishes a null awareness state and releases the replica.
//!
//! Panics raised by host code running against the binding are contained by
//! [`Session::guard`]: the session enters a crashed state that only
//! [`Session::retry`] clears.

use crate::auth::CredentialSupplier;
use crate::awareness::{Awareness, CursorColors};
use crate::binding::{BindingFactory, BindingKey, EditorBinding};
use crate::document::CollaborativeDoc;
use crate::error::{Result, SyncError};
use crate::presence::PresenceRenderer;
use crate::provider::{self, ProviderConfig, SyncProvider};
use crate::status::{ConnectionState, StatusView};
use crate::transport::Connector;
use parking_lot::Mutex;
use quire_doc::ClientId;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info};
use ulid::Ulid;

/// Everything needed to (re)build the document/provider pair.
#[derive(Clone)]
pub struct SessionSettings {
    pub connector: Arc<dyn Connector>,
    pub credentials: Arc<dyn CredentialSupplier>,
    pub provider: ProviderConfig,
    pub user_name: String,
    /// Explicit cursor color; a palette color is picked when absent.
    pub user_color: Option<String>,
    pub factory: Arc<BindingFactory>,
}

struct SessionParts {
    doc: Arc<CollaborativeDoc>,
    awareness: Arc<Awareness>,
    provider: SyncProvider,
    binding: Arc<EditorBinding>,
}

impl SessionParts {
    fn build(document_id: &str, settings: &SessionSettings) -> Self {
        let client = ClientId::random();
        let (doc, outbox) = CollaborativeDoc::new(document_id, client);
        let doc = Arc::new(doc);
        let awareness = Arc::new(Awareness::new(client));
        let provider = SyncProvider::spawn(
            &doc,
            outbox,
            awareness.clone(),
            settings.connector.clone(),
            settings.credentials.clone(),
            settings.provider.clone(),
        );
        let key = BindingKey {
            document_id: document_id.to_string(),
            provider_id: provider.id(),
        };
        let binding = settings.factory.get_or_create(key, &doc, &awareness);
        let color = settings
            .user_color
            .clone()
            .unwrap_or_else(|| CursorColors::color_for(client).to_string());
        binding.set_presentation(&settings.user_name, &color);

        Self {
            doc,
            awareness,
            provider,
            binding,
        }
    }

    fn teardown(self) {
        let Self {
            doc,
            awareness,
            mut provider,
            binding,
        } = self;
        provider.shutdown();
        drop(binding);
        drop(awareness);
        drop(doc);
    }
}

/// One open collaborative document.
pub struct Session {
    document_id: String,
    settings: SessionSettings,
    parts: Mutex<Option<SessionParts>>,
    crash: Mutex<Option<String>>,
}

impl Session {
    /// Open a session and start syncing. Must be called inside a tokio runtime.
    pub fn open(document_id: impl Into<String>, settings: SessionSettings) -> Self {
        let document_id = document_id.into();
        let parts = SessionParts::build(&document_id, &settings);
        info!(document = %document_id, client = %parts.doc.client_id(), "opened session");
        Self {
            document_id,
            settings,
            parts: Mutex::new(Some(parts)),
            crash: Mutex::new(None),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    fn with_parts<R>(&self, f: impl FnOnce(&SessionParts) -> R) -> Result<R> {
        self.parts
            .lock()
            .as_ref()
            .map(f)
            .ok_or(SyncError::SessionClosed)
    }

    pub fn client_id(&self) -> Result<ClientId> {
        self.with_parts(|p| p.doc.client_id())
    }

    pub fn provider_id(&self) -> Result<Ulid> {
        self.with_parts(|p| p.provider.id())
    }

    /// The binding for the current document/provider pair. Stable across
    /// reconnects; replaced by [`Session::retry`].
    pub fn binding(&self) -> Result<Arc<EditorBinding>> {
        self.with_parts(|p| p.binding.clone())
    }

    pub fn awareness(&self) -> Result<Arc<Awareness>> {
        self.with_parts(|p| p.awareness.clone())
    }

    pub fn text(&self) -> Result<String> {
        self.with_parts(|p| p.doc.text())
    }

    /// Start a presence list for this session.
    pub fn presence(&self) -> Result<PresenceRenderer> {
        self.with_parts(|p| PresenceRenderer::subscribe(&p.awareness))
    }

    pub fn status(&self) -> Result<watch::Receiver<ConnectionState>> {
        self.with_parts(|p| p.provider.status())
    }

    pub fn connection_state(&self) -> Result<ConnectionState> {
        self.with_parts(|p| p.provider.state())
    }

    /// What the host should show right now.
    pub fn status_view(&self) -> Result<StatusView> {
        let state = self.connection_state()?;
        Ok(state.view(
            Instant::now(),
            self.settings.provider.sync_timeout(),
            self.is_crashed(),
        ))
    }

    /// Wait for the first sync of the current provider.
    pub async fn wait_synced(&self, timeout: Duration) -> Result<()> {
        let status = self.status()?;
        provider::wait_synced(status, timeout).await
    }

    // === Crash containment ===

    /// Run host code against the binding, turning a panic into a crashed
    /// session instead of unwinding through the caller.
    pub fn guard<R>(&self, f: impl FnOnce(&EditorBinding) -> Result<R>) -> Result<R> {
        if let Some(message) = self.crash.lock().clone() {
            return Err(SyncError::BindingCrash(message));
        }
        let binding = self.binding()?;
        match panic::catch_unwind(AssertUnwindSafe(|| f(&binding))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(document = %self.document_id, %message, "editor binding crashed");
                *self.crash.lock() = Some(message.clone());
                Err(SyncError::BindingCrash(message))
            }
        }
    }

    pub fn is_crashed(&self) -> bool {
        self.crash.lock().is_some()
    }

    /// Tear down and rebuild the document, provider and binding.
    ///
    /// Edits that never reached the server are discarded with the old
    /// replica; the new one is filled from the server on sync.
    pub fn retry(&self) -> Result<()> {
        let mut parts = self.parts.lock();
        let old = parts.take().ok_or(SyncError::SessionClosed)?;
        old.teardown();
        let fresh = SessionParts::build(&self.document_id, &self.settings);
        info!(
            document = %self.document_id,
            client = %fresh.doc.client_id(),
            provider = %fresh.provider.id(),
            "retrying session"
        );
        *parts = Some(fresh);
        *self.crash.lock() = None;
        Ok(())
    }

    /// Close the session. Idempotent.
    pub fn close(&self) {
        if let Some(parts) = self.parts.lock().take() {
            parts.teardown();
            info!(document = %self.document_id, "closed session");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.parts.lock().is_none()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "editor binding panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::binding::Transaction;
    use crate::server::LocalServer;

    fn settings(server: &LocalServer) -> SessionSettings {
        SessionSettings {
            connector: Arc::new(server.clone()),
            credentials: Arc::new(StaticToken::new("token")),
            provider: ProviderConfig::default(),
            user_name: "Tester".into(),
            user_color: None,
            factory: Arc::new(BindingFactory::new()),
        }
    }

    #[tokio::test]
    async fn test_guard_contains_panics() {
        let server = LocalServer::new();
        let session = Session::open("doc", settings(&server));

        let err = session
            .guard(|_| -> Result<()> { panic!("boom") })
            .unwrap_err();
        assert_eq!(err, SyncError::BindingCrash("boom".into()));
        assert!(session.is_crashed());
        assert_eq!(session.status_view().unwrap(), StatusView::Crashed);

        // Stays crashed until retried.
        let again = session.guard(|b| b.text()).unwrap_err();
        assert!(matches!(again, SyncError::BindingCrash(_)));

        session.retry().unwrap();
        assert!(!session.is_crashed());
        assert_eq!(session.guard(|b| b.text()).unwrap(), "");
    }

    #[tokio::test]
    async fn test_presentation_defaults_to_palette_color() {
        let server = LocalServer::new();
        let session = Session::open("doc", settings(&server));
        let client = session.client_id().unwrap();
        let user = session.binding().unwrap().presentation();

        assert_eq!(user.name, "Tester");
        assert_eq!(user.color, CursorColors::color_for(client));
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let server = LocalServer::new();
        let session = Session::open("doc", settings(&server));
        let binding = session.binding().unwrap();
        binding.apply(Transaction::new().insert_text(0, "x")).unwrap();

        session.close();
        assert!(session.is_closed());
        assert!(!binding.is_attached());
        assert_eq!(session.binding().unwrap_err(), SyncError::SessionClosed);
        assert_eq!(session.retry().unwrap_err(), SyncError::SessionClosed);
        session.close();
    }
}
