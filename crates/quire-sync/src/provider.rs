//! Sync provider - binds one document to a collaboration endpoint.
//!
//! The provider runs as a single tokio task per session:
//! - asks the credential supplier for a fresh token on every attempt
//! - performs the `Auth` / `SyncStep` / `Synced` handshake
//! - pushes local updates and awareness changes, applies remote ones
//! - renews the local awareness entry and expires silent peers
//! - reconnects with exponential backoff until `max_retries` consecutive
//!   failures; an auth rejection stops it for good
//!
//! The task only holds a weak reference to the document, so closing the
//! session releases the replica immediately.

use crate::auth::CredentialSupplier;
use crate::awareness::{Awareness, ChangeOrigin};
use crate::document::CollaborativeDoc;
use crate::error::{Result, SyncError};
use crate::protocol::Frame;
use crate::status::{ConnectionState, ConnectionStatus, StatusTracker};
use crate::transport::{Connection, Connector};
use parking_lot::Mutex;
use quire_doc::{StateVector, Update};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Configuration for a sync provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Consecutive failed attempts before giving up.
    pub max_retries: u32,
    /// First reconnect delay (in milliseconds).
    pub initial_backoff_ms: u64,
    /// Upper bound on the reconnect delay (in milliseconds).
    pub max_backoff_ms: u64,
    /// Connected-but-unsynced window before the slow-sync diagnostic.
    pub sync_timeout_ms: u64,
    /// How often the local awareness entry is renewed.
    pub heartbeat_interval_ms: u64,
    /// Remote awareness entries not renewed within this window are dropped.
    pub awareness_timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_backoff_ms: 250,
            max_backoff_ms: 10_000,
            sync_timeout_ms: 15_000,
            heartbeat_interval_ms: 15_000,
            awareness_timeout_ms: 30_000,
        }
    }
}

impl ProviderConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn awareness_timeout(&self) -> Duration {
        Duration::from_millis(self.awareness_timeout_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based), with up to 25% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        let jitter = if base >= 4 {
            rand::thread_rng().gen_range(0..=base / 4)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }
}

/// Builder for provider configuration.
pub struct ProviderConfigBuilder {
    config: ProviderConfig,
}

impl ProviderConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ProviderConfig::default(),
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.config.initial_backoff_ms = initial_ms;
        self.config.max_backoff_ms = max_ms.max(initial_ms);
        self
    }

    pub fn sync_timeout(mut self, ms: u64) -> Self {
        self.config.sync_timeout_ms = ms;
        self
    }

    pub fn heartbeat_interval(mut self, ms: u64) -> Self {
        self.config.heartbeat_interval_ms = ms;
        self
    }

    pub fn awareness_timeout(mut self, ms: u64) -> Self {
        self.config.awareness_timeout_ms = ms;
        self
    }

    pub fn build(self) -> ProviderConfig {
        self.config
    }
}

impl Default for ProviderConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

type LiveLink = Arc<Mutex<Option<mpsc::Sender<Frame>>>>;

/// Handle to a running provider task.
pub struct SyncProvider {
    id: Ulid,
    document_id: String,
    status: watch::Receiver<ConnectionState>,
    awareness: Arc<Awareness>,
    link: LiveLink,
    task: Option<JoinHandle<()>>,
}

impl SyncProvider {
    /// Start syncing `doc`. Must be called inside a tokio runtime.
    pub fn spawn(
        doc: &Arc<CollaborativeDoc>,
        outbox: mpsc::UnboundedReceiver<Update>,
        awareness: Arc<Awareness>,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSupplier>,
        config: ProviderConfig,
    ) -> Self {
        let id = Ulid::new();
        let document_id = doc.document_id().to_string();
        let tracker = StatusTracker::new();
        let status = tracker.subscribe();
        let link: LiveLink = Arc::new(Mutex::new(None));

        let task = ProviderTask {
            id,
            document_id: document_id.clone(),
            doc: Arc::downgrade(doc),
            outbox,
            awareness: awareness.clone(),
            connector,
            credentials,
            config,
            status: tracker,
            link: link.clone(),
        };
        info!(provider = %id, document = %document_id, "starting sync provider");
        let task = tokio::spawn(task.run());

        Self {
            id,
            document_id,
            status,
            awareness,
            link,
            task: Some(task),
        }
    }

    /// Identity used to key the editor binding.
    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Watch signal of the connection state.
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().clone()
    }

    pub fn is_synced(&self) -> bool {
        self.status.borrow().synced
    }

    /// Whether the task stopped (gave up, auth failure or shutdown).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    /// Wait for the first sync. Fails early on auth failure or when
    /// reconnects were exhausted.
    pub async fn wait_synced(&self, timeout: Duration) -> Result<()> {
        wait_synced(self.status(), timeout).await
    }

    /// Tear down: publish the awareness removal on the live link, then stop
    /// the task. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.awareness.clear_local();
        if let Some(link) = self.link.lock().take() {
            let entry = self.awareness.local_entry();
            if let Err(e) = link.try_send(Frame::Awareness {
                entries: vec![entry],
            }) {
                debug!(provider = %self.id, error = %e, "could not send awareness removal");
            }
        }
        task.abort();
        info!(provider = %self.id, document = %self.document_id, "sync provider stopped");
    }
}

impl Drop for SyncProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wait on a status signal until synced, auth failure, give-up or timeout.
pub async fn wait_synced(
    mut status: watch::Receiver<ConnectionState>,
    timeout: Duration,
) -> Result<()> {
    let wait = async {
        loop {
            {
                let state = status.borrow_and_update();
                if state.synced {
                    return Ok(());
                }
                if state.auth_failed {
                    return Err(SyncError::AuthenticationFailure(
                        "credential rejected".into(),
                    ));
                }
                if state.gave_up {
                    return Err(SyncError::NetworkDisconnect(format!(
                        "gave up after {} attempts",
                        state.retry_count
                    )));
                }
            }
            if status.changed().await.is_err() {
                return Err(SyncError::SessionClosed);
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| SyncError::SyncTimeout(timeout))?
}

/// How one connection attempt ended.
enum Attempt {
    /// Could not open or authenticate the channel.
    Failed(String),
    /// The channel dropped; `synced` if it completed a sync first.
    Closed { synced: bool },
    AuthRejected(String),
    /// The session is gone.
    Shutdown,
}

struct ProviderTask {
    id: Ulid,
    document_id: String,
    doc: Weak<CollaborativeDoc>,
    outbox: mpsc::UnboundedReceiver<Update>,
    awareness: Arc<Awareness>,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialSupplier>,
    config: ProviderConfig,
    status: StatusTracker,
    link: LiveLink,
}

impl ProviderTask {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        loop {
            if self.doc.strong_count() == 0 {
                return;
            }
            self.status.transition(ConnectionStatus::Connecting);
            let attempt = self.attempt().await;
            *self.link.lock() = None;

            match attempt {
                Attempt::Shutdown => return,
                Attempt::AuthRejected(reason) => {
                    warn!(provider = %self.id, %reason, "authentication rejected, not reconnecting");
                    self.status.transition(ConnectionStatus::AuthenticationFailed);
                    self.awareness.clear_remote();
                    return;
                }
                Attempt::Failed(reason) => {
                    debug!(provider = %self.id, %reason, "connection attempt failed");
                    self.status.transition(ConnectionStatus::Disconnected);
                }
                Attempt::Closed { synced } => {
                    info!(provider = %self.id, "connection lost");
                    self.awareness.clear_remote();
                    self.status.transition(ConnectionStatus::Disconnected);
                    if synced {
                        failures = 0;
                    }
                }
            }

            failures += 1;
            if failures > self.config.max_retries {
                warn!(provider = %self.id, failures, "giving up on reconnecting");
                self.status.give_up();
                return;
            }
            self.status.set_retry_count(failures);
            let delay = self.config.backoff(failures);
            debug!(provider = %self.id, ?delay, attempt = failures, "reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&mut self) -> Attempt {
        let token = match self.credentials.token().await {
            Ok(token) => token,
            Err(SyncError::AuthenticationFailure(reason)) => return Attempt::AuthRejected(reason),
            Err(e) => return Attempt::Failed(e.to_string()),
        };
        let conn = match self.connector.connect(&self.document_id).await {
            Ok(conn) => conn,
            Err(e) => return Attempt::Failed(e.to_string()),
        };
        self.status.transition(ConnectionStatus::Connected);
        self.drive(conn, token).await
    }

    async fn drive(&mut self, conn: Connection, token: String) -> Attempt {
        let Connection {
            outgoing,
            mut incoming,
        } = conn;

        let state_vector = match self.with_doc(|doc| doc.state_vector().encode()) {
            None => return Attempt::Shutdown,
            Some(Err(e)) => return Attempt::Failed(e.to_string()),
            Some(Ok(sv)) => sv,
        };
        // Anything queued while offline is covered by the diff sent after SyncStep.
        while self.outbox.try_recv().is_ok() {}

        let auth = Frame::Auth {
            document_id: self.document_id.clone(),
            token,
            state_vector,
        };
        if outgoing.send(auth).await.is_err() {
            return Attempt::Closed { synced: false };
        }
        *self.link.lock() = Some(outgoing.clone());

        let mut synced = false;
        let mut awareness_events = self.awareness.subscribe();
        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

        // Renewed so it wins over the removal the server published when the
        // previous channel dropped.
        if let Some(local) = self.awareness.renew_local() {
            let announce = Frame::Awareness {
                entries: vec![local],
            };
            if outgoing.send(announce).await.is_err() {
                return Attempt::Closed { synced };
            }
        }

        loop {
            let outbound = tokio::select! {
                frame = incoming.recv() => {
                    let Some(frame) = frame else {
                        return Attempt::Closed { synced };
                    };
                    match self.handle_frame(frame) {
                        Handled::Continue(reply) => reply,
                        Handled::Synced => {
                            synced = true;
                            None
                        }
                        Handled::End(end) => return end,
                    }
                }
                update = self.outbox.recv() => match update {
                    Some(update) => match update.encode() {
                        Ok(bytes) => Some(Frame::Update { update: bytes }),
                        Err(e) => {
                            warn!(provider = %self.id, error = %e, "could not encode local update");
                            None
                        }
                    },
                    None => return Attempt::Shutdown,
                },
                event = awareness_events.recv() => match event {
                    Ok(event) if event.origin == ChangeOrigin::Local => Some(Frame::Awareness {
                        entries: vec![self.awareness.local_entry()],
                    }),
                    Ok(_) => None,
                    Err(RecvError::Lagged(_)) => Some(Frame::Awareness {
                        entries: vec![self.awareness.local_entry()],
                    }),
                    Err(RecvError::Closed) => return Attempt::Shutdown,
                },
                _ = heartbeat.tick() => {
                    let expired = self.awareness.remove_stale(self.config.awareness_timeout());
                    if !expired.is_empty() {
                        debug!(provider = %self.id, count = expired.len(), "expired silent peers");
                    }
                    self.awareness
                        .renew_local()
                        .map(|entry| Frame::Awareness { entries: vec![entry] })
                }
            };

            if let Some(frame) = outbound {
                if outgoing.send(frame).await.is_err() {
                    return Attempt::Closed { synced };
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Handled {
        match frame {
            Frame::AuthRejected { reason } => Handled::End(Attempt::AuthRejected(reason)),
            Frame::Synced => {
                if self.status.transition(ConnectionStatus::Synced) {
                    info!(provider = %self.id, document = %self.document_id, "synced");
                }
                Handled::Synced
            }
            Frame::SyncStep {
                update,
                state_vector,
            } => {
                let reply = self.with_doc(|doc| {
                    apply_remote(self.id, doc, &update);
                    let server_sv = match StateVector::decode(&state_vector) {
                        Ok(sv) => sv,
                        Err(e) => {
                            warn!(provider = %self.id, error = %e, "malformed server state vector");
                            return None;
                        }
                    };
                    let diff = doc.read(|replica| replica.diff_since(&server_sv));
                    if diff.is_empty() {
                        return None;
                    }
                    match diff.encode() {
                        Ok(bytes) => Some(Frame::Update { update: bytes }),
                        Err(e) => {
                            warn!(provider = %self.id, error = %e, "could not encode diff");
                            None
                        }
                    }
                });
                match reply {
                    None => Handled::End(Attempt::Shutdown),
                    Some(frame) => Handled::Continue(frame),
                }
            }
            Frame::Update { update } => match self.with_doc(|doc| apply_remote(self.id, doc, &update)) {
                None => Handled::End(Attempt::Shutdown),
                Some(()) => Handled::Continue(None),
            },
            Frame::Awareness { entries } => {
                self.awareness.apply_remote(&entries);
                Handled::Continue(None)
            }
            Frame::Auth { .. } => {
                debug!(provider = %self.id, "ignoring auth frame from server");
                Handled::Continue(None)
            }
        }
    }

    /// Run `f` with the document if the session still exists.
    fn with_doc<R>(&self, f: impl FnOnce(&CollaborativeDoc) -> R) -> Option<R> {
        self.doc.upgrade().map(|doc| f(&doc))
    }
}

enum Handled {
    Continue(Option<Frame>),
    Synced,
    End(Attempt),
}

fn apply_remote(provider: Ulid, doc: &CollaborativeDoc, update: &[u8]) {
    match doc.apply_remote(update) {
        Ok(outcome) if outcome.pending > 0 => {
            debug!(provider = %provider, pending = outcome.pending, "update waiting for dependencies");
        }
        Ok(_) => {}
        Err(e) => warn!(provider = %provider, error = %e, "ignoring malformed remote update"),
    }
}
