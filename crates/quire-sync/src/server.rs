//! In-process collaboration endpoint.
//!
//! `LocalServer` speaks the same frame protocol as a remote endpoint:
//! - checks the token in the `Auth` frame against an allow-list
//! - keeps one authoritative replica per document id
//! - answers with `SyncStep` (diff against the client's state vector),
//!   the current awareness entries, then `Synced`
//! - relays updates and awareness frames to the other connections
//! - on connection loss publishes `null` awareness for the clients that
//!   connection announced
//!
//! It also exposes fault-injection controls used by tests and the stress
//! binary: refusing connections, dropping live connections and
//! withholding the sync acknowledgment.

use crate::error::TransportError;
use crate::protocol::{AwarenessEntry, Frame};
use crate::transport::{Connection, Connector, DEFAULT_CHANNEL_CAPACITY};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use quire_doc::{ClientId, Replica, StateVector};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

type ConnId = u64;

#[derive(Default)]
struct Room {
    replica: Option<Replica>,
    peers: HashMap<ConnId, mpsc::Sender<Frame>>,
    awareness: HashMap<ClientId, (u64, serde_json::Value)>,
    /// Last clock seen per client while its connection is open, kept after a
    /// removal so stale frames on that connection lose.
    clocks: HashMap<ClientId, u64>,
    owners: HashMap<ConnId, HashSet<ClientId>>,
}

impl Room {
    fn replica(&mut self) -> &mut Replica {
        self.replica
            .get_or_insert_with(|| Replica::new(ClientId::new(0)))
    }

    fn others(&self, conn: ConnId) -> Vec<mpsc::Sender<Frame>> {
        self.peers
            .iter()
            .filter(|(id, _)| **id != conn)
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    fn awareness_snapshot(&self) -> Vec<AwarenessEntry> {
        let mut entries: Vec<AwarenessEntry> = self
            .awareness
            .iter()
            .map(|(client, (clock, state))| AwarenessEntry {
                client: *client,
                clock: *clock,
                state: Some(state.clone()),
            })
            .collect();
        entries.sort_by_key(|e| e.client);
        entries
    }

    /// Record entries announced on `conn`; returns the ones to relay.
    fn record_awareness(&mut self, conn: ConnId, entries: Vec<AwarenessEntry>) -> Vec<AwarenessEntry> {
        let mut accepted = Vec::new();
        for entry in entries {
            let last = self.clocks.get(&entry.client).copied();
            if last.map(|c| entry.clock < c).unwrap_or(false) {
                continue;
            }
            self.clocks.insert(entry.client, entry.clock);
            self.owners.entry(conn).or_default().insert(entry.client);
            match &entry.state {
                Some(state) if !state.is_null() => {
                    self.awareness
                        .insert(entry.client, (entry.clock, state.clone()));
                }
                _ => {
                    self.awareness.remove(&entry.client);
                }
            }
            accepted.push(entry);
        }
        accepted
    }

    /// Forget a connection; returns removal entries for its clients.
    fn disconnect(&mut self, conn: ConnId) -> Vec<AwarenessEntry> {
        self.peers.remove(&conn);
        let owned = self.owners.remove(&conn).unwrap_or_default();
        let mut removals = Vec::new();
        for client in owned {
            let clock = self.clocks.remove(&client).unwrap_or(0);
            if self.awareness.remove(&client).is_some() {
                removals.push(AwarenessEntry {
                    client,
                    clock,
                    state: None,
                });
            }
        }
        removals.sort_by_key(|e| e.client);
        removals
    }
}

struct ServerInner {
    /// `None` accepts every token.
    tokens: RwLock<Option<HashSet<String>>>,
    rooms: Mutex<HashMap<String, Room>>,
    offline: AtomicBool,
    withhold_synced: AtomicBool,
    attempts: AtomicUsize,
    next_conn: AtomicU64,
    /// Bumped to force every live connection closed.
    generation: watch::Sender<u64>,
    capacity: usize,
}

/// In-process collaboration endpoint. Cloning shares the same server.
#[derive(Clone)]
pub struct LocalServer {
    inner: Arc<ServerInner>,
}

impl LocalServer {
    /// A server that accepts any token.
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(ServerInner {
                tokens: RwLock::new(None),
                rooms: Mutex::new(HashMap::new()),
                offline: AtomicBool::new(false),
                withhold_synced: AtomicBool::new(false),
                attempts: AtomicUsize::new(0),
                next_conn: AtomicU64::new(1),
                generation,
                capacity: DEFAULT_CHANNEL_CAPACITY,
            }),
        }
    }

    /// A server that only accepts the given tokens.
    pub fn with_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let server = Self::new();
        server.set_tokens(tokens);
        server
    }

    pub fn set_tokens<I, S>(&self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.inner.tokens.write() = Some(tokens.into_iter().map(Into::into).collect());
    }

    // === Fault injection ===

    /// Refuse new connections while `offline` is set.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Do not send `Synced` to new connections.
    pub fn withhold_synced(&self, withhold: bool) {
        self.inner.withhold_synced.store(withhold, Ordering::SeqCst);
    }

    /// Close every live connection, as if the network dropped.
    pub fn drop_connections(&self) {
        info!("dropping all live connections");
        self.inner.generation.send_modify(|g| *g += 1);
    }

    // === Inspection ===

    /// Number of `connect` calls, including refused ones.
    pub fn connection_attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Live, authenticated connections for a document.
    pub fn peer_count(&self, document_id: &str) -> usize {
        self.inner
            .rooms
            .lock()
            .get(document_id)
            .map(|room| room.peers.len())
            .unwrap_or(0)
    }

    /// Text of the server's copy of a document.
    pub fn document_text(&self, document_id: &str) -> Option<String> {
        self.inner
            .rooms
            .lock()
            .get(document_id)
            .and_then(|room| room.replica.as_ref().map(|r| r.text()))
    }

    fn accepts(&self, token: &str) -> bool {
        match &*self.inner.tokens.read() {
            Some(tokens) => tokens.contains(token),
            None => true,
        }
    }
}

impl Default for LocalServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for LocalServer {
    async fn connect(&self, document_id: &str) -> Result<Connection, TransportError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed("server offline".into()));
        }

        let (client_tx, server_rx) = mpsc::channel(self.inner.capacity);
        let (server_tx, client_rx) = mpsc::channel(self.inner.capacity);
        let conn = self.inner.next_conn.fetch_add(1, Ordering::SeqCst);
        let server = self.clone();
        let document_id = document_id.to_string();
        tokio::spawn(async move {
            server.serve(conn, document_id, server_rx, server_tx).await;
        });

        Ok(Connection {
            outgoing: client_tx,
            incoming: client_rx,
        })
    }
}

impl LocalServer {
    async fn serve(
        &self,
        conn: ConnId,
        document_id: String,
        mut rx: mpsc::Receiver<Frame>,
        tx: mpsc::Sender<Frame>,
    ) {
        let mut generation = self.inner.generation.subscribe();
        generation.borrow_and_update();

        let Some(Frame::Auth {
            document_id: claimed,
            token,
            state_vector,
        }) = rx.recv().await
        else {
            debug!(conn, "connection closed before auth");
            return;
        };

        if claimed != document_id || !self.accepts(&token) {
            warn!(conn, document = %document_id, "rejecting connection");
            let _ = tx
                .send(Frame::AuthRejected {
                    reason: "invalid credential".into(),
                })
                .await;
            return;
        }

        let client_sv = StateVector::decode(&state_vector).unwrap_or_else(|e| {
            warn!(conn, error = %e, "malformed state vector, sending full state");
            StateVector::new()
        });

        let greeting = {
            let mut rooms = self.inner.rooms.lock();
            let room = rooms.entry(document_id.clone()).or_default();
            room.peers.insert(conn, tx.clone());
            let replica = room.replica();
            let step = match (
                replica.encode_diff_since(&client_sv),
                replica.state_vector().encode(),
            ) {
                (Ok(update), Ok(state_vector)) => Some(Frame::SyncStep {
                    update,
                    state_vector,
                }),
                _ => None,
            };
            (step, room.awareness_snapshot())
        };

        let (step, awareness) = greeting;
        let Some(step) = step else {
            warn!(conn, "could not encode sync step");
            self.leave(conn, &document_id).await;
            return;
        };
        let mut frames = vec![step];
        if !awareness.is_empty() {
            frames.push(Frame::Awareness { entries: awareness });
        }
        if !self.inner.withhold_synced.load(Ordering::SeqCst) {
            frames.push(Frame::Synced);
        }
        for frame in frames {
            if tx.send(frame).await.is_err() {
                self.leave(conn, &document_id).await;
                return;
            }
        }
        info!(conn, document = %document_id, "client synced");

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    self.handle(conn, &document_id, frame).await;
                }
                changed = generation.changed() => {
                    if changed.is_ok() {
                        debug!(conn, "forced disconnect");
                    }
                    break;
                }
            }
        }

        self.leave(conn, &document_id).await;
    }

    async fn handle(&self, conn: ConnId, document_id: &str, frame: Frame) {
        let relay = {
            let mut rooms = self.inner.rooms.lock();
            let Some(room) = rooms.get_mut(document_id) else {
                return;
            };
            match frame {
                Frame::Update { update } => match room.replica().apply_remote_update(&update) {
                    Ok(outcome) if outcome.is_noop() && outcome.pending == 0 => None,
                    Ok(_) => Some((room.others(conn), Frame::Update { update })),
                    Err(e) => {
                        warn!(conn, error = %e, "dropping malformed update");
                        None
                    }
                },
                Frame::Awareness { entries } => {
                    let accepted = room.record_awareness(conn, entries);
                    if accepted.is_empty() {
                        None
                    } else {
                        Some((room.others(conn), Frame::Awareness { entries: accepted }))
                    }
                }
                other => {
                    debug!(conn, kind = other.kind(), "ignoring unexpected frame");
                    None
                }
            }
        };

        if let Some((peers, frame)) = relay {
            broadcast(peers, frame).await;
        }
    }

    async fn leave(&self, conn: ConnId, document_id: &str) {
        let (peers, removals) = {
            let mut rooms = self.inner.rooms.lock();
            let Some(room) = rooms.get_mut(document_id) else {
                return;
            };
            let removals = room.disconnect(conn);
            (room.others(conn), removals)
        };
        debug!(conn, document = %document_id, "connection closed");
        if !removals.is_empty() {
            broadcast(peers, Frame::Awareness { entries: removals }).await;
        }
    }
}

async fn broadcast(peers: Vec<mpsc::Sender<Frame>>, frame: Frame) {
    for peer in peers {
        // A closed peer is cleaned up by its own task.
        let _ = peer.send(frame.clone()).await;
    }
}
