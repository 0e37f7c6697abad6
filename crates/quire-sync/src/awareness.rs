//! Awareness - ephemeral per-client presence.
//!
//! Every client publishes `{user: {name, color}, cursor}` under its client
//! id with a logical clock. Entries are never persisted. A `null` state
//! removes the entry, which is how a clean disconnect makes peers drop a
//! cursor immediately.
//!
//! Remote states are untrusted. They are sanitized field by field and
//! defaulted when malformed; an entry is never dropped for bad content.

use crate::protocol::AwarenessEntry;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use quire_doc::{Anchor, ClientId};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

/// Color used when a peer's color fails validation.
pub const DEFAULT_COLOR: &str = "#808080";

/// Name used when a peer's name is missing or empty after cleaning.
pub const DEFAULT_NAME: &str = "Anonymous";

/// Maximum display-name length, in characters.
pub const MAX_NAME_CHARS: usize = 32;

static COLOR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^(?:",
        r"#(?:[0-9a-fA-F]{3,4}|[0-9a-fA-F]{6}|[0-9a-fA-F]{8})",
        r"|rgba?\(\s*\d{1,3}%?\s*,\s*\d{1,3}%?\s*,\s*\d{1,3}%?\s*(?:,\s*(?:0|1|0?\.\d{1,3}|\d{1,3}%)\s*)?\)",
        r"|hsla?\(\s*\d{1,3}(?:deg)?\s*,\s*\d{1,3}%\s*,\s*\d{1,3}%\s*(?:,\s*(?:0|1|0?\.\d{1,3}|\d{1,3}%)\s*)?\)",
        r"|[a-zA-Z]{1,20}",
        r")$"
    ))
    .expect("color pattern is valid")
});

/// Palette for colors assigned to clients that did not pick one.
pub struct CursorColors;

impl CursorColors {
    pub const COLORS: [&'static str; 12] = [
        "#E91E63", // Pink
        "#9C27B0", // Purple
        "#3F51B5", // Indigo
        "#2196F3", // Blue
        "#00BCD4", // Cyan
        "#009688", // Teal
        "#4CAF50", // Green
        "#8BC34A", // Light Green
        "#CDDC39", // Lime
        "#FF9800", // Orange
        "#FF5722", // Deep Orange
        "#795548", // Brown
    ];

    pub fn color_for(client: ClientId) -> &'static str {
        Self::COLORS[(client.0 % Self::COLORS.len() as u64) as usize]
    }
}

/// Validate a color against the allow-list, falling back to [`DEFAULT_COLOR`].
pub fn sanitize_color(raw: &str) -> String {
    let trimmed = raw.trim();
    if COLOR_PATTERN.is_match(trimmed) {
        trimmed.to_string()
    } else {
        DEFAULT_COLOR.to_string()
    }
}

/// Trim, drop control characters and truncate a display name.
///
/// The result is still plain text; renderers must escape it.
pub fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .chars()
        .take(MAX_NAME_CHARS)
        .collect();
    let cleaned = cleaned.trim_end().to_string();
    if cleaned.is_empty() {
        DEFAULT_NAME.to_string()
    } else {
        cleaned
    }
}

/// Escape text for inclusion in HTML.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Display identity of a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub color: String,
}

impl UserInfo {
    /// Build a sanitized identity.
    pub fn new(name: &str, color: &str) -> Self {
        Self {
            name: sanitize_name(name),
            color: sanitize_color(color),
        }
    }

    /// Sanitize an untrusted `user` object; missing or mistyped fields default.
    pub fn from_untrusted(value: Option<&serde_json::Value>) -> Self {
        let name = value
            .and_then(|v| v.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let color = value
            .and_then(|v| v.get("color"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        Self::new(name, color)
    }
}

/// A caret or selection expressed as relative positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: Anchor,
    pub head: Anchor,
}

/// The state one client publishes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub user: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorRange>,
}

impl AwarenessState {
    /// Sanitize an untrusted state. Never fails: bad fields are defaulted.
    pub fn from_untrusted(value: &serde_json::Value) -> Self {
        let user = UserInfo::from_untrusted(value.get("user"));
        let cursor = value
            .get("cursor")
            .and_then(|c| serde_json::from_value::<CursorRange>(c.clone()).ok());
        Self { user, cursor }
    }
}

/// A remote collaborator as shown to the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Collaborator {
    pub client: ClientId,
    pub name: String,
    pub color: String,
    pub cursor: Option<CursorRange>,
}

/// Whether an awareness change was made locally or received.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Awareness change notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AwarenessEvent {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    pub origin: ChangeOrigin,
}

impl AwarenessEvent {
    fn new(origin: ChangeOrigin) -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug)]
struct RemoteEntry {
    clock: u64,
    state: Option<AwarenessState>,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    local_clock: u64,
    local_state: Option<AwarenessState>,
    remote: HashMap<ClientId, RemoteEntry>,
}

/// Awareness map for one session.
pub struct Awareness {
    local: ClientId,
    inner: RwLock<Inner>,
    event_tx: broadcast::Sender<AwarenessEvent>,
}

impl Awareness {
    pub fn new(local: ClientId) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            local,
            inner: RwLock::new(Inner::default()),
            event_tx,
        }
    }

    pub fn local_client(&self) -> ClientId {
        self.local
    }

    /// Subscribe to awareness changes.
    pub fn subscribe(&self) -> broadcast::Receiver<AwarenessEvent> {
        self.event_tx.subscribe()
    }

    // === Local state ===

    /// Publish (or replace) the local user identity, keeping the cursor.
    pub fn set_local_user(&self, user: UserInfo) {
        let mut inner = self.inner.write();
        let cursor = inner.local_state.as_ref().and_then(|s| s.cursor);
        let state = AwarenessState { user, cursor };
        self.set_local(&mut inner, Some(state));
    }

    /// Update the local cursor. Ignored until a user identity is published.
    pub fn set_local_cursor(&self, cursor: Option<CursorRange>) {
        let mut inner = self.inner.write();
        let Some(mut state) = inner.local_state.clone() else {
            return;
        };
        if state.cursor == cursor {
            return;
        }
        state.cursor = cursor;
        self.set_local(&mut inner, Some(state));
    }

    /// Set the local state to null.
    pub fn clear_local(&self) {
        let mut inner = self.inner.write();
        if inner.local_state.is_some() {
            self.set_local(&mut inner, None);
        }
    }

    pub fn local_state(&self) -> Option<AwarenessState> {
        self.inner.read().local_state.clone()
    }

    /// The local entry as it goes on the wire.
    pub fn local_entry(&self) -> AwarenessEntry {
        let inner = self.inner.read();
        self.entry_for(&inner)
    }

    /// Bump the local clock so peers see the entry as alive.
    pub fn renew_local(&self) -> Option<AwarenessEntry> {
        let mut inner = self.inner.write();
        inner.local_state.as_ref()?;
        inner.local_clock += 1;
        Some(self.entry_for(&inner))
    }

    fn set_local(&self, inner: &mut Inner, state: Option<AwarenessState>) {
        let mut event = AwarenessEvent::new(ChangeOrigin::Local);
        match (&inner.local_state, &state) {
            (None, Some(_)) => event.added.push(self.local),
            (Some(_), None) => event.removed.push(self.local),
            _ => event.updated.push(self.local),
        }
        inner.local_clock += 1;
        inner.local_state = state;
        let _ = self.event_tx.send(event);
    }

    fn entry_for(&self, inner: &Inner) -> AwarenessEntry {
        AwarenessEntry {
            client: self.local,
            clock: inner.local_clock,
            state: inner
                .local_state
                .as_ref()
                .and_then(|s| serde_json::to_value(s).ok()),
        }
    }

    // === Remote state ===

    /// Merge received entries. Returns the resulting event (also broadcast).
    pub fn apply_remote(&self, entries: &[AwarenessEntry]) -> AwarenessEvent {
        let mut event = AwarenessEvent::new(ChangeOrigin::Remote);
        let now = Instant::now();
        let mut inner = self.inner.write();

        for entry in entries {
            if entry.client == self.local {
                debug!(client = %entry.client, "ignoring awareness entry claiming the local id");
                continue;
            }
            let state = entry.state.as_ref().and_then(|v| {
                if v.is_null() {
                    None
                } else {
                    Some(AwarenessState::from_untrusted(v))
                }
            });

            match inner.remote.get_mut(&entry.client) {
                Some(current) => {
                    let newer = entry.clock > current.clock
                        || (entry.clock == current.clock
                            && state.is_none()
                            && current.state.is_some());
                    if !newer {
                        continue;
                    }
                    match (&current.state, &state) {
                        (None, Some(_)) => event.added.push(entry.client),
                        (Some(_), None) => event.removed.push(entry.client),
                        (Some(old), Some(new)) if old != new => event.updated.push(entry.client),
                        _ => {}
                    }
                    current.clock = entry.clock;
                    current.state = state;
                    current.last_seen = now;
                }
                None => {
                    if state.is_some() {
                        event.added.push(entry.client);
                    }
                    inner.remote.insert(
                        entry.client,
                        RemoteEntry {
                            clock: entry.clock,
                            state,
                            last_seen: now,
                        },
                    );
                }
            }
        }
        drop(inner);

        if !event.is_empty() {
            let _ = self.event_tx.send(event.clone());
        }
        event
    }

    /// Remove remote entries not renewed within `timeout`.
    ///
    /// Removed entries keep their clock for another `timeout` so a delayed
    /// older frame cannot bring them back; after that they are forgotten.
    pub fn remove_stale(&self, timeout: Duration) -> Vec<ClientId> {
        let now = Instant::now();
        self.inner.write().remote.retain(|_, entry| {
            entry.state.is_some() || now.duration_since(entry.last_seen) < timeout
        });
        self.remove_where(|entry| now.duration_since(entry.last_seen) >= timeout)
    }

    /// Forget every remote entry, clocks included, e.g. after the channel
    /// dropped. The next snapshot from the server starts from scratch.
    pub fn clear_remote(&self) -> Vec<ClientId> {
        let removed = self.remove_where(|_| true);
        self.inner.write().remote.clear();
        removed
    }

    fn remove_where(&self, predicate: impl Fn(&RemoteEntry) -> bool) -> Vec<ClientId> {
        let mut removed = Vec::new();
        {
            let now = Instant::now();
            let mut inner = self.inner.write();
            for (client, entry) in inner.remote.iter_mut() {
                if entry.state.is_some() && predicate(entry) {
                    entry.state = None;
                    entry.last_seen = now;
                    removed.push(*client);
                }
            }
        }
        removed.sort();
        if !removed.is_empty() {
            let mut event = AwarenessEvent::new(ChangeOrigin::Remote);
            event.removed = removed.clone();
            let _ = self.event_tx.send(event);
        }
        removed
    }

    /// Sanitized remote collaborators, ordered by client id. Never contains
    /// the local client.
    pub fn collaborators(&self) -> Vec<Collaborator> {
        let inner = self.inner.read();
        let mut list: Vec<Collaborator> = inner
            .remote
            .iter()
            .filter(|(client, _)| **client != self.local)
            .filter_map(|(client, entry)| {
                entry.state.as_ref().map(|state| Collaborator {
                    client: *client,
                    name: state.user.name.clone(),
                    color: state.user.color.clone(),
                    cursor: state.cursor,
                })
            })
            .collect();
        list.sort_by_key(|c| c.client);
        list
    }

    pub fn remote_len(&self) -> usize {
        self.inner
            .read()
            .remote
            .values()
            .filter(|e| e.state.is_some())
            .count()
    }
}
