//! Connection state machine.
//!
//! ```text
//! Initial -> Connecting -> Connected -> Synced
//!                 |            |          |
//!                 v            v          v
//!            Disconnected <----+----------+
//!                 |
//!                 +-> Connecting ...
//!
//! Connecting / Connected -> AuthenticationFailed (terminal)
//! ```
//!
//! `synced` is sticky: once the first sync completed it stays true for the
//! lifetime of the provider, whatever happens to the channel afterwards.

use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Default window after which a connected-but-unsynced session is flagged.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Initial,
    Connecting,
    Connected,
    Synced,
    Disconnected,
    AuthenticationFailed,
}

impl ConnectionStatus {
    /// Whether `next` is a legal successor of this status.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Initial, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, AuthenticationFailed)
                | (Connected, Synced)
                | (Connected, Disconnected)
                | (Connected, AuthenticationFailed)
                | (Synced, Disconnected)
                | (Disconnected, Connecting)
        )
    }

    pub fn is_online(self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::Synced)
    }
}

/// Snapshot of one connection session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Sticky first-sync flag.
    pub synced: bool,
    pub auth_failed: bool,
    /// Consecutive failed attempts since the last successful sync.
    pub retry_count: u32,
    /// Automatic reconnects were exhausted.
    pub gave_up: bool,
    /// When the current channel opened; cleared on disconnect.
    pub connected_since: Option<Instant>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Initial,
            synced: false,
            auth_failed: false,
            retry_count: 0,
            gave_up: false,
            connected_since: None,
        }
    }
}

impl ConnectionState {
    /// Connected, not yet synced, and the window has elapsed.
    pub fn is_taking_too_long(&self, now: Instant, window: Duration) -> bool {
        self.status == ConnectionStatus::Connected
            && !self.synced
            && self
                .connected_since
                .map(|since| now.saturating_duration_since(since) >= window)
                .unwrap_or(false)
    }

    /// Derive what the host UI should show.
    pub fn view(&self, now: Instant, window: Duration, crashed: bool) -> StatusView {
        if self.auth_failed {
            StatusView::AuthFailed
        } else if crashed {
            StatusView::Crashed
        } else if self.synced {
            StatusView::Ready {
                online: self.status.is_online(),
            }
        } else if self.gave_up {
            StatusView::Offline
        } else if self.is_taking_too_long(now, window) {
            StatusView::SlowSync
        } else {
            StatusView::Connecting
        }
    }
}

/// User-facing status. Each variant needs a distinct presentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusView {
    /// Normal connecting; no action needed.
    Connecting,
    /// Connected but the first sync is slow; offer a retry.
    SlowSync,
    /// Editable. `online` is false while a synced session reconnects.
    Ready { online: bool },
    /// Credential refused; the user must sign in again.
    AuthFailed,
    /// The editing surface crashed; offer a retry.
    Crashed,
    /// Automatic reconnects gave up before the first sync; offer a retry.
    Offline,
}

impl StatusView {
    pub fn message(&self) -> &'static str {
        match self {
            StatusView::Connecting => "Connecting to the collaboration server...",
            StatusView::SlowSync => "Syncing is taking longer than expected.",
            StatusView::Ready { online: true } => "All changes synced.",
            StatusView::Ready { online: false } => "Offline. Changes will sync when the connection returns.",
            StatusView::AuthFailed => "Your session has expired. Please sign in again.",
            StatusView::Crashed => "The editor stopped working.",
            StatusView::Offline => "Could not reach the collaboration server.",
        }
    }

    /// Whether a retry button belongs next to this status.
    pub fn offers_retry(&self) -> bool {
        matches!(
            self,
            StatusView::SlowSync | StatusView::Crashed | StatusView::Offline
        )
    }

    pub fn requires_login(&self) -> bool {
        matches!(self, StatusView::AuthFailed)
    }
}

/// Owner side of the status signal.
#[derive(Debug)]
pub struct StatusTracker {
    tx: watch::Sender<ConnectionState>,
}

impl StatusTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    /// Move to `next` if the transition is legal. Returns whether it happened.
    pub fn transition(&self, next: ConnectionStatus) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|state| {
            if state.status == next || !state.status.can_transition_to(next) {
                debug!(from = ?state.status, to = ?next, "ignoring status transition");
                return false;
            }
            state.status = next;
            match next {
                ConnectionStatus::Connected => state.connected_since = Some(Instant::now()),
                ConnectionStatus::Synced => {
                    state.synced = true;
                    state.retry_count = 0;
                }
                ConnectionStatus::Disconnected => state.connected_since = None,
                ConnectionStatus::AuthenticationFailed => {
                    state.auth_failed = true;
                    state.connected_since = None;
                }
                ConnectionStatus::Initial | ConnectionStatus::Connecting => {}
            }
            applied = true;
            true
        });
        applied
    }

    pub fn set_retry_count(&self, count: u32) {
        self.tx.send_if_modified(|state| {
            let changed = state.retry_count != count;
            state.retry_count = count;
            changed
        });
    }

    pub fn give_up(&self) {
        self.tx.send_modify(|state| state.gave_up = true);
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    #[test]
    fn test_happy_path() {
        let tracker = StatusTracker::new();
        assert!(tracker.transition(Connecting));
        assert!(tracker.transition(Connected));
        assert!(!tracker.current().synced);
        assert!(tracker.transition(Synced));
        assert!(tracker.current().synced);
    }

    #[test]
    fn test_synced_requires_connected() {
        let tracker = StatusTracker::new();
        tracker.transition(Connecting);
        assert!(!tracker.transition(Synced));
        assert!(!tracker.current().synced);
    }

    #[test]
    fn test_synced_is_sticky() {
        let tracker = StatusTracker::new();
        for status in [Connecting, Connected, Synced, Disconnected, Connecting] {
            tracker.transition(status);
        }
        let state = tracker.current();
        assert_eq!(state.status, Connecting);
        assert!(state.synced);
        assert_eq!(
            state.view(Instant::now(), DEFAULT_SYNC_TIMEOUT, false),
            StatusView::Ready { online: false }
        );
    }

    #[test]
    fn test_auth_failure_is_terminal() {
        let tracker = StatusTracker::new();
        tracker.transition(Connecting);
        tracker.transition(Connected);
        assert!(tracker.transition(AuthenticationFailed));

        assert!(!tracker.transition(Disconnected));
        assert!(!tracker.transition(Connecting));
        assert_eq!(tracker.current().status, AuthenticationFailed);
        assert!(tracker.current().auth_failed);
    }

    #[test]
    fn test_slow_sync_is_derived_from_elapsed_time() {
        let tracker = StatusTracker::new();
        tracker.transition(Connecting);
        tracker.transition(Connected);
        let state = tracker.current();
        let since = state.connected_since.unwrap();

        let window = Duration::from_secs(15);
        assert!(!state.is_taking_too_long(since + Duration::from_secs(14), window));
        assert!(state.is_taking_too_long(since + Duration::from_secs(15), window));
        assert_eq!(
            state.view(since + Duration::from_secs(20), window, false),
            StatusView::SlowSync
        );
        assert_eq!(state.view(since, window, false), StatusView::Connecting);
    }

    #[test]
    fn test_views_are_distinct() {
        let now = Instant::now();
        let window = DEFAULT_SYNC_TIMEOUT;

        let auth = ConnectionState {
            auth_failed: true,
            status: AuthenticationFailed,
            ..Default::default()
        };
        assert_eq!(auth.view(now, window, true), StatusView::AuthFailed);
        assert!(auth.view(now, window, false).requires_login());

        let fresh = ConnectionState::default();
        assert_eq!(fresh.view(now, window, true), StatusView::Crashed);
        assert!(!fresh.view(now, window, false).offers_retry());

        let offline = ConnectionState {
            gave_up: true,
            status: Disconnected,
            ..Default::default()
        };
        assert_eq!(offline.view(now, window, false), StatusView::Offline);
        assert!(StatusView::Offline.offers_retry());
    }

    #[tokio::test]
    async fn test_watchers_see_transitions() {
        let tracker = StatusTracker::new();
        let mut rx = tracker.subscribe();
        tracker.transition(Connecting);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().status, Connecting);
    }
}
