//! Presence renderer - the "who else is here" list.
//!
//! Derives a deduplicated, ordered list of remote collaborators from the
//! awareness map and republishes it whenever a remote change arrives.

use crate::awareness::{Awareness, ChangeOrigin, Collaborator};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Live list of remote collaborators for one session.
pub struct PresenceRenderer {
    list: watch::Receiver<Vec<Collaborator>>,
    task: Option<JoinHandle<()>>,
}

impl PresenceRenderer {
    /// Start following `awareness`. Must be called inside a tokio runtime.
    pub fn subscribe(awareness: &Arc<Awareness>) -> Self {
        let mut events = awareness.subscribe();
        let (tx, list) = watch::channel(derive(awareness));
        let awareness = Arc::downgrade(awareness);

        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.origin == ChangeOrigin::Local => continue,
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        let Some(awareness) = awareness.upgrade() else {
                            break;
                        };
                        let next = derive(&awareness);
                        drop(awareness);
                        tx.send_if_modified(|current| {
                            if *current == next {
                                return false;
                            }
                            *current = next;
                            true
                        });
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("presence renderer stopped");
            tx.send_if_modified(|current| {
                let changed = !current.is_empty();
                current.clear();
                changed
            });
        });

        Self {
            list,
            task: Some(task),
        }
    }

    /// Current collaborators, ordered by client id.
    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.list.borrow().clone()
    }

    /// Watch signal of the list.
    pub fn changes(&self) -> watch::Receiver<Vec<Collaborator>> {
        self.list.clone()
    }

    /// Wait until the list satisfies `predicate`. Returns the list that did,
    /// or the last one if the renderer stopped first.
    pub async fn wait_for(&self, predicate: impl Fn(&[Collaborator]) -> bool) -> Vec<Collaborator> {
        let mut rx = self.list.clone();
        loop {
            {
                let list = rx.borrow_and_update();
                if predicate(&list) {
                    return list.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Stop following awareness changes. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PresenceRenderer {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn derive(awareness: &Awareness) -> Vec<Collaborator> {
    let local = awareness.local_client();
    let mut list = awareness.collaborators();
    list.retain(|c| c.client != local);
    list.sort_by_key(|c| c.client);
    list.dedup_by_key(|c| c.client);
    list
}
