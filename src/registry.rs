//! Client-request registry: the cancellation graph.
//!
//! Every dispatched request registers its client request id (and owning tab,
//! when there is one) and gets back a guard holding a cancellation token.
//! Cancelling the id fires the token into every in-flight provider call and
//! stream; closing a tab fans out to every id registered under it. The
//! guard deregisters on drop, so completed requests always leave the
//! registry and late cancellations become no-ops.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::types::{ClientRequestId, TabId};

struct Registration {
    tab_id: Option<TabId>,
    token: CancellationToken,
    /// Concurrent registrations under the same id (e.g. a batch and its
    /// members) share one token; the entry lives until the last guard drops.
    holders: usize,
}

#[derive(Default)]
struct RegistryState {
    requests: HashMap<ClientRequestId, Registration>,
    by_tab: HashMap<TabId, HashSet<ClientRequestId>>,
}

/// Registry of live client requests, indexed by tab.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    state: Arc<Mutex<RegistryState>>,
}

/// Keeps a registration alive; dropping it releases the id.
pub struct RequestGuard {
    registry: ClientRegistry,
    id: ClientRequestId,
    token: CancellationToken,
}

impl RequestGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request; re-registering a live id joins its token.
    pub fn register(&self, id: ClientRequestId, tab_id: Option<TabId>) -> RequestGuard {
        let token = {
            let mut state = self.state.lock();
            if let Some(tab) = tab_id {
                state.by_tab.entry(tab).or_default().insert(id);
            }
            let registration = state.requests.entry(id).or_insert_with(|| Registration {
                tab_id,
                token: CancellationToken::new(),
                holders: 0,
            });
            registration.holders += 1;
            registration.token.clone()
        };

        RequestGuard {
            registry: self.clone(),
            id,
            token,
        }
    }

    /// Token for a live id, if any.
    pub fn token(&self, id: ClientRequestId) -> Option<CancellationToken> {
        self.state.lock().requests.get(&id).map(|r| r.token.clone())
    }

    /// Cancel one client request. Returns false when the id is unknown
    /// (already completed or cancelled), making repeat cancels no-ops.
    pub fn cancel(&self, id: ClientRequestId) -> bool {
        let token = {
            let mut state = self.state.lock();
            let Some(registration) = state.requests.remove(&id) else {
                return false;
            };
            if let Some(tab) = registration.tab_id {
                if let Some(ids) = state.by_tab.get_mut(&tab) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        state.by_tab.remove(&tab);
                    }
                }
            }
            registration.token
        };

        tracing::debug!(client_request_id = %id, "Cancelling client request");
        token.cancel();
        true
    }

    /// Cancel every request registered under a tab; returns the ids.
    pub fn close_tab(&self, tab_id: TabId) -> Vec<ClientRequestId> {
        let ids: Vec<ClientRequestId> = {
            let state = self.state.lock();
            state
                .by_tab
                .get(&tab_id)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default()
        };

        if !ids.is_empty() {
            tracing::info!(tab = %tab_id, count = ids.len(), "Cancelling requests for closed tab");
        }
        for id in &ids {
            self.cancel(*id);
        }
        ids
    }

    /// Number of live registrations (for assertions and backlog probes).
    pub fn len(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, id: ClientRequestId) {
        let mut state = self.state.lock();
        let Some(registration) = state.requests.get_mut(&id) else {
            return;
        };
        registration.holders -= 1;
        if registration.holders > 0 {
            return;
        }
        let tab_id = registration.tab_id;
        state.requests.remove(&id);
        if let Some(tab) = tab_id {
            if let Some(ids) = state.by_tab.get_mut(&tab) {
                ids.remove(&id);
                if ids.is_empty() {
                    state.by_tab.remove(&tab);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_fires_the_token_once() {
        let registry = ClientRegistry::new();
        let id = ClientRequestId::new();

        let guard = registry.register(id, None);
        let token = guard.token();
        assert!(!token.is_cancelled());

        assert!(registry.cancel(id));
        assert!(token.is_cancelled());

        // Second cancel of the same id is a no-op.
        assert!(!registry.cancel(id));
    }

    #[test]
    fn guard_drop_releases_without_cancelling() {
        let registry = ClientRegistry::new();
        let id = ClientRequestId::new();

        let guard = registry.register(id, Some(TabId(7)));
        let token = guard.token();
        drop(guard);

        assert!(registry.is_empty());
        assert!(!token.is_cancelled());
        // Cancelling after completion is a no-op.
        assert!(!registry.cancel(id));
        assert!(registry.close_tab(TabId(7)).is_empty());
    }

    #[test]
    fn tab_close_fans_out_to_all_its_requests() {
        let registry = ClientRegistry::new();
        let in_tab: Vec<ClientRequestId> = (0..3).map(|_| ClientRequestId::new()).collect();
        let other = ClientRequestId::new();

        let guards: Vec<_> = in_tab
            .iter()
            .map(|id| registry.register(*id, Some(TabId(7))))
            .collect();
        let other_guard = registry.register(other, Some(TabId(8)));

        let cancelled = registry.close_tab(TabId(7));
        assert_eq!(cancelled.len(), 3);
        for guard in &guards {
            assert!(guard.token().is_cancelled());
        }
        assert!(!other_guard.token().is_cancelled());
    }

    #[test]
    fn shared_id_keeps_one_token_until_last_holder_drops() {
        let registry = ClientRegistry::new();
        let id = ClientRequestId::new();

        let first = registry.register(id, None);
        let second = registry.register(id, None);
        assert_eq!(registry.len(), 1);

        drop(first);
        // Still registered through the second holder.
        assert!(registry.token(id).is_some());

        registry.cancel(id);
        assert!(second.token().is_cancelled());
    }
}
