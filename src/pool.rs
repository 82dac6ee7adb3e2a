//! Chat pool: capacity-bounded, per-key reuse of server-side conversations.
//!
//! Each pool key `(provider, purpose, base URL)` owns up to `max_slots`
//! conversation slots. A slot is held exclusively through a [`ChatLease`];
//! releases hand the slot straight to the oldest waiter, and invalidations
//! hand the freed capacity over as a provision grant so waiters never wedge
//! behind a poisoned chat. Slot state (minus the in-memory `busy` flag) is
//! persisted through a single-writer queue: writes are ordered, coalesced,
//! and always reflect the latest mutation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::store::KeyValueStore;

/// Store key under which the whole pool serializes.
pub const POOL_STORE_KEY: &str = "genai_chat_pool";

/// What a pooled conversation is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Translate,
    Read,
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Purpose::Translate => write!(f, "translate"),
            Purpose::Read => write!(f, "read"),
        }
    }
}

impl FromStr for Purpose {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "translate" => Ok(Purpose::Translate),
            "read" => Ok(Purpose::Read),
            _ => Err(()),
        }
    }
}

/// Pool key: one conversation family per provider, purpose, and endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub provider_id: String,
    pub purpose: Purpose,
    pub base_url: String,
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.provider_id, self.purpose, self.base_url)
    }
}

impl PoolKey {
    /// Parse the serialized form. The base URL is the final segment and may
    /// itself contain colons.
    fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, ':');
        let provider_id = parts.next()?.to_string();
        let purpose = Purpose::from_str(parts.next()?).ok()?;
        let base_url = parts.next()?.to_string();
        Some(Self {
            provider_id,
            purpose,
            base_url,
        })
    }
}

/// Factory for a fresh server-side chat; returns the remote chat id.
pub type CreateChatFn = Arc<dyn Fn() -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Wrap an async closure as a [`CreateChatFn`].
pub fn create_chat_fn<F, Fut>(f: F) -> CreateChatFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[derive(Debug, Clone)]
struct ChatSlot {
    slot_id: Uuid,
    chat_id: String,
    last_used: DateTime<Utc>,
    /// Id of the most recent assistant reply; parent of the next user turn.
    parent_message_id: Option<String>,
    /// Id of an in-flight user turn whose completion is unknown. A slot
    /// hydrated with this set is suspect and must be reconciled before use.
    pending_message_id: Option<String>,
    pending_since: Option<DateTime<Utc>>,
    busy: bool,
}

/// Persisted form of a slot. `busy` is in-memory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedSlot {
    chat_id: String,
    last_used: DateTime<Utc>,
    parent_message_id: Option<String>,
    pending_message_id: Option<String>,
    pending_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct PersistedPoolEntry {
    slots: Vec<PersistedSlot>,
}

/// Snapshot of a slot handed to a lease.
#[derive(Debug, Clone)]
struct LeaseSeed {
    slot_id: Uuid,
    chat_id: String,
    parent_message_id: Option<String>,
    pending_message_id: Option<String>,
}

enum HandOff {
    /// A released slot, already marked busy for the receiver.
    Slot(LeaseSeed),
    /// Freed capacity; the receiver provisions its own slot.
    Provision,
}

#[derive(Default)]
struct KeyState {
    slots: Vec<ChatSlot>,
    waiters: VecDeque<oneshot::Sender<HandOff>>,
    pending_provisions: usize,
}

struct PoolInner {
    max_slots: usize,
    idle_ttl: ChronoDuration,
    // Outer map lock is held only for lookup/insert; per-key state has its
    // own mutex.
    keys: Mutex<HashMap<PoolKey, Arc<Mutex<KeyState>>>>,
    store: Arc<dyn KeyValueStore>,
    persist_tx: mpsc::UnboundedSender<()>,
}

/// Bounded pool of live conversations, persisted across restarts.
#[derive(Clone)]
pub struct ChatPool {
    inner: Arc<PoolInner>,
}

impl ChatPool {
    /// Hydrate the pool from the store, dropping slots that exceeded the
    /// idle TTL or lack a chat id. Suspect pending-message ids survive so
    /// the driver can reconcile them.
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        max_slots: usize,
        idle_ttl: Duration,
    ) -> Result<Self> {
        let idle_ttl = ChronoDuration::from_std(idle_ttl)
            .map_err(|_| DispatchError::Internal("idle TTL out of range".into()))?;

        let mut keys = HashMap::new();
        if let Some(raw) = store.get(POOL_STORE_KEY).await? {
            match serde_json::from_str::<HashMap<String, PersistedPoolEntry>>(&raw) {
                Ok(persisted) => {
                    let cutoff = Utc::now() - idle_ttl;
                    for (raw_key, entry) in persisted {
                        let Some(key) = PoolKey::parse(&raw_key) else {
                            tracing::warn!(key = %raw_key, "Dropping unparseable pool key");
                            continue;
                        };
                        let slots: Vec<ChatSlot> = entry
                            .slots
                            .into_iter()
                            .filter(|s| !s.chat_id.is_empty() && s.last_used >= cutoff)
                            .map(|s| ChatSlot {
                                slot_id: Uuid::new_v4(),
                                chat_id: s.chat_id,
                                last_used: s.last_used,
                                parent_message_id: s.parent_message_id,
                                pending_message_id: s.pending_message_id,
                                pending_since: s.pending_since,
                                busy: false,
                            })
                            .collect();
                        if !slots.is_empty() {
                            tracing::debug!(key = %key, count = slots.len(), "Hydrated chat slots");
                            keys.insert(
                                key,
                                Arc::new(Mutex::new(KeyState {
                                    slots,
                                    ..KeyState::default()
                                })),
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding corrupt chat pool state");
                }
            }
        }

        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            max_slots: max_slots.max(1),
            idle_ttl,
            keys: Mutex::new(keys),
            store,
            persist_tx,
        });
        tokio::spawn(persist_worker(inner.clone(), persist_rx));

        Ok(Self { inner })
    }

    async fn key_state(&self, key: &PoolKey) -> Arc<Mutex<KeyState>> {
        let mut keys = self.inner.keys.lock().await;
        keys.entry(key.clone()).or_default().clone()
    }

    fn schedule_persist(&self) {
        let _ = self.inner.persist_tx.send(());
    }

    /// Acquire an exclusive lease on a conversation slot, provisioning a
    /// fresh chat through `create` when capacity allows, or waiting FIFO
    /// otherwise.
    pub async fn acquire(&self, key: PoolKey, create: CreateChatFn) -> Result<ChatLease> {
        enum Action {
            Lease(LeaseSeed),
            Provision,
            Wait(oneshot::Receiver<HandOff>),
        }

        let key_state = self.key_state(&key).await;
        let action = {
            let mut state = key_state.lock().await;
            let now = Utc::now();

            let before = state.slots.len();
            let idle_ttl = self.inner.idle_ttl;
            state
                .slots
                .retain(|s| s.busy || now - s.last_used < idle_ttl);
            if state.slots.len() < before {
                tracing::debug!(
                    key = %key,
                    evicted = before - state.slots.len(),
                    "Evicted idle chat slots"
                );
            }

            if let Some(idx) = state.slots.iter().position(|s| !s.busy) {
                let slot = &mut state.slots[idx];
                slot.busy = true;
                slot.last_used = now;
                Action::Lease(LeaseSeed {
                    slot_id: slot.slot_id,
                    chat_id: slot.chat_id.clone(),
                    parent_message_id: slot.parent_message_id.clone(),
                    pending_message_id: slot.pending_message_id.clone(),
                })
            } else if state.slots.len() + state.pending_provisions < self.inner.max_slots {
                state.pending_provisions += 1;
                Action::Provision
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Action::Wait(rx)
            }
        };
        self.schedule_persist();

        match action {
            Action::Lease(seed) => Ok(self.lease(key, seed)),
            Action::Provision => self.provision(key, key_state, create).await,
            Action::Wait(rx) => {
                tracing::debug!(key = %key, "Waiting for a chat slot");
                match rx.await {
                    Ok(HandOff::Slot(seed)) => Ok(self.lease(key, seed)),
                    Ok(HandOff::Provision) => self.provision(key, key_state, create).await,
                    Err(_) => Err(DispatchError::Internal("chat pool shut down".into())),
                }
            }
        }
    }

    /// Run `create` outside any lock, insert the slot on success, and on
    /// failure pass the freed capacity to the oldest waiter.
    async fn provision(
        &self,
        key: PoolKey,
        key_state: Arc<Mutex<KeyState>>,
        create: CreateChatFn,
    ) -> Result<ChatLease> {
        match create().await {
            Ok(chat_id) => {
                let slot = ChatSlot {
                    slot_id: Uuid::new_v4(),
                    chat_id: chat_id.clone(),
                    last_used: Utc::now(),
                    parent_message_id: None,
                    pending_message_id: None,
                    pending_since: None,
                    busy: true,
                };
                let seed = LeaseSeed {
                    slot_id: slot.slot_id,
                    chat_id,
                    parent_message_id: None,
                    pending_message_id: None,
                };
                {
                    let mut state = key_state.lock().await;
                    state.pending_provisions = state.pending_provisions.saturating_sub(1);
                    state.slots.push(slot);
                }
                self.schedule_persist();
                tracing::info!(key = %key, "Provisioned chat slot");
                Ok(self.lease(key, seed))
            }
            Err(error) => {
                {
                    let mut state = key_state.lock().await;
                    state.pending_provisions = state.pending_provisions.saturating_sub(1);
                    grant_provision(&mut state);
                }
                tracing::warn!(key = %key, error = %error, "Chat provisioning failed");
                Err(error)
            }
        }
    }

    /// Warm the pool toward `desired` slots (bounded by capacity);
    /// provisioning failures are logged and stop the warm-up.
    pub async fn scale(&self, key: PoolKey, desired: usize, create: CreateChatFn) {
        let key_state = self.key_state(&key).await;
        loop {
            let should_provision = {
                let mut state = key_state.lock().await;
                let target = desired.min(self.inner.max_slots);
                if state.slots.len() + state.pending_provisions < target {
                    state.pending_provisions += 1;
                    true
                } else {
                    false
                }
            };
            if !should_provision {
                break;
            }

            match create().await {
                Ok(chat_id) => {
                    let mut state = key_state.lock().await;
                    state.pending_provisions = state.pending_provisions.saturating_sub(1);
                    let mut slot = ChatSlot {
                        slot_id: Uuid::new_v4(),
                        chat_id,
                        last_used: Utc::now(),
                        parent_message_id: None,
                        pending_message_id: None,
                        pending_since: None,
                        busy: false,
                    };
                    // A parked waiter takes the warm slot immediately.
                    let seed = LeaseSeed {
                        slot_id: slot.slot_id,
                        chat_id: slot.chat_id.clone(),
                        parent_message_id: None,
                        pending_message_id: None,
                    };
                    let mut handed_off = false;
                    while let Some(waiter) = state.waiters.pop_front() {
                        if waiter.send(HandOff::Slot(seed.clone())).is_ok() {
                            slot.busy = true;
                            handed_off = true;
                            break;
                        }
                    }
                    state.slots.push(slot);
                    drop(state);
                    self.schedule_persist();
                    tracing::debug!(key = %key, handed_off, "Warmed chat slot");
                }
                Err(error) => {
                    let mut state = key_state.lock().await;
                    state.pending_provisions = state.pending_provisions.saturating_sub(1);
                    drop(state);
                    tracing::warn!(key = %key, error = %error, "Chat warm-up failed");
                    break;
                }
            }
        }
    }

    /// Counts of (total, idle) slots for a key.
    pub async fn slot_counts(&self, key: &PoolKey) -> (usize, usize) {
        let key_state = self.key_state(key).await;
        let state = key_state.lock().await;
        let idle = state.slots.iter().filter(|s| !s.busy).count();
        (state.slots.len(), idle)
    }

    fn lease(&self, key: PoolKey, seed: LeaseSeed) -> ChatLease {
        ChatLease {
            pool: self.clone(),
            key,
            slot_id: seed.slot_id,
            chat_id: seed.chat_id,
            parent_message_id: seed.parent_message_id,
            pending_message_id: seed.pending_message_id,
            settled: false,
        }
    }

    async fn release_slot(&self, key: &PoolKey, slot_id: Uuid) {
        let key_state = self.key_state(key).await;
        {
            let mut state = key_state.lock().await;
            let state = &mut *state;
            let now = Utc::now();
            if let Some(slot) = state.slots.iter_mut().find(|s| s.slot_id == slot_id) {
                slot.last_used = now;
                let seed = LeaseSeed {
                    slot_id: slot.slot_id,
                    chat_id: slot.chat_id.clone(),
                    parent_message_id: slot.parent_message_id.clone(),
                    pending_message_id: slot.pending_message_id.clone(),
                };
                let mut handed_off = false;
                while let Some(waiter) = state.waiters.pop_front() {
                    // The slot stays busy across a direct hand-off.
                    if waiter.send(HandOff::Slot(seed.clone())).is_ok() {
                        handed_off = true;
                        break;
                    }
                }
                if !handed_off {
                    slot.busy = false;
                }
            }
        }
        self.schedule_persist();
    }

    async fn invalidate_slot(&self, key: &PoolKey, slot_id: Uuid) {
        let key_state = self.key_state(key).await;
        {
            let mut state = key_state.lock().await;
            state.slots.retain(|s| s.slot_id != slot_id);
            grant_provision(&mut state);
        }
        self.schedule_persist();
        tracing::info!(key = %key, "Invalidated chat slot");
    }

    async fn update_slot<F>(&self, key: &PoolKey, slot_id: Uuid, update: F)
    where
        F: FnOnce(&mut ChatSlot),
    {
        let key_state = self.key_state(key).await;
        {
            let mut state = key_state.lock().await;
            if let Some(slot) = state.slots.iter_mut().find(|s| s.slot_id == slot_id) {
                update(slot);
            }
        }
        self.schedule_persist();
    }

    async fn snapshot(&self) -> HashMap<String, PersistedPoolEntry> {
        let states: Vec<(PoolKey, Arc<Mutex<KeyState>>)> = {
            let keys = self.inner.keys.lock().await;
            keys.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut snapshot = HashMap::new();
        for (key, state) in states {
            let state = state.lock().await;
            let slots: Vec<PersistedSlot> = state
                .slots
                .iter()
                .map(|s| PersistedSlot {
                    chat_id: s.chat_id.clone(),
                    last_used: s.last_used,
                    parent_message_id: s.parent_message_id.clone(),
                    pending_message_id: s.pending_message_id.clone(),
                    pending_since: s.pending_since,
                })
                .collect();
            if !slots.is_empty() {
                snapshot.insert(key.to_string(), PersistedPoolEntry { slots });
            }
        }
        snapshot
    }
}

/// Pass freed capacity to the oldest live waiter as a provision grant.
fn grant_provision(state: &mut KeyState) {
    while let Some(waiter) = state.waiters.pop_front() {
        if waiter.send(HandOff::Provision).is_ok() {
            state.pending_provisions += 1;
            break;
        }
    }
}

async fn persist_worker(inner: Arc<PoolInner>, mut rx: mpsc::UnboundedReceiver<()>) {
    let pool = ChatPool { inner };
    while rx.recv().await.is_some() {
        // Coalesce bursts of dirty signals into one write of the latest
        // state.
        while rx.try_recv().is_ok() {}

        let snapshot = pool.snapshot().await;
        let raw = match serde_json::to_string(&snapshot) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize chat pool state");
                continue;
            }
        };
        if let Err(e) = pool.inner.store.set(POOL_STORE_KEY, raw).await {
            tracing::warn!(error = %e, "Failed to persist chat pool state");
        }
    }
}

/// Exclusive hold on one conversation slot.
///
/// A lease must end in [`ChatLease::release`] or [`ChatLease::invalidate`];
/// a lease dropped without either releases its slot in the background so
/// the pool cannot leak busy slots.
pub struct ChatLease {
    pool: ChatPool,
    key: PoolKey,
    slot_id: Uuid,
    chat_id: String,
    parent_message_id: Option<String>,
    pending_message_id: Option<String>,
    settled: bool,
}

impl ChatLease {
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn parent_message_id(&self) -> Option<&str> {
        self.parent_message_id.as_deref()
    }

    pub fn pending_message_id(&self) -> Option<&str> {
        self.pending_message_id.as_deref()
    }

    /// Record the latest assistant reply id; persisted.
    pub async fn set_parent_message_id(&mut self, id: Option<String>) {
        self.parent_message_id = id.clone();
        self.pool
            .update_slot(&self.key, self.slot_id, move |slot| {
                slot.parent_message_id = id;
            })
            .await;
    }

    /// Record (or clear) the in-flight user turn id; persisted.
    pub async fn set_pending_message_id(&mut self, id: Option<String>) {
        self.pending_message_id = id.clone();
        let pending_since = id.as_ref().map(|_| Utc::now());
        self.pool
            .update_slot(&self.key, self.slot_id, move |slot| {
                slot.pending_message_id = id;
                slot.pending_since = pending_since;
            })
            .await;
    }

    /// Return the slot to the pool for reuse.
    pub async fn release(mut self) {
        self.settled = true;
        self.pool.release_slot(&self.key, self.slot_id).await;
    }

    /// Remove the slot entirely; the conversation is poisoned.
    pub async fn invalidate(mut self) {
        self.settled = true;
        self.pool.invalidate_slot(&self.key, self.slot_id).await;
    }
}

impl Drop for ChatLease {
    fn drop(&mut self) {
        if !self.settled {
            let pool = self.pool.clone();
            let key = self.key.clone();
            let slot_id = self.slot_id;
            tokio::spawn(async move {
                pool.release_slot(&key, slot_id).await;
            });
        }
    }
}
