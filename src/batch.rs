//! Batch queue: coalesces translation tasks that share a batch key into
//! combined provider calls under character/item budgets.
//!
//! Tasks joining an open batch wait behind a short delay timer; the batch
//! flushes early when the incoming task would cross the character budget or
//! fills the item budget. A flushed batch travels through the request queue
//! as a single thunk keyed by a compound hash, so identical concurrent
//! batches dedupe. When a batch fails terminally and fallback is enabled,
//! each member retries as an independent request through the request queue —
//! never back through the batch queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::{BatchConfig, BatchConfigPatch};
use crate::error::{DispatchError, Result};
use crate::queue::RequestQueue;
use crate::scheduler::task_fn;
use crate::types::{join_batch_texts, split_batch_response, BatchKey, ClientRequestId, ContentHash};

/// Executes a (possibly combined) payload against the provider for one
/// batch key. The payload for a combined call is the separator-joined text
/// of every member; the response must echo the separators so the fragments
/// split back positionally.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute(&self, key: &BatchKey, payload: &str) -> Result<String>;
}

/// One task submitted to the batch queue.
#[derive(Debug, Clone)]
pub struct BatchTask {
    pub id: Uuid,
    pub text: String,
    pub hash: Option<ContentHash>,
    /// Per-task character budget; the batch budget is the max of these and
    /// the global limit.
    pub char_budget: Option<usize>,
    pub client_request_id: ClientRequestId,
    pub schedule_at: DateTime<Utc>,
}

impl BatchTask {
    pub fn new(
        text: impl Into<String>,
        client_request_id: ClientRequestId,
        schedule_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            hash: None,
            char_budget: None,
            client_request_id,
            schedule_at,
        }
    }

    pub fn with_hash(mut self, hash: ContentHash) -> Self {
        self.hash = Some(hash);
        self
    }

    fn chars(&self) -> usize {
        self.text.chars().count()
    }
}

struct QueuedTask {
    task: BatchTask,
    reply: oneshot::Sender<Result<String>>,
}

struct PendingBatch {
    id: Uuid,
    tasks: Vec<QueuedTask>,
    total_chars: usize,
    budget: usize,
    earliest_start: DateTime<Utc>,
    created_at: DateTime<Utc>,
    timer_generation: u64,
}

struct InflightTask {
    task: BatchTask,
    /// Taken either by result distribution or by cancellation, whichever
    /// comes first.
    reply: Option<oneshot::Sender<Result<String>>>,
    cancelled: bool,
}

#[derive(Default)]
struct State {
    open: HashMap<BatchKey, PendingBatch>,
    inflight: HashMap<Uuid, InflightTask>,
    generation: u64,
}

struct Inner {
    queue: RequestQueue,
    executor: Arc<dyn BatchExecutor>,
    config: Mutex<BatchConfig>,
    state: Mutex<State>,
}

/// Coalescing batch queue in front of the request queue.
#[derive(Clone)]
pub struct BatchQueue {
    inner: Arc<Inner>,
}

impl BatchQueue {
    pub fn new(queue: RequestQueue, executor: Arc<dyn BatchExecutor>, config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                executor,
                config: Mutex::new(config),
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn config(&self) -> BatchConfig {
        self.inner.config.lock().clone()
    }

    pub fn set_config(&self, patch: &BatchConfigPatch) {
        let mut config = self.inner.config.lock();
        config.apply(patch);
        tracing::info!(
            max_characters = config.max_characters_per_batch,
            max_items = config.max_items_per_batch,
            "Batch queue reconfigured"
        );
    }

    /// Enqueue a task under its batch key; resolves with the task's own
    /// translation fragment.
    pub async fn enqueue(&self, key: BatchKey, task: BatchTask) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let config = self.config();

        let mut to_flush: Vec<(BatchKey, Vec<QueuedTask>, DateTime<Utc>)> = Vec::new();
        let mut timer: Option<(BatchKey, u64)> = None;

        {
            let mut state = self.inner.state.lock();
            let incoming_chars = task.chars();
            let task_budget = task.char_budget.unwrap_or(0);

            let overflows = state.open.get(&key).is_some_and(|batch| {
                let budget = batch
                    .budget
                    .max(task_budget)
                    .max(config.max_characters_per_batch);
                batch.total_chars + incoming_chars > budget
            });
            if overflows {
                // Incoming task crosses the character budget: ship the
                // open batch and start a fresh one with this task.
                let batch = state.open.remove(&key).unwrap();
                tracing::debug!(
                    key = %key,
                    batch_id = %batch.id,
                    tasks = batch.tasks.len(),
                    "Flushing batch on incoming char overflow"
                );
                to_flush.push((key.clone(), batch.tasks, batch.earliest_start));
            }

            let generation = {
                state.generation += 1;
                state.generation
            };

            let batch = state.open.entry(key.clone()).or_insert_with(|| PendingBatch {
                id: Uuid::new_v4(),
                tasks: Vec::new(),
                total_chars: 0,
                budget: config.max_characters_per_batch,
                earliest_start: task.schedule_at,
                created_at: Utc::now(),
                timer_generation: generation,
            });

            batch.budget = batch
                .budget
                .max(task_budget)
                .max(config.max_characters_per_batch);
            batch.total_chars += incoming_chars;
            batch.earliest_start = batch.earliest_start.min(task.schedule_at);
            batch.tasks.push(QueuedTask {
                task,
                reply: reply_tx,
            });

            if batch.tasks.len() >= config.max_items_per_batch
                || batch.total_chars >= batch.budget
            {
                let batch = state.open.remove(&key).unwrap();
                tracing::debug!(
                    key = %key,
                    batch_id = %batch.id,
                    tasks = batch.tasks.len(),
                    chars = batch.total_chars,
                    "Flushing full batch"
                );
                to_flush.push((key.clone(), batch.tasks, batch.earliest_start));
            } else {
                batch.timer_generation = generation;
                timer = Some((key.clone(), generation));
            }
        }

        for (key, tasks, earliest) in to_flush {
            self.dispatch_detached(key, tasks, earliest);
        }

        if let Some((key, generation)) = timer {
            let inner = self.inner.clone();
            let queue = self.clone();
            let delay = Duration::from_millis(config.batch_delay_ms);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let detached = {
                    let mut state = inner.state.lock();
                    match state.open.get(&key) {
                        Some(batch) if batch.timer_generation == generation => {
                            let batch = state.open.remove(&key).unwrap();
                            Some((batch.tasks, batch.earliest_start))
                        }
                        _ => None,
                    }
                };
                if let Some((tasks, earliest)) = detached {
                    tracing::debug!(key = %key, tasks = tasks.len(), "Flushing batch on delay timer");
                    queue.dispatch_detached(key, tasks, earliest);
                }
            });
        }

        reply_rx
            .await
            .map_err(|_| DispatchError::Internal("batch queue dropped task".into()))?
    }

    /// Remove every task whose client request id matches the predicate:
    /// pending tasks leave their batches, in-flight tasks reject now and
    /// their eventual batch results are discarded. Returns how many tasks
    /// were cancelled.
    pub fn cancel_tasks<F>(&self, predicate: F, reason: &str) -> usize
    where
        F: Fn(&ClientRequestId) -> bool,
    {
        let mut rejected = Vec::new();
        {
            let mut state = self.inner.state.lock();

            let mut emptied = Vec::new();
            for (key, batch) in state.open.iter_mut() {
                let mut kept = Vec::with_capacity(batch.tasks.len());
                for queued in batch.tasks.drain(..) {
                    if predicate(&queued.task.client_request_id) {
                        batch.total_chars =
                            batch.total_chars.saturating_sub(queued.task.chars());
                        rejected.push(queued.reply);
                    } else {
                        kept.push(queued);
                    }
                }
                batch.tasks = kept;
                if batch.tasks.is_empty() {
                    emptied.push(key.clone());
                }
            }
            for key in emptied {
                state.open.remove(&key);
            }

            for entry in state.inflight.values_mut() {
                if !entry.cancelled && predicate(&entry.task.client_request_id) {
                    entry.cancelled = true;
                    if let Some(reply) = entry.reply.take() {
                        rejected.push(reply);
                    }
                }
            }
        }

        let count = rejected.len();
        for reply in rejected {
            let _ = reply.send(Err(DispatchError::Cancelled(reason.to_string())));
        }
        if count > 0 {
            tracing::info!(count, reason, "Cancelled batch queue tasks");
        }
        count
    }

    fn dispatch_detached(
        &self,
        key: BatchKey,
        tasks: Vec<QueuedTask>,
        earliest_start: DateTime<Utc>,
    ) {
        let mut ids = Vec::with_capacity(tasks.len());
        {
            let mut state = self.inner.state.lock();
            for queued in tasks {
                ids.push(queued.task.id);
                state.inflight.insert(
                    queued.task.id,
                    InflightTask {
                        task: queued.task,
                        reply: Some(queued.reply),
                        cancelled: false,
                    },
                );
            }
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            dispatch_batch(inner, key, ids, earliest_start).await;
        });
    }
}

async fn dispatch_batch(
    inner: Arc<Inner>,
    key: BatchKey,
    task_ids: Vec<Uuid>,
    earliest_start: DateTime<Utc>,
) {
    let (texts, hashes): (Vec<String>, Vec<Option<ContentHash>>) = {
        let state = inner.state.lock();
        task_ids
            .iter()
            .filter_map(|id| state.inflight.get(id))
            .map(|e| (e.task.text.clone(), e.task.hash.clone()))
            .unzip()
    };

    let payload = join_batch_texts(&texts);
    let compound = compound_hash(&key, &texts, &hashes);
    let expected = task_ids.len();

    let executor = inner.executor.clone();
    let exec_key = key.clone();
    let thunk = task_fn(move || {
        let executor = executor.clone();
        let key = exec_key.clone();
        let payload = payload.clone();
        async move { executor.execute(&key, &payload).await }
    });

    let outcome = inner
        .queue
        .enqueue(thunk, earliest_start, Some(&compound), None)
        .await
        .and_then(|combined| {
            let fragments = split_batch_response(&combined);
            if fragments.len() == expected {
                Ok(fragments)
            } else {
                Err(DispatchError::BatchCountMismatch {
                    expected,
                    got: fragments.len(),
                })
            }
        });

    match outcome {
        Ok(fragments) => {
            let mut replies = Vec::with_capacity(expected);
            {
                let mut state = inner.state.lock();
                for (id, fragment) in task_ids.iter().zip(fragments) {
                    if let Some(mut entry) = state.inflight.remove(id) {
                        // Cancelled tasks keep their rejection; the batch
                        // result for them is discarded.
                        if !entry.cancelled {
                            if let Some(reply) = entry.reply.take() {
                                replies.push((reply, fragment));
                            }
                        }
                    }
                }
            }
            for (reply, fragment) in replies {
                let _ = reply.send(Ok(fragment));
            }
        }
        Err(error) => {
            let fallback_enabled = inner.config.lock().fallback_to_individual;
            if fallback_enabled {
                tracing::warn!(key = %key, error = %error, "Batch failed, retrying tasks individually");
                fallback_individual(inner, key, task_ids, earliest_start).await;
            } else {
                let mut replies = Vec::new();
                {
                    let mut state = inner.state.lock();
                    for id in &task_ids {
                        if let Some(mut entry) = state.inflight.remove(id) {
                            if let Some(reply) = entry.reply.take() {
                                replies.push(reply);
                            }
                        }
                    }
                }
                for reply in replies {
                    let _ = reply.send(Err(error.clone()));
                }
            }
        }
    }
}

/// Retry each surviving member of a failed batch as an independent request
/// through the request queue. Deliberately does not touch the batch queue
/// again, so a failing batch cannot recurse. Tasks stay in the in-flight
/// registry until their retry settles, so `cancel_tasks` can still reject
/// them mid-fallback and have the late result discarded.
async fn fallback_individual(
    inner: Arc<Inner>,
    key: BatchKey,
    task_ids: Vec<Uuid>,
    earliest_start: DateTime<Utc>,
) {
    let survivors: Vec<(Uuid, BatchTask)> = {
        let mut state = inner.state.lock();
        let mut survivors = Vec::new();
        for id in &task_ids {
            let cancelled = state
                .inflight
                .get(id)
                .map(|entry| entry.cancelled)
                .unwrap_or(true);
            if cancelled {
                state.inflight.remove(id);
            } else if let Some(entry) = state.inflight.get(id) {
                survivors.push((*id, entry.task.clone()));
            }
        }
        survivors
    };

    for (task_id, task) in survivors {
        let executor = inner.executor.clone();
        let key = key.clone();
        let inner = inner.clone();
        tokio::spawn(async move {
            let text = task.text.clone();
            let exec_key = key.clone();
            let thunk = task_fn(move || {
                let executor = executor.clone();
                let key = exec_key.clone();
                let text = text.clone();
                async move { executor.execute(&key, &text).await }
            });

            let result = inner
                .queue
                .enqueue(thunk, earliest_start, task.hash.as_ref(), None)
                .await;

            let reply = {
                let mut state = inner.state.lock();
                state.inflight.remove(&task_id).and_then(|mut entry| {
                    if entry.cancelled {
                        None
                    } else {
                        entry.reply.take()
                    }
                })
            };
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        });
    }
}

/// Hash identifying a combined batch payload, derived from the member
/// hashes where available so identical batches dedupe in the request queue.
fn compound_hash(key: &BatchKey, texts: &[String], hashes: &[Option<ContentHash>]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(key.to_string().as_bytes());
    hasher.update([0u8]);
    for (text, hash) in texts.iter().zip(hashes) {
        match hash {
            Some(hash) => hasher.update(hash.as_str().as_bytes()),
            None => hasher.update(text.as_bytes()),
        }
        hasher.update([0u8]);
    }
    ContentHash(format!("batch:{:x}", hasher.finalize()))
}
