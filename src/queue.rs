//! Request queue: dedupe-by-hash and retry on top of the scheduler.
//!
//! Concurrent enqueues that share a content hash attach to the first
//! in-flight submission instead of re-executing the thunk; every waiter
//! observes the same terminal result. The dedupe entry is removed when the
//! shared result settles, so late arrivers either join the in-flight entry
//! or trigger a fresh submission.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::{QueueConfig, QueueConfigPatch};
use crate::error::{DispatchError, Result};
use crate::scheduler::{Scheduler, TaskFn};
use crate::types::ContentHash;

#[derive(Default)]
struct Inflight {
    waiters: Vec<oneshot::Sender<Result<String>>>,
}

/// Rate-limited request queue with in-flight deduplication.
#[derive(Clone)]
pub struct RequestQueue {
    scheduler: Scheduler,
    config: Arc<Mutex<QueueConfig>>,
    inflight: Arc<Mutex<HashMap<ContentHash, Inflight>>>,
}

impl RequestQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            scheduler: Scheduler::new(config.clone()),
            config: Arc::new(Mutex::new(config)),
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Current config snapshot (applied to submissions from now on).
    pub fn config(&self) -> QueueConfig {
        self.config.lock().clone()
    }

    /// Apply a partial reconfiguration. Tasks already submitted keep the
    /// limits they were submitted with.
    pub fn set_config(&self, patch: &QueueConfigPatch) {
        let updated = {
            let mut config = self.config.lock();
            config.apply(patch);
            config.clone()
        };
        tracing::info!(
            rate = updated.rate,
            capacity = updated.capacity,
            timeout_ms = updated.timeout_ms,
            max_retries = updated.max_retries,
            "Request queue reconfigured"
        );
        self.scheduler.reconfigure(updated);
    }

    /// Enqueue a thunk. With a hash, an identical in-flight thunk absorbs
    /// this call: the thunk is not re-executed and the shared result is
    /// returned to every attached waiter. A fired `cancel` token evicts the
    /// submission from the scheduler queue or aborts its running attempt;
    /// for deduplicated entries the owner's token governs the shared
    /// execution.
    pub async fn enqueue(
        &self,
        task: TaskFn,
        earliest_start: DateTime<Utc>,
        hash: Option<&ContentHash>,
        cancel: Option<CancellationToken>,
    ) -> Result<String> {
        let Some(hash) = hash else {
            let limits = self.config();
            return self
                .scheduler
                .submit(task, earliest_start, limits, cancel)
                .await;
        };

        // Either attach to the in-flight entry or become its owner.
        let attach_rx = {
            let mut inflight = self.inflight.lock();
            match inflight.entry(hash.clone()) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.get_mut().waiters.push(tx);
                    Some(rx)
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(Inflight::default());
                    None
                }
            }
        };

        if let Some(rx) = attach_rx {
            tracing::debug!(hash = %hash, "Attached to in-flight request");
            return rx
                .await
                .map_err(|_| DispatchError::Cancelled("deduped owner dropped".into()))?;
        }

        // Owner path: the guard settles the entry even if this future is
        // dropped mid-submission, so attached waiters never hang.
        let guard = OwnerGuard {
            queue: self.clone(),
            hash: hash.clone(),
            armed: true,
        };

        let limits = self.config();
        let result = self
            .scheduler
            .submit(task, earliest_start, limits, cancel)
            .await;

        guard.settle(result.clone());
        result
    }

    fn settle_inflight(&self, hash: &ContentHash, result: Result<String>) {
        let entry = self.inflight.lock().remove(hash);
        if let Some(entry) = entry {
            for waiter in entry.waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }
}

struct OwnerGuard {
    queue: RequestQueue,
    hash: ContentHash,
    armed: bool,
}

impl OwnerGuard {
    fn settle(mut self, result: Result<String>) {
        self.armed = false;
        self.queue.settle_inflight(&self.hash, result);
    }
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        if self.armed {
            self.queue.settle_inflight(
                &self.hash,
                Err(DispatchError::Cancelled("deduped owner dropped".into())),
            );
        }
    }
}
