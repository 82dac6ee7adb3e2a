//! Token-bucket scheduler.
//!
//! Admits one task per token. Tokens regenerate at `rate` per second up to a
//! `capacity` burst. Ready tasks (earliest-start elapsed) are admitted in
//! insertion order; a deferred task never blocks later ready ones. Each
//! admitted attempt runs under a wall-clock timeout, and retryable failures
//! are rescheduled with exponential backoff until the attempt budget is
//! spent.
//!
//! The scheduler is a single worker task fed by a channel; the shared state
//! never crosses an await on the caller side.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::error::{DispatchError, Result};

/// A schedulable unit of work. Stored as a factory so retries can re-run it.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Wrap an async closure as a [`TaskFn`].
pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

struct Entry {
    seq: u64,
    task: TaskFn,
    not_before: DateTime<Utc>,
    /// 0-based attempt index; incremented on each retry.
    attempt: u32,
    /// Limits snapshotted at submit time; reconfiguration does not touch
    /// tasks already in the queue.
    limits: QueueConfig,
    /// When set, the entry is evicted from the queue (or its running
    /// attempt aborted) as soon as the token fires.
    cancel: Option<CancellationToken>,
    reply: oneshot::Sender<Result<String>>,
}

enum Msg {
    Submit(Entry),
    Reconfigure(QueueConfig),
}

struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, capacity: u32) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            rate: rate.max(f64::MIN_POSITIVE),
            capacity,
            // Full burst available at startup
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_token(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
    }

    fn reconfigure(&mut self, rate: f64, capacity: u32) {
        self.rate = rate.max(f64::MIN_POSITIVE);
        self.capacity = capacity.max(1) as f64;
        self.tokens = self.tokens.min(self.capacity);
    }
}

/// Handle to the scheduler worker.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Msg>,
    seq: Arc<std::sync::atomic::AtomicU64>,
}

impl Scheduler {
    pub fn new(config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(config, rx));
        Self {
            tx,
            seq: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Submit a task; resolves with the task's eventual result after
    /// admission, timeout handling, and retries. `limits` is the caller's
    /// config snapshot; tasks keep the limits they were submitted with.
    /// A fired `cancel` token rejects the task with an abort error whether
    /// it is still queued or already running.
    pub async fn submit(
        &self,
        task: TaskFn,
        earliest_start: DateTime<Utc>,
        limits: QueueConfig,
        cancel: Option<CancellationToken>,
    ) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let entry = Entry {
            seq: self.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            task,
            not_before: earliest_start,
            attempt: 0,
            limits,
            cancel,
            reply: reply_tx,
        };

        self.tx
            .send(Msg::Submit(entry))
            .map_err(|_| DispatchError::Internal("scheduler worker stopped".into()))?;

        reply_rx
            .await
            .map_err(|_| DispatchError::Internal("scheduler dropped task".into()))?
    }

    /// Apply a new rate/capacity to the shared bucket. Per-task limits are
    /// snapshotted at submit time and unaffected.
    pub fn reconfigure(&self, config: QueueConfig) {
        let _ = self.tx.send(Msg::Reconfigure(config));
    }
}

enum Done {
    Retry(Entry),
    Finished,
}

async fn run_worker(config: QueueConfig, mut rx: mpsc::UnboundedReceiver<Msg>) {
    let mut bucket = TokenBucket::new(config.rate, config.capacity);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Done>();
    // Kept in seq order; retries re-enter at their original position.
    let mut pending: Vec<Entry> = Vec::new();
    let mut in_flight: usize = 0;
    let mut closed = false;

    loop {
        bucket.refill();
        let now = Utc::now();

        // Evict cancelled entries before they can consume a token; their
        // waiters get the abort instead of a result.
        let mut idx = 0;
        while idx < pending.len() {
            let fired = pending[idx]
                .cancel
                .as_ref()
                .is_some_and(|token| token.is_cancelled());
            if fired {
                let entry = pending.remove(idx);
                tracing::debug!(seq = entry.seq, "Task cancelled while queued");
                let _ = entry
                    .reply
                    .send(Err(DispatchError::Cancelled("cancelled while queued".into())));
            } else {
                idx += 1;
            }
        }

        // Admit ready entries in insertion order while tokens last.
        loop {
            let Some(idx) = pending.iter().position(|e| e.not_before <= now) else {
                break;
            };
            if !bucket.try_take() {
                break;
            }
            let entry = pending.remove(idx);
            tracing::debug!(seq = entry.seq, attempt = entry.attempt, "Task admitted");
            in_flight += 1;
            tokio::spawn(run_entry(entry, done_tx.clone()));
        }

        if closed && pending.is_empty() && in_flight == 0 {
            break;
        }

        let sleep_for = next_wake(&pending, &bucket, now);

        tokio::select! {
            biased;
            msg = rx.recv(), if !closed => match msg {
                Some(Msg::Submit(entry)) => insert_sorted(&mut pending, entry),
                Some(Msg::Reconfigure(new_config)) => {
                    tracing::info!(rate = new_config.rate, capacity = new_config.capacity, "Scheduler reconfigured");
                    bucket.reconfigure(new_config.rate, new_config.capacity);
                }
                None => closed = true,
            },
            done = done_rx.recv() => {
                in_flight = in_flight.saturating_sub(1);
                if let Some(Done::Retry(entry)) = done {
                    insert_sorted(&mut pending, entry);
                }
            },
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}

fn insert_sorted(pending: &mut Vec<Entry>, entry: Entry) {
    let idx = pending.partition_point(|e| e.seq <= entry.seq);
    pending.insert(idx, entry);
}

/// How long the worker can sleep before something becomes actionable.
fn next_wake(pending: &[Entry], bucket: &TokenBucket, now: DateTime<Utc>) -> Duration {
    let mut wake = Duration::from_secs(60);

    let any_ready = pending.iter().any(|e| e.not_before <= now);
    if any_ready {
        wake = wake.min(bucket.time_until_token().max(Duration::from_millis(1)));
    }

    for entry in pending {
        if entry.not_before > now {
            let wait = (entry.not_before - now)
                .to_std()
                .unwrap_or(Duration::from_millis(1));
            wake = wake.min(wait.max(Duration::from_millis(1)));
        }
    }

    wake
}

async fn run_entry(entry: Entry, done_tx: mpsc::UnboundedSender<Done>) {
    let Entry {
        seq,
        task,
        attempt,
        limits,
        cancel,
        reply,
        ..
    } = entry;

    let deadline = Duration::from_millis(limits.timeout_ms);
    let attempt_future = async {
        match tokio::time::timeout(deadline, (task)()).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(limits.timeout_ms)),
        }
    };
    // The running attempt races its cancellation token.
    let result = match &cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => {
                Err(DispatchError::Cancelled("cancelled mid-attempt".into()))
            }
            result = attempt_future => result,
        },
        None => attempt_future.await,
    };

    match result {
        Ok(value) => {
            let _ = reply.send(Ok(value));
            let _ = done_tx.send(Done::Finished);
        }
        Err(error) if error.is_retryable() && attempt < limits.max_retries => {
            let delay = limits.retry_delay(attempt);
            tracing::debug!(
                seq,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Task failed, scheduling retry"
            );
            let retried = Entry {
                seq,
                task,
                not_before: Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
                attempt: attempt + 1,
                limits,
                cancel,
                reply,
            };
            // If the worker is gone the entry (and its reply sender) drops
            // here and the waiter observes shutdown.
            let _ = done_tx.send(Done::Retry(retried));
        }
        Err(error) => {
            tracing::debug!(seq, attempt, error = %error, "Task failed terminally");
            let _ = reply.send(Err(error));
            let _ = done_tx.send(Done::Finished);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> QueueConfig {
        QueueConfig {
            rate: 1_000.0,
            capacity: 100,
            timeout_ms: 5_000,
            max_retries: 0,
            base_retry_delay_ms: 10,
            max_retry_delay_ms: 100,
        }
    }

    #[tokio::test]
    async fn executes_a_task() {
        let scheduler = Scheduler::new(fast_config());
        let result = scheduler
            .submit(
                task_fn(|| async { Ok("done".to_string()) }),
                Utc::now(),
                fast_config(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result, "done");
    }

    #[tokio::test]
    async fn times_out_slow_tasks() {
        let scheduler = Scheduler::new(fast_config());
        let limits = QueueConfig {
            timeout_ms: 50,
            ..fast_config()
        };

        let result = scheduler
            .submit(
                task_fn(|| async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok("late".to_string())
                }),
                Utc::now(),
                limits,
                None,
            )
            .await;

        assert_eq!(result, Err(DispatchError::Timeout(50)));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let scheduler = Scheduler::new(fast_config());
        let limits = QueueConfig {
            max_retries: 2,
            base_retry_delay_ms: 5,
            ..fast_config()
        };

        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();
        let result = scheduler
            .submit(
                task_fn(move || {
                    let seen = seen.clone();
                    async move {
                        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(DispatchError::Transport("connection reset".into()))
                        } else {
                            Ok("recovered".to_string())
                        }
                    }
                }),
                Utc::now(),
                limits,
                None,
            )
            .await
            .unwrap();

        assert_eq!(result, "recovered");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_propagate_the_error() {
        let scheduler = Scheduler::new(fast_config());
        let limits = QueueConfig {
            max_retries: 2,
            base_retry_delay_ms: 1,
            ..fast_config()
        };

        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();
        let result = scheduler
            .submit(
                task_fn(move || {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Err(DispatchError::Transport("still down".into()))
                    }
                }),
                Utc::now(),
                limits,
                None,
            )
            .await;

        assert_eq!(
            result,
            Err(DispatchError::Transport("still down".into()))
        );
        // Initial attempt + 2 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_failures_do_not_retry() {
        let scheduler = Scheduler::new(fast_config());
        let limits = QueueConfig {
            max_retries: 3,
            ..fast_config()
        };

        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();
        let result = scheduler
            .submit(
                task_fn(move || {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Err(DispatchError::ResponseFailed("R50001".into()))
                    }
                }),
                Utc::now(),
                limits,
                None,
            )
            .await;

        assert!(matches!(result, Err(DispatchError::ResponseFailed(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ready_tasks_run_in_submission_order() {
        // One token at a time so order is observable.
        let config = QueueConfig {
            rate: 200.0,
            capacity: 1,
            ..fast_config()
        };
        let scheduler = Scheduler::new(config.clone());

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let order = order.clone();
            let scheduler = scheduler.clone();
            let limits = config.clone();
            handles.push(tokio::spawn(async move {
                scheduler
                    .submit(
                        task_fn(move || {
                            let order = order.clone();
                            async move {
                                order.lock().push(i);
                                Ok(String::new())
                            }
                        }),
                        Utc::now(),
                        limits,
                        None,
                    )
                    .await
            }));
            // Stagger submissions so seq order matches loop order.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn deferred_task_does_not_block_ready_tasks() {
        let scheduler = Scheduler::new(fast_config());

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let deferred = {
            let order = order.clone();
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .submit(
                        task_fn(move || {
                            let order = order.clone();
                            async move {
                                order.lock().push("deferred");
                                Ok(String::new())
                            }
                        }),
                        Utc::now() + chrono::Duration::milliseconds(200),
                        fast_config(),
                        None,
                    )
                    .await
            })
        };

        let immediate = {
            let order = order.clone();
            scheduler
                .submit(
                    task_fn(move || {
                        let order = order.clone();
                        async move {
                            order.lock().push("immediate");
                            Ok(String::new())
                        }
                    }),
                    Utc::now(),
                    fast_config(),
                    None,
                )
                .await
        };

        immediate.unwrap();
        deferred.await.unwrap().unwrap();

        assert_eq!(*order.lock(), vec!["immediate", "deferred"]);
    }

    #[tokio::test]
    async fn cancelled_queued_task_is_evicted_without_running() {
        // One token total, slow regeneration: the second task has to queue.
        let config = QueueConfig {
            rate: 1.0,
            capacity: 1,
            ..fast_config()
        };
        let scheduler = Scheduler::new(config.clone());

        let blocker = {
            let scheduler = scheduler.clone();
            let limits = config.clone();
            tokio::spawn(async move {
                scheduler
                    .submit(
                        task_fn(|| async {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(String::new())
                        }),
                        Utc::now(),
                        limits,
                        None,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ran = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let queued = {
            let scheduler = scheduler.clone();
            let limits = config.clone();
            let ran = ran.clone();
            let token = token.clone();
            tokio::spawn(async move {
                scheduler
                    .submit(
                        task_fn(move || {
                            let ran = ran.clone();
                            async move {
                                ran.fetch_add(1, Ordering::SeqCst);
                                Ok(String::new())
                            }
                        }),
                        Utc::now(),
                        limits,
                        Some(token),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        token.cancel();
        let result = queued.await.unwrap();
        assert!(matches!(result, Err(DispatchError::Cancelled(_))));
        // The task never executed: it was evicted, not run-and-discarded.
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        blocker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_aborts_a_running_task() {
        let scheduler = Scheduler::new(fast_config());
        let token = CancellationToken::new();

        let handle = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move {
                scheduler
                    .submit(
                        task_fn(|| async {
                            tokio::time::sleep(Duration::from_secs(10)).await;
                            Ok("never".to_string())
                        }),
                        Utc::now(),
                        fast_config(),
                        Some(token),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        token.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(DispatchError::Cancelled(_))));
    }
}
