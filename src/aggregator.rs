//! Caller-side batch controller for GenAI translation.
//!
//! Collects per-snippet requests on the content-script side, groups them by
//! language + provider context, and ships each group as a single batched
//! dispatcher message. Results come back index-aligned and are distributed
//! to each snippet's waiter; a context switch flushes the previous group
//! before the new one opens.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::genai::ChunkOutcome;
use crate::types::{
    ArticleContext, ClientRequestId, GenAiBatchRequest, GenAiChunk, LangConfig, ProviderConfig,
    TabId,
};

/// Receiver of aggregated batches; in production this is the dispatcher on
/// the far side of the messaging boundary.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn submit_batch(&self, request: GenAiBatchRequest) -> Result<Vec<ChunkOutcome>>;
}

/// Thresholds for the caller-side aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub max_items_per_batch: usize,
    pub max_characters_per_batch: usize,
    /// How long a partially filled group waits for more snippets.
    pub flush_delay_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_items_per_batch: 10,
            max_characters_per_batch: 4_000,
            flush_delay_ms: 60,
        }
    }
}

/// Grouping context for a batch: everything that must be identical across
/// its members.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub lang: LangConfig,
    pub provider: ProviderConfig,
    pub schedule_at: DateTime<Utc>,
    pub client_request_id: ClientRequestId,
    pub tab_id: Option<TabId>,
    pub article: Option<ArticleContext>,
}

impl BatchContext {
    /// Snippets aggregate together only when this key matches.
    fn key(&self) -> (String, String, String) {
        (
            self.lang.source.clone(),
            self.lang.target.clone(),
            self.provider.id.clone(),
        )
    }
}

struct PendingChunk {
    id: Uuid,
    chunk: GenAiChunk,
    resolver: oneshot::Sender<Result<String>>,
}

struct InflightChunk {
    resolver: Option<oneshot::Sender<Result<String>>>,
    cancelled: bool,
}

#[derive(Default)]
struct AggState {
    pending: Vec<PendingChunk>,
    context: Option<BatchContext>,
    total_chars: usize,
    generation: u64,
    inflight: HashMap<Uuid, InflightChunk>,
}

struct AggInner {
    sink: Arc<dyn BatchSink>,
    config: AggregatorConfig,
    state: Mutex<AggState>,
}

/// Handle for one enqueued snippet.
pub struct ChunkTicket {
    pub id: Uuid,
    rx: oneshot::Receiver<Result<String>>,
}

impl ChunkTicket {
    pub async fn wait(self) -> Result<String> {
        self.rx
            .await
            .map_err(|_| DispatchError::Internal("aggregator dropped chunk".into()))?
    }
}

#[derive(Clone)]
pub struct BatchAggregator {
    inner: Arc<AggInner>,
}

impl BatchAggregator {
    pub fn new(sink: Arc<dyn BatchSink>, config: AggregatorConfig) -> Self {
        Self {
            inner: Arc::new(AggInner {
                sink,
                config,
                state: Mutex::new(AggState::default()),
            }),
        }
    }

    /// Queue a snippet under the given context. A context switch flushes
    /// the previous group first; filling either threshold flushes now;
    /// otherwise the delay timer is re-armed. When `cancel` is supplied,
    /// firing it cancels this snippet.
    pub fn enqueue(
        &self,
        chunk: GenAiChunk,
        context: BatchContext,
        cancel: Option<&CancellationToken>,
    ) -> ChunkTicket {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();

        let mut flushes: Vec<(BatchContext, Vec<PendingChunk>)> = Vec::new();
        let mut timer_generation = None;

        {
            let mut state = self.inner.state.lock();

            let context_changed = state
                .context
                .as_ref()
                .is_some_and(|current| current.key() != context.key());
            if context_changed && !state.pending.is_empty() {
                if let Some(detached) = detach(&mut state) {
                    tracing::debug!(chunks = detached.1.len(), "Flushing batch on context change");
                    flushes.push(detached);
                }
            }
            state.context = Some(context);

            state.total_chars += chunk.text.chars().count();
            state.pending.push(PendingChunk {
                id,
                chunk,
                resolver: tx,
            });

            if state.pending.len() >= self.inner.config.max_items_per_batch
                || state.total_chars >= self.inner.config.max_characters_per_batch
            {
                if let Some(detached) = detach(&mut state) {
                    tracing::debug!(chunks = detached.1.len(), "Flushing full batch");
                    flushes.push(detached);
                }
            } else {
                state.generation += 1;
                timer_generation = Some(state.generation);
            }
        }

        for (context, chunks) in flushes {
            self.spawn_flush(context, chunks);
        }

        if let Some(generation) = timer_generation {
            let aggregator = self.clone();
            let delay = Duration::from_millis(self.inner.config.flush_delay_ms);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                aggregator.flush_if_generation(generation);
            });
        }

        if let Some(token) = cancel {
            let aggregator = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                aggregator.cancel_chunk(id);
            });
        }

        ChunkTicket { id, rx }
    }

    /// Force out whatever is pending.
    pub fn flush(&self, reason: &str) {
        let detached = {
            let mut state = self.inner.state.lock();
            detach(&mut state)
        };
        if let Some((context, chunks)) = detached {
            tracing::debug!(chunks = chunks.len(), reason, "Flushing batch");
            self.spawn_flush(context, chunks);
        }
    }

    fn flush_if_generation(&self, generation: u64) {
        let detached = {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                return;
            }
            detach(&mut state)
        };
        if let Some((context, chunks)) = detached {
            tracing::debug!(chunks = chunks.len(), "Flushing batch on delay timer");
            self.spawn_flush(context, chunks);
        }
    }

    /// Cancel one snippet. Pending: removed and rejected. In-flight:
    /// rejected now, its slot in the batch result is discarded. Returns
    /// whether anything was cancelled.
    pub fn cancel_chunk(&self, id: Uuid) -> bool {
        let resolver = {
            let mut state = self.inner.state.lock();
            if let Some(idx) = state.pending.iter().position(|p| p.id == id) {
                let pending = state.pending.remove(idx);
                state.total_chars = state
                    .total_chars
                    .saturating_sub(pending.chunk.text.chars().count());
                Some(pending.resolver)
            } else if let Some(entry) = state.inflight.get_mut(&id) {
                entry.cancelled = true;
                entry.resolver.take()
            } else {
                None
            }
        };

        match resolver {
            Some(resolver) => {
                let _ = resolver.send(Err(DispatchError::Cancelled("chunk cancelled".into())));
                true
            }
            None => false,
        }
    }

    fn spawn_flush(&self, context: BatchContext, chunks: Vec<PendingChunk>) {
        let ids: Vec<Uuid> = chunks.iter().map(|p| p.id).collect();
        let payload: Vec<GenAiChunk> = chunks.iter().map(|p| p.chunk.clone()).collect();
        {
            let mut state = self.inner.state.lock();
            for pending in chunks {
                state.inflight.insert(
                    pending.id,
                    InflightChunk {
                        resolver: Some(pending.resolver),
                        cancelled: false,
                    },
                );
            }
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let request = GenAiBatchRequest {
                chunks: payload,
                lang: context.lang,
                provider: context.provider,
                schedule_at: context.schedule_at,
                client_request_id: context.client_request_id,
                tab_id: context.tab_id,
                article: context.article,
            };
            let expected = ids.len();
            let result = inner.sink.submit_batch(request).await;

            let mut deliveries: Vec<(oneshot::Sender<Result<String>>, Result<String>)> =
                Vec::new();
            {
                let mut state = inner.state.lock();
                match &result {
                    Ok(outcomes) if outcomes.len() == expected => {
                        for (id, outcome) in ids.iter().zip(outcomes) {
                            if let Some(mut entry) = state.inflight.remove(id) {
                                if !entry.cancelled {
                                    if let Some(resolver) = entry.resolver.take() {
                                        deliveries.push((resolver, outcome.clone()));
                                    }
                                }
                            }
                        }
                    }
                    Ok(outcomes) => {
                        let error = DispatchError::BatchCountMismatch {
                            expected,
                            got: outcomes.len(),
                        };
                        for id in &ids {
                            if let Some(mut entry) = state.inflight.remove(id) {
                                if let Some(resolver) = entry.resolver.take() {
                                    deliveries.push((resolver, Err(error.clone())));
                                }
                            }
                        }
                    }
                    Err(error) => {
                        for id in &ids {
                            if let Some(mut entry) = state.inflight.remove(id) {
                                if let Some(resolver) = entry.resolver.take() {
                                    deliveries.push((resolver, Err(error.clone())));
                                }
                            }
                        }
                    }
                }
            }
            for (resolver, outcome) in deliveries {
                let _ = resolver.send(outcome);
            }
        });
    }
}

fn detach(state: &mut AggState) -> Option<(BatchContext, Vec<PendingChunk>)> {
    if state.pending.is_empty() {
        return None;
    }
    let context = state.context.clone()?;
    let chunks = std::mem::take(&mut state.pending);
    state.total_chars = 0;
    Some((context, chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentHash, ProviderKind};
    use parking_lot::Mutex as PlMutex;

    fn provider(id: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.into(),
            kind: ProviderKind::GenAi,
            base_url: "https://genai.example.com".into(),
            model: "model-1".into(),
        }
    }

    fn context(provider_id: &str) -> BatchContext {
        BatchContext {
            lang: LangConfig::new("en", "zh-CN"),
            provider: provider(provider_id),
            schedule_at: Utc::now(),
            client_request_id: ClientRequestId::new(),
            tab_id: None,
            article: None,
        }
    }

    fn chunk(text: &str) -> GenAiChunk {
        GenAiChunk {
            text: text.into(),
            hash: Some(ContentHash(format!("h-{}", text))),
            chunk: None,
        }
    }

    /// Uppercases each chunk; records batch sizes.
    struct SpySink {
        batches: PlMutex<Vec<Vec<String>>>,
    }

    impl SpySink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: PlMutex::new(Vec::new()),
            })
        }

        fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().clone()
        }
    }

    #[async_trait]
    impl BatchSink for SpySink {
        async fn submit_batch(&self, request: GenAiBatchRequest) -> Result<Vec<ChunkOutcome>> {
            let texts: Vec<String> = request.chunks.iter().map(|c| c.text.clone()).collect();
            self.batches.lock().push(texts.clone());
            Ok(texts.into_iter().map(|t| Ok(t.to_uppercase())).collect())
        }
    }

    fn config(max_items: usize) -> AggregatorConfig {
        AggregatorConfig {
            max_items_per_batch: max_items,
            max_characters_per_batch: 1_000,
            flush_delay_ms: 15,
        }
    }

    #[tokio::test]
    async fn groups_snippets_into_one_batch() {
        let sink = SpySink::new();
        let aggregator = BatchAggregator::new(sink.clone(), config(10));

        let ctx = context("genai");
        let a = aggregator.enqueue(chunk("a"), ctx.clone(), None);
        let b = aggregator.enqueue(chunk("b"), ctx.clone(), None);
        let c = aggregator.enqueue(chunk("c"), ctx, None);

        assert_eq!(a.wait().await.unwrap(), "A");
        assert_eq!(b.wait().await.unwrap(), "B");
        assert_eq!(c.wait().await.unwrap(), "C");

        assert_eq!(sink.batches(), vec![vec!["a", "b", "c"]]);
    }

    #[tokio::test]
    async fn item_threshold_flushes_immediately() {
        let sink = SpySink::new();
        let aggregator = BatchAggregator::new(sink.clone(), config(2));

        let ctx = context("genai");
        let a = aggregator.enqueue(chunk("a"), ctx.clone(), None);
        let b = aggregator.enqueue(chunk("b"), ctx.clone(), None);
        // The first two flushed without waiting for the timer.
        a.wait().await.unwrap();
        b.wait().await.unwrap();
        assert_eq!(sink.batches().len(), 1);

        let c = aggregator.enqueue(chunk("c"), ctx, None);
        c.wait().await.unwrap();
        assert_eq!(sink.batches().len(), 2);
    }

    #[tokio::test]
    async fn char_threshold_flushes_immediately() {
        let sink = SpySink::new();
        let aggregator = BatchAggregator::new(
            sink.clone(),
            AggregatorConfig {
                max_items_per_batch: 10,
                max_characters_per_batch: 5,
                flush_delay_ms: 500,
            },
        );

        let ctx = context("genai");
        let a = aggregator.enqueue(chunk("abcdef"), ctx, None);
        // Flushes without the (long) timer because the budget is crossed.
        assert_eq!(a.wait().await.unwrap(), "ABCDEF");
    }

    #[tokio::test]
    async fn context_change_flushes_previous_group() {
        let sink = SpySink::new();
        let aggregator = BatchAggregator::new(sink.clone(), config(10));

        let a = aggregator.enqueue(chunk("a"), context("genai"), None);
        let b = aggregator.enqueue(chunk("b"), context("other"), None);

        assert_eq!(a.wait().await.unwrap(), "A");
        assert_eq!(b.wait().await.unwrap(), "B");

        // Two separate batches, old context first.
        assert_eq!(sink.batches(), vec![vec!["a"], vec!["b"]]);
    }

    struct ShortSink;

    #[async_trait]
    impl BatchSink for ShortSink {
        async fn submit_batch(&self, _request: GenAiBatchRequest) -> Result<Vec<ChunkOutcome>> {
            Ok(vec![Ok("only one".to_string())])
        }
    }

    #[tokio::test]
    async fn size_mismatch_rejects_every_chunk() {
        let aggregator = BatchAggregator::new(Arc::new(ShortSink), config(2));

        let ctx = context("genai");
        let a = aggregator.enqueue(chunk("a"), ctx.clone(), None);
        let b = aggregator.enqueue(chunk("b"), ctx, None);

        assert!(matches!(
            a.wait().await,
            Err(DispatchError::BatchCountMismatch { expected: 2, got: 1 })
        ));
        assert!(matches!(
            b.wait().await,
            Err(DispatchError::BatchCountMismatch { expected: 2, got: 1 })
        ));
    }

    #[tokio::test]
    async fn cancelling_a_pending_chunk_excludes_it() {
        let sink = SpySink::new();
        let aggregator = BatchAggregator::new(sink.clone(), config(10));

        let ctx = context("genai");
        let doomed = aggregator.enqueue(chunk("dead"), ctx.clone(), None);
        let live = aggregator.enqueue(chunk("live"), ctx, None);

        assert!(aggregator.cancel_chunk(doomed.id));
        assert!(matches!(
            doomed.wait().await,
            Err(DispatchError::Cancelled(_))
        ));

        assert_eq!(live.wait().await.unwrap(), "LIVE");
        assert_eq!(sink.batches(), vec![vec!["live"]]);

        // Unknown ids are a no-op.
        assert!(!aggregator.cancel_chunk(Uuid::new_v4()));
    }

    struct SlowSink;

    #[async_trait]
    impl BatchSink for SlowSink {
        async fn submit_batch(&self, request: GenAiBatchRequest) -> Result<Vec<ChunkOutcome>> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(request
                .chunks
                .iter()
                .map(|c| Ok(c.text.to_uppercase()))
                .collect())
        }
    }

    #[tokio::test]
    async fn cancelling_an_inflight_chunk_rejects_only_it() {
        let aggregator = BatchAggregator::new(Arc::new(SlowSink), config(2));

        let ctx = context("genai");
        let doomed = aggregator.enqueue(chunk("dead"), ctx.clone(), None);
        let live = aggregator.enqueue(chunk("live"), ctx, None);

        // Both are in flight now (threshold flush); cancel one.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let doomed_id = doomed.id;
        assert!(aggregator.cancel_chunk(doomed_id));

        assert!(matches!(
            doomed.wait().await,
            Err(DispatchError::Cancelled(_))
        ));
        assert_eq!(live.wait().await.unwrap(), "LIVE");

        // Second cancel of the same chunk is a no-op.
        assert!(!aggregator.cancel_chunk(doomed_id));
    }

    #[tokio::test]
    async fn abort_signal_cancels_the_chunk() {
        let aggregator = BatchAggregator::new(Arc::new(SlowSink), config(10));

        let token = CancellationToken::new();
        let ticket = aggregator.enqueue(chunk("dead"), context("genai"), Some(&token));

        token.cancel();
        assert!(matches!(
            ticket.wait().await,
            Err(DispatchError::Cancelled(_))
        ));
    }
}
