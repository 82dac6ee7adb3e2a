//! Dispatcher: the entry point of the translation core.
//!
//! Every request is registered for cancellation, checked against the
//! content-addressed cache, and routed by provider kind: generic LLM
//! providers coalesce in the batch queue, GenAI providers ride the
//! conversation driver behind the rate-limited request queue (with
//! backlog-aware pool warm-up), and simple providers go straight to the
//! request queue. Successful results with a hash are written back to the
//! cache before the caller sees them.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchExecutor, BatchQueue, BatchTask};
use crate::cache::{CacheEntry, ChunkMetrics, TranslationCache};
use crate::config::{BatchConfigPatch, QueueConfigPatch};
use crate::error::{DispatchError, Result};
use crate::genai::{ChunkOutcome, GenAiDriver};
use crate::http::HttpClient;
use crate::llm::{LlmBackend, TranslationBackend};
use crate::pool::{create_chat_fn, ChatPool, Purpose};
use crate::queue::RequestQueue;
use crate::registry::ClientRegistry;
use crate::scheduler::task_fn;
use crate::store::KeyValueStore;
use crate::types::{
    BatchKey, ClientRequestId, GenAiBatchRequest, LangConfig, ProviderConfig, ProviderKind, TabId,
    TranslateRequest,
};

/// Top-level configuration for the dispatcher and its queues.
#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    pub queue: crate::config::QueueConfig,
    pub batch: crate::config::BatchConfig,
    pub genai: crate::config::GenAiConfig,
    /// Attach chunk-metric records to cache entries.
    pub collect_metrics: bool,
    /// Translation mode tag recorded in the metrics (e.g. "page").
    pub mode: String,
}

struct DispatcherInner {
    cache: TranslationCache,
    registry: ClientRegistry,
    queue: RequestQueue,
    batch: BatchQueue,
    genai: GenAiDriver,
    backend: Arc<dyn TranslationBackend>,
    /// Provider configs seen so far, for the batch executor's lookup.
    providers: Arc<Mutex<HashMap<String, ProviderConfig>>>,
    genai_backlog: AtomicUsize,
    max_slots: usize,
    collect_metrics: bool,
    mode: String,
}

/// Routes a flushed batch payload to the generic LLM backend.
struct BackendExecutor {
    backend: Arc<dyn TranslationBackend>,
    providers: Arc<Mutex<HashMap<String, ProviderConfig>>>,
}

#[async_trait::async_trait]
impl BatchExecutor for BackendExecutor {
    async fn execute(&self, key: &BatchKey, payload: &str) -> Result<String> {
        let provider = self
            .providers
            .lock()
            .get(&key.provider_id)
            .cloned()
            .ok_or_else(|| {
                DispatchError::Internal(format!("unknown provider {}", key.provider_id))
            })?;
        let lang = LangConfig::new(key.source.clone(), key.target.clone());
        self.backend.translate(&provider, &lang, None, payload).await
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Build a dispatcher with the standard LLM backend.
    pub async fn new(
        http: Arc<dyn HttpClient>,
        store: Arc<dyn KeyValueStore>,
        config: DispatcherConfig,
    ) -> Result<Self> {
        let backend = Arc::new(LlmBackend::new(http.clone(), config.queue.timeout_ms));
        Self::with_backend(http, store, config, backend).await
    }

    /// Build a dispatcher with an injected generic-provider backend.
    pub async fn with_backend(
        http: Arc<dyn HttpClient>,
        store: Arc<dyn KeyValueStore>,
        config: DispatcherConfig,
        backend: Arc<dyn TranslationBackend>,
    ) -> Result<Self> {
        let cache = TranslationCache::new(store.clone());
        let pool = ChatPool::load(
            store,
            config.genai.max_slots_per_key,
            config.genai.idle_ttl(),
        )
        .await?;
        let genai = GenAiDriver::new(http, pool, config.genai.clone(), cache.clone());

        let queue = RequestQueue::new(config.queue.clone());
        let providers: Arc<Mutex<HashMap<String, ProviderConfig>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let executor = Arc::new(BackendExecutor {
            backend: backend.clone(),
            providers: providers.clone(),
        });
        let batch = BatchQueue::new(queue.clone(), executor, config.batch.clone());

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                cache,
                registry: ClientRegistry::new(),
                queue,
                batch,
                genai,
                backend,
                providers,
                genai_backlog: AtomicUsize::new(0),
                max_slots: config.genai.max_slots_per_key,
                collect_metrics: config.collect_metrics,
                mode: config.mode,
            }),
        })
    }

    pub fn cache(&self) -> &TranslationCache {
        &self.inner.cache
    }

    /// `setTranslateRequestQueueConfig`.
    pub fn set_translate_request_queue_config(&self, patch: &QueueConfigPatch) {
        self.inner.queue.set_config(patch);
    }

    /// `setTranslateBatchQueueConfig`.
    pub fn set_translate_batch_queue_config(&self, patch: &BatchConfigPatch) {
        self.inner.batch.set_config(patch);
    }

    /// `enqueueTranslateRequest`: translate one snippet.
    #[tracing::instrument(skip(self, request), fields(client_request_id = %request.client_request_id, provider = %request.provider.id))]
    pub async fn enqueue_translate_request(&self, request: TranslateRequest) -> Result<String> {
        let guard = self
            .inner
            .registry
            .register(request.client_request_id, request.tab_id);
        let token = guard.token();
        // The guard drops on every exit path, releasing the registration.
        self.dispatch_single(request, token).await
    }

    /// `enqueueGenAIBatch`: translate a chunk group, positionally aligned.
    #[tracing::instrument(skip(self, request), fields(client_request_id = %request.client_request_id, chunks = request.chunks.len()))]
    pub async fn enqueue_genai_batch(
        &self,
        request: GenAiBatchRequest,
    ) -> Result<Vec<ChunkOutcome>> {
        let guard = self
            .inner
            .registry
            .register(request.client_request_id, request.tab_id);
        let token = guard.token();
        self.dispatch_genai_batch(request, token).await
    }

    /// Cancel one client request: fire its abort signal and drop its
    /// pending batch entries. Idempotent.
    pub fn cancel_client_request(&self, id: ClientRequestId) -> bool {
        let fired = self.inner.registry.cancel(id);
        let removed = self
            .inner
            .batch
            .cancel_tasks(|cid| *cid == id, "request cancelled");
        fired || removed > 0
    }

    /// Tab closed: cancel every client request registered under it.
    pub fn notify_tab_closed(&self, tab_id: TabId) -> usize {
        let ids = self.inner.registry.close_tab(tab_id);
        if ids.is_empty() {
            return 0;
        }
        let cancelled: HashSet<ClientRequestId> = ids.iter().copied().collect();
        self.inner
            .batch
            .cancel_tasks(|cid| cancelled.contains(cid), "tab closed");
        ids.len()
    }

    async fn dispatch_single(
        &self,
        request: TranslateRequest,
        token: CancellationToken,
    ) -> Result<String> {
        if let Some(hash) = &request.hash {
            if let Some(entry) = self.inner.cache.get(hash).await? {
                tracing::debug!(hash = %hash, "Cache hit");
                return Ok(entry.translation);
            }
        }
        if token.is_cancelled() {
            return Err(DispatchError::Cancelled("client aborted".into()));
        }

        self.remember_provider(&request.provider);
        let started = std::time::Instant::now();

        let result = match request.provider.kind {
            ProviderKind::Llm => {
                let key = BatchKey::for_request(&request.lang, &request.provider);
                let mut task = BatchTask::new(
                    request.text.clone(),
                    request.client_request_id,
                    request.schedule_at,
                );
                task.hash = request.hash.clone();
                self.inner.batch.enqueue(key, task).await
            }
            ProviderKind::GenAi => self.dispatch_genai_single(&request, &token).await,
            ProviderKind::Simple => {
                let backend = self.inner.backend.clone();
                let provider = request.provider.clone();
                let lang = request.lang.clone();
                let article = request.article.clone();
                let text = request.text.clone();
                let cancel = token.clone();
                let thunk = task_fn(move || {
                    let backend = backend.clone();
                    let provider = provider.clone();
                    let lang = lang.clone();
                    let article = article.clone();
                    let text = text.clone();
                    let cancel = cancel.clone();
                    async move {
                        if cancel.is_cancelled() {
                            return Err(DispatchError::Cancelled("client aborted".into()));
                        }
                        backend
                            .translate(&provider, &lang, article.as_ref(), &text)
                            .await
                    }
                });
                self.inner
                    .queue
                    .enqueue(
                        thunk,
                        request.schedule_at,
                        request.hash.as_ref(),
                        Some(token.clone()),
                    )
                    .await
            }
        };

        if let Ok(translation) = &result {
            if let Some(hash) = &request.hash {
                let entry = self.build_entry(translation, &request, started.elapsed());
                if let Err(error) = self.inner.cache.put(hash, entry).await {
                    tracing::warn!(hash = %hash, error = %error, "Cache write failed");
                }
            }
        }
        result
    }

    async fn dispatch_genai_single(
        &self,
        request: &TranslateRequest,
        token: &CancellationToken,
    ) -> Result<String> {
        let backlog = self.inner.genai_backlog.fetch_add(1, Ordering::SeqCst) + 1;
        self.warm_pool(&request.provider, backlog);

        let genai = self.inner.genai.clone();
        let provider = request.provider.clone();
        let lang = request.lang.clone();
        let article = request.article.clone();
        let text = request.text.clone();
        let cancel = token.clone();
        let thunk = task_fn(move || {
            let genai = genai.clone();
            let provider = provider.clone();
            let lang = lang.clone();
            let article = article.clone();
            let text = text.clone();
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return Err(DispatchError::Cancelled("client aborted".into()));
                }
                genai
                    .translate(&provider, &lang, &text, article.as_ref(), &cancel)
                    .await
            }
        });

        let result = self
            .inner
            .queue
            .enqueue(
                thunk,
                request.schedule_at,
                request.hash.as_ref(),
                Some(token.clone()),
            )
            .await;
        self.inner.genai_backlog.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn dispatch_genai_batch(
        &self,
        request: GenAiBatchRequest,
        token: CancellationToken,
    ) -> Result<Vec<ChunkOutcome>> {
        let total = request.chunks.len();
        let mut outcomes: Vec<Option<ChunkOutcome>> = (0..total).map(|_| None).collect();
        let mut misses = Vec::new();
        for (index, chunk) in request.chunks.iter().enumerate() {
            if let Some(hash) = &chunk.hash {
                if let Some(entry) = self.inner.cache.get(hash).await? {
                    outcomes[index] = Some(Ok(entry.translation));
                    continue;
                }
            }
            misses.push((index, chunk.clone()));
        }
        if misses.is_empty() {
            return Ok(outcomes.into_iter().flatten().collect());
        }
        if token.is_cancelled() {
            return Err(DispatchError::Cancelled("client aborted".into()));
        }

        self.remember_provider(&request.provider);
        let backlog = self.inner.genai_backlog.fetch_add(1, Ordering::SeqCst) + 1;
        self.warm_pool(&request.provider, backlog);
        let started = std::time::Instant::now();

        let sub_request = GenAiBatchRequest {
            chunks: misses.iter().map(|(_, chunk)| chunk.clone()).collect(),
            ..request.clone()
        };
        let result = self.inner.genai.translate_batch(&sub_request, &token).await;
        self.inner.genai_backlog.fetch_sub(1, Ordering::SeqCst);

        let sub_outcomes = result?;
        let latency = started.elapsed();
        for ((index, chunk), outcome) in misses.into_iter().zip(sub_outcomes) {
            if let (Ok(text), Some(hash)) = (&outcome, &chunk.hash) {
                let mut entry = CacheEntry::new(text.clone());
                if self.inner.collect_metrics {
                    entry = entry.with_metrics(ChunkMetrics {
                        raw_chars: chunk
                            .chunk
                            .as_ref()
                            .map(|m| m.raw_chars)
                            .unwrap_or(chunk.text.chars().count() as u32),
                        clean_chars: chunk
                            .chunk
                            .as_ref()
                            .map(|m| m.clean_chars)
                            .unwrap_or(chunk.text.chars().count() as u32),
                        stripped_markup: chunk
                            .chunk
                            .as_ref()
                            .map(|m| m.stripped_markup)
                            .unwrap_or(false),
                        provider_id: request.provider.id.clone(),
                        latency_ms: latency.as_millis() as u64,
                        hostname: hostname_of(&request.provider.base_url),
                        mode: self.inner.mode.clone(),
                    });
                }
                if let Err(error) = self.inner.cache.put(hash, entry).await {
                    tracing::warn!(hash = %hash, error = %error, "Cache write failed");
                }
            }
            outcomes[index] = Some(outcome);
        }

        Ok(outcomes.into_iter().flatten().collect())
    }

    /// Best-effort pool warm-up sized to the current backlog.
    fn warm_pool(&self, provider: &ProviderConfig, backlog: usize) {
        let desired = backlog.div_ceil(2).clamp(1, self.inner.max_slots);
        let key = GenAiDriver::pool_key(provider, Purpose::Translate);
        let client = self.inner.genai.client_for(provider);
        let create = {
            let client = client.clone();
            create_chat_fn(move || {
                let client = client.clone();
                async move { client.create_chat().await }
            })
        };
        let pool = self.inner.genai.pool().clone();
        tokio::spawn(async move {
            match client.check_session().await {
                Ok(true) => pool.scale(key, desired, create).await,
                Ok(false) => {
                    tracing::warn!(key = %key, "GenAI session not authenticated, skipping warm-up");
                }
                Err(error) => {
                    tracing::debug!(key = %key, error = %error, "Session probe failed, skipping warm-up");
                }
            }
        });
    }

    fn remember_provider(&self, provider: &ProviderConfig) {
        self.inner
            .providers
            .lock()
            .insert(provider.id.clone(), provider.clone());
    }

    fn build_entry(
        &self,
        translation: &str,
        request: &TranslateRequest,
        latency: std::time::Duration,
    ) -> CacheEntry {
        let mut entry = CacheEntry::new(translation);
        if self.inner.collect_metrics {
            let chars = request.text.chars().count() as u32;
            entry = entry.with_metrics(ChunkMetrics {
                raw_chars: request.chunk.as_ref().map(|m| m.raw_chars).unwrap_or(chars),
                clean_chars: request
                    .chunk
                    .as_ref()
                    .map(|m| m.clean_chars)
                    .unwrap_or(chars),
                stripped_markup: request
                    .chunk
                    .as_ref()
                    .map(|m| m.stripped_markup)
                    .unwrap_or(false),
                provider_id: request.provider.id.clone(),
                latency_ms: latency.as_millis() as u64,
                hostname: hostname_of(&request.provider.base_url),
                mode: self.inner.mode.clone(),
            });
        }
        entry
    }
}

/// The dispatcher is the natural sink for the caller-side aggregator when
/// both run in one process.
#[async_trait::async_trait]
impl crate::aggregator::BatchSink for Dispatcher {
    async fn submit_batch(&self, request: GenAiBatchRequest) -> Result<Vec<ChunkOutcome>> {
        self.enqueue_genai_batch(request).await
    }
}

fn hostname_of(base_url: &str) -> String {
    let rest = base_url.split("://").nth(1).unwrap_or(base_url);
    rest.split('/').next().unwrap_or(rest).to_string()
}
