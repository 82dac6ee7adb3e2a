//! Translation dispatch core for an immersive page-translation system.
//!
//! This crate receives text snippets from many concurrent producers and
//! routes them through provider-specific pipelines:
//! - A token-bucket scheduler and request queue with dedupe-by-hash,
//!   timeouts, and retry with exponential backoff
//! - A batch queue that coalesces tasks under character/item budgets and
//!   falls back to individual requests when a batch fails
//! - A stateful conversational GenAI driver: pooled server-side chats with
//!   parent-message chaining, an SSE reply decoder, follow-up polling, and
//!   fault recovery by chat reset
//! - A per-client cancellation graph that propagates tab-close and
//!   user-abort signals into every pending and in-flight piece of work
//!
//! Network transport and persistence are injected ([`HttpClient`],
//! [`KeyValueStore`]), so the whole core runs against mocks in tests.
//!
//! # Example
//! ```ignore
//! use dragoman::{Dispatcher, DispatcherConfig, MemoryStore, ReqwestHttpClient};
//!
//! let dispatcher = Dispatcher::new(
//!     Arc::new(ReqwestHttpClient::new()),
//!     MemoryStore::shared(),
//!     DispatcherConfig::default(),
//! )
//! .await?;
//!
//! let translated = dispatcher.enqueue_translate_request(request).await?;
//! ```

pub mod aggregator;
pub mod batch;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod genai;
pub mod http;
pub mod llm;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod sse;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use aggregator::{AggregatorConfig, BatchAggregator, BatchContext, BatchSink};
pub use batch::{BatchExecutor, BatchQueue, BatchTask};
pub use cache::{CacheEntry, ChunkMetrics, TranslationCache};
pub use config::{BatchConfig, BatchConfigPatch, GenAiConfig, QueueConfig, QueueConfigPatch};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{DispatchError, Result};
pub use genai::{ChunkOutcome, GenAiClient, GenAiDriver};
pub use http::{HttpClient, HttpRequest, HttpResponse, MockHttpClient, ReqwestHttpClient};
pub use llm::{LlmBackend, TranslationBackend};
pub use pool::{ChatLease, ChatPool, PoolKey, Purpose};
pub use queue::RequestQueue;
pub use registry::{ClientRegistry, RequestGuard};
pub use scheduler::{task_fn, Scheduler};
pub use sse::{decode_assistant_stream, StreamOutcome};
pub use store::{KeyValueStore, MemoryStore};
pub use types::{
    ArticleContext, BatchKey, ChunkMetadata, ClientRequestId, ContentHash, GenAiBatchRequest,
    GenAiChunk, LangConfig, ProviderConfig, ProviderKind, TabId, TranslateRequest,
};
