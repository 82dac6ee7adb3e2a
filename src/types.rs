use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Separator token inserted between batch members. Texts are joined with the
/// token framed by blank lines; responses are split on the bare token and
/// trimmed, so providers may echo it with or without surrounding whitespace.
pub const BATCH_SEPARATOR: &str = "[[SEP]]";

/// Join a list of texts into a single batch payload.
pub fn join_batch_texts<S: AsRef<str>>(texts: &[S]) -> String {
    texts
        .iter()
        .map(|t| t.as_ref())
        .collect::<Vec<_>>()
        .join(&format!("\n\n{}\n\n", BATCH_SEPARATOR))
}

/// Split a combined batch response back into per-task fragments.
pub fn split_batch_response(combined: &str) -> Vec<String> {
    combined
        .split(BATCH_SEPARATOR)
        .map(|fragment| fragment.trim().to_string())
        .collect()
}

/// A unique identifier for one caller-side translation request.
///
/// This is the unit of cancellation: aborting a client request id removes its
/// pending queue entries and aborts any in-flight provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientRequestId(Uuid);

impl ClientRequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ClientRequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ClientRequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for ClientRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = format!("{:x}", self.0.as_u128());
        write!(f, "creq_{}", &hex[..8])
    }
}

/// Browser tab that owns a request; closing the tab cancels every client
/// request registered under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub i32);

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tab_{}", self.0)
    }
}

/// Content-addressed identifier of a translation request: a hash computed by
/// the caller over the cleaned text and the provider fingerprint. Two
/// requests with the same hash must resolve to the same translation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ContentHash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source and target language of a translation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LangConfig {
    /// BCP-47-ish source language code (e.g. "en", "auto").
    pub source: String,
    /// Target language code (e.g. "zh-CN").
    pub target: String,
}

impl LangConfig {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Which pipeline a provider routes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Generic LLM endpoint; requests coalesce in the batch queue.
    Llm,
    /// Stateful conversational GenAI provider with server-side chats.
    GenAi,
    /// Simple providers that take one text per call; no batching.
    Simple,
}

/// Provider identity and connection settings for a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Stable provider identifier, part of the batch key and pool key.
    pub id: String,
    pub kind: ProviderKind,
    /// Base URL of the provider endpoint.
    pub base_url: String,
    /// Model identifier sent with each request.
    pub model: String,
}

/// Position of a snippet within a chunked article section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Group the chunk belongs to (one group per contiguous block).
    pub group_id: String,
    /// 1-based index within the group.
    pub index: u32,
    /// Total number of chunks in the group.
    pub total: u32,
    /// Character count before markup stripping.
    pub raw_chars: u32,
    /// Character count after cleaning.
    pub clean_chars: u32,
    /// Whether inline markup was stripped from the source text.
    pub stripped_markup: bool,
}

/// Page-level context forwarded to providers that accept it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleContext {
    pub title: String,
    pub summary: String,
}

/// One translation request as received by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateRequest {
    /// Cleaned, post-normalization source text.
    pub text: String,
    pub lang: LangConfig,
    pub provider: ProviderConfig,
    /// Content hash over cleaned text + provider fingerprint, when the
    /// caller wants caching and dedupe.
    pub hash: Option<ContentHash>,
    /// Earliest wall-clock time the request may be dispatched.
    pub schedule_at: DateTime<Utc>,
    pub article: Option<ArticleContext>,
    pub chunk: Option<ChunkMetadata>,
    pub client_request_id: ClientRequestId,
    pub tab_id: Option<TabId>,
}

/// One member of a batched GenAI request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenAiChunk {
    pub text: String,
    pub hash: Option<ContentHash>,
    pub chunk: Option<ChunkMetadata>,
}

/// A batched GenAI request as received by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenAiBatchRequest {
    pub chunks: Vec<GenAiChunk>,
    pub lang: LangConfig,
    pub provider: ProviderConfig,
    pub schedule_at: DateTime<Utc>,
    pub client_request_id: ClientRequestId,
    pub tab_id: Option<TabId>,
    pub article: Option<ArticleContext>,
}

/// Deterministic key over `(source, target, provider)` used to coalesce
/// batchable tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchKey {
    pub source: String,
    pub target: String,
    pub provider_id: String,
}

impl BatchKey {
    pub fn for_request(lang: &LangConfig, provider: &ProviderConfig) -> Self {
        Self {
            source: lang.source.clone(),
            target: lang.target.clone(),
            provider_id: provider.id.clone(),
        }
    }
}

impl std::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.target, self.provider_id)
    }
}
