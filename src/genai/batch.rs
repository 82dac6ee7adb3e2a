//! Batched GenAI path: one combined prompt per chunk group, with
//! recoverable-error retry and per-chunk fallback.
//!
//! A batch rides the same conversation machinery as a single call; the
//! prompt carries segment-count instructions and the response must split
//! back into exactly one fragment per chunk. A known-recoverable failure is
//! retried once as a batch; if that also fails, each chunk goes through the
//! single-request path independently, reusing cache entries where the
//! chunk's hash already resolved.

use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheEntry;
use crate::error::{DispatchError, Result};
use crate::pool::Purpose;
use crate::types::{join_batch_texts, split_batch_response, GenAiBatchRequest, BATCH_SEPARATOR};

use super::{build_translation_prompt, GenAiDriver};

/// Per-chunk result of a batched call.
pub type ChunkOutcome = std::result::Result<String, DispatchError>;

static RECOVERABLE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)Unexpected token\s+200007").expect("token regex"),
        Regex::new(r"(?i)Model Execution Error").expect("model error regex"),
    ]
});

/// Recoverable batch failures: the `R50004` response code, two known
/// transient server message shapes, and a fragment-count mismatch.
pub(crate) fn is_recoverable_batch_error(error: &DispatchError) -> bool {
    if matches!(error, DispatchError::BatchCountMismatch { .. }) {
        return true;
    }
    if let DispatchError::ResponseFailed(code) = error {
        if code.contains("R50004") {
            return true;
        }
    }
    let rendered = error.to_string();
    RECOVERABLE_PATTERNS.iter().any(|re| re.is_match(&rendered))
}

impl GenAiDriver {
    /// Translate a chunk group in one conversation turn.
    #[tracing::instrument(skip(self, request, cancel), fields(provider = %request.provider.id, chunks = request.chunks.len()))]
    pub async fn translate_batch(
        &self,
        request: &GenAiBatchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkOutcome>> {
        if request.chunks.is_empty() {
            return Ok(Vec::new());
        }

        match self.batch_attempt(request, cancel).await {
            Ok(fragments) => Ok(fragments.into_iter().map(Ok).collect()),
            Err(error) if error.is_cancelled() => Err(error),
            Err(error) if is_recoverable_batch_error(&error) => {
                tracing::warn!(error = %error, "Recoverable batch failure, retrying once");
                match self.batch_attempt(request, cancel).await {
                    Ok(fragments) => Ok(fragments.into_iter().map(Ok).collect()),
                    Err(retry_error) if retry_error.is_cancelled() => Err(retry_error),
                    Err(retry_error) => {
                        tracing::warn!(
                            error = %retry_error,
                            "Batch retry failed, falling back to per-chunk requests"
                        );
                        self.fallback_per_chunk(request, cancel).await
                    }
                }
            }
            Err(error) => Err(error),
        }
    }

    async fn batch_attempt(
        &self,
        request: &GenAiBatchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let texts: Vec<&str> = request.chunks.iter().map(|c| c.text.as_str()).collect();
        let body = join_batch_texts(&texts);
        let note = batch_note(request);
        let content = build_translation_prompt(
            &request.lang,
            request.article.as_ref(),
            Some(&note),
            &body,
        );

        let combined = self
            .generate(&request.provider, Purpose::Translate, &content, cancel)
            .await?;

        let fragments = split_batch_response(&combined);
        if fragments.len() != request.chunks.len() {
            return Err(DispatchError::BatchCountMismatch {
                expected: request.chunks.len(),
                got: fragments.len(),
            });
        }
        Ok(fragments)
    }

    /// One single-request call per chunk, in order. Chunks whose hashes
    /// were cached by an earlier attempt resolve without a provider call;
    /// fresh successes are cached immediately so a partial failure keeps
    /// its progress.
    async fn fallback_per_chunk(
        &self,
        request: &GenAiBatchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkOutcome>> {
        let mut outcomes = Vec::with_capacity(request.chunks.len());

        for chunk in &request.chunks {
            if cancel.is_cancelled() {
                outcomes.push(Err(DispatchError::Cancelled("client aborted".into())));
                continue;
            }

            if let Some(hash) = &chunk.hash {
                if let Ok(Some(entry)) = self.cache.get(hash).await {
                    tracing::debug!(hash = %hash, "Fallback chunk served from cache");
                    outcomes.push(Ok(entry.translation));
                    continue;
                }
            }

            let result = self
                .translate(
                    &request.provider,
                    &request.lang,
                    &chunk.text,
                    request.article.as_ref(),
                    cancel,
                )
                .await;

            if let (Ok(text), Some(hash)) = (&result, &chunk.hash) {
                if let Err(error) = self.cache.put(hash, CacheEntry::new(text.clone())).await {
                    tracing::warn!(hash = %hash, error = %error, "Failed to cache fallback chunk");
                }
            }
            outcomes.push(result);
        }

        Ok(outcomes)
    }
}

fn batch_note(request: &GenAiBatchRequest) -> String {
    let mut note = format!(
        "The input holds {} segments separated by the {} token. \
         Translate each segment on its own and return exactly {} translations \
         separated by the same token.",
        request.chunks.len(),
        BATCH_SEPARATOR,
        request.chunks.len()
    );
    if let Some(meta) = request.chunks.iter().find_map(|c| c.chunk.as_ref()) {
        note.push_str(&format!(
            " The segments belong to group {} ({} parts in total).",
            meta.group_id, meta.total
        ));
    }
    note
}
