//! Conversational GenAI driver.
//!
//! Each call runs a bounded recovery state machine over a pooled chat:
//! reconcile any suspect in-flight turn, send the user message (waiting once
//! for a busy parent), stream the assistant reply, then poll the final
//! content. Server-side conversational faults reset the chat (remote delete
//! + local invalidate) and the call starts over on a fresh slot, up to
//! `max_recovery_attempts` times.

pub mod batch;
pub mod client;

pub use batch::ChunkOutcome;
pub use client::GenAiClient;

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::TranslationCache;
use crate::config::GenAiConfig;
use crate::error::{DispatchError, Result};
use crate::http::HttpClient;
use crate::pool::{create_chat_fn, ChatLease, ChatPool, PoolKey, Purpose};
use crate::sse::{
    decode_assistant_stream, extract_content, extract_response_code, extract_status,
    is_completion_status, is_failure_status, StreamOutcome,
};
use crate::types::{ArticleContext, LangConfig, ProviderConfig};

/// Driver over the conversational GenAI protocol.
#[derive(Clone)]
pub struct GenAiDriver {
    http: Arc<dyn HttpClient>,
    pool: ChatPool,
    config: GenAiConfig,
    cache: TranslationCache,
}

struct PollOutcome {
    text: String,
    completed: bool,
}

enum TurnOutcome {
    Done(String),
    /// Recoverable conversational fault: reset the chat and run the next
    /// recovery attempt.
    Reset,
    /// Terminal for this call; `reset` controls whether the slot is
    /// poisoned or released for reuse.
    Fail { error: DispatchError, reset: bool },
}

impl GenAiDriver {
    pub fn new(
        http: Arc<dyn HttpClient>,
        pool: ChatPool,
        config: GenAiConfig,
        cache: TranslationCache,
    ) -> Self {
        Self {
            http,
            pool,
            config,
            cache,
        }
    }

    pub fn pool(&self) -> &ChatPool {
        &self.pool
    }

    pub fn client_for(&self, provider: &ProviderConfig) -> GenAiClient {
        GenAiClient::new(
            self.http.clone(),
            provider.base_url.clone(),
            self.config.request_timeout_ms,
        )
    }

    pub fn pool_key(provider: &ProviderConfig, purpose: Purpose) -> PoolKey {
        PoolKey {
            provider_id: provider.id.clone(),
            purpose,
            base_url: provider.base_url.clone(),
        }
    }

    /// Translate one text through a pooled conversation.
    pub async fn translate(
        &self,
        provider: &ProviderConfig,
        lang: &LangConfig,
        text: &str,
        article: Option<&ArticleContext>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let content = build_translation_prompt(lang, article, None, text);
        self.generate(provider, Purpose::Translate, &content, cancel)
            .await
    }

    /// Run one generation call with chat recovery.
    #[tracing::instrument(skip(self, content, cancel), fields(provider = %provider.id, purpose = %purpose))]
    pub async fn generate(
        &self,
        provider: &ProviderConfig,
        purpose: Purpose,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let client = self.client_for(provider);
        let pool_key = Self::pool_key(provider, purpose);
        let create = {
            let client = client.clone();
            create_chat_fn(move || {
                let client = client.clone();
                async move { client.create_chat().await }
            })
        };

        for attempt in 0..self.config.max_recovery_attempts {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled("client aborted".into()));
            }

            let mut lease = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(DispatchError::Cancelled("client aborted".into()));
                }
                lease = self.pool.acquire(pool_key.clone(), create.clone()) => lease?,
            };

            match self.run_turn(&client, &mut lease, provider, content, cancel).await {
                TurnOutcome::Done(text) => {
                    lease.release().await;
                    return Ok(text);
                }
                TurnOutcome::Reset => {
                    tracing::info!(attempt, "Resetting chat after conversational fault");
                    self.reset_chat(&client, lease).await;
                }
                TurnOutcome::Fail { error, reset } => {
                    if reset {
                        self.reset_chat(&client, lease).await;
                    } else {
                        lease.release().await;
                    }
                    return Err(error);
                }
            }
        }

        Err(DispatchError::ExhaustedRecovery)
    }

    /// Remote delete is best-effort and never awaited on the failure path.
    async fn reset_chat(&self, client: &GenAiClient, lease: ChatLease) {
        let chat_id = lease.chat_id().to_string();
        lease.invalidate().await;

        let client = client.clone();
        tokio::spawn(async move {
            if let Err(error) = client.delete_chats(&[chat_id.clone()]).await {
                tracing::debug!(chat_id = %chat_id, error = %error, "Remote chat delete failed");
            }
        });
    }

    async fn run_turn(
        &self,
        client: &GenAiClient,
        lease: &mut ChatLease,
        provider: &ProviderConfig,
        content: &str,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        // A pending id on a freshly acquired slot means a previous session
        // died mid-turn; the slot is suspect until that turn settles.
        if let Some(pending) = lease.pending_message_id().map(String::from) {
            match self.wait_for_completion(client, &pending, cancel).await {
                Ok(true) => lease.set_pending_message_id(None).await,
                Ok(false) => return TurnOutcome::Reset,
                Err(error) if error.is_cancelled() => {
                    return TurnOutcome::Fail { error, reset: true };
                }
                Err(_) => return TurnOutcome::Reset,
            }
        }

        let mut parent_wait_attempted = false;
        loop {
            let parent = lease.parent_message_id().map(String::from);

            let send = tokio::select! {
                _ = cancel.cancelled() => {
                    return TurnOutcome::Fail {
                        error: DispatchError::Cancelled("client aborted".into()),
                        reset: true,
                    };
                }
                result = client.send_message(lease.chat_id(), content, parent.as_deref()) => result,
            };

            let user_id = match send {
                Ok(id) => id,
                Err(DispatchError::PendingResponse) => {
                    if let Some(parent_id) = parent.as_ref().filter(|_| !parent_wait_attempted) {
                        tracing::debug!(parent = %parent_id, "Parent busy, waiting for completion");
                        let _ = self.wait_for_completion(client, parent_id, cancel).await;
                        if cancel.is_cancelled() {
                            return TurnOutcome::Fail {
                                error: DispatchError::Cancelled("client aborted".into()),
                                reset: true,
                            };
                        }
                        parent_wait_attempted = true;
                        continue;
                    }
                    return TurnOutcome::Reset;
                }
                Err(error) => return fail_for(error),
            };

            lease.set_pending_message_id(Some(user_id.clone())).await;

            let stream = match self
                .await_assistant_stream(client, &user_id, &provider.model, cancel)
                .await
            {
                Ok(outcome) => outcome,
                Err(error) if error.is_cancelled() => {
                    spawn_cancel(client, &user_id);
                    return TurnOutcome::Fail { error, reset: true };
                }
                Err(error @ DispatchError::StreamMissingId) => {
                    // The chat itself may be healthy; the pending turn is
                    // reconciled on the next acquire.
                    return TurnOutcome::Fail {
                        error,
                        reset: false,
                    };
                }
                Err(error) => return fail_for(error),
            };

            let poll = self
                .poll_message_content(client, &stream.response_id, &stream.fallback_content, cancel)
                .await;

            return match poll {
                Ok(PollOutcome {
                    text,
                    completed: true,
                }) => {
                    lease.set_pending_message_id(None).await;
                    lease
                        .set_parent_message_id(Some(stream.response_id.clone()))
                        .await;
                    TurnOutcome::Done(normalize_reply(&text))
                }
                // A streamed-but-unconfirmed reply leaves the conversation
                // in an unknown state.
                Ok(PollOutcome {
                    completed: false, ..
                }) => TurnOutcome::Reset,
                Err(error) if error.is_cancelled() => {
                    spawn_cancel(client, &user_id);
                    TurnOutcome::Fail { error, reset: true }
                }
                Err(error @ DispatchError::ResponseFailed(_)) => {
                    TurnOutcome::Fail { error, reset: true }
                }
                Err(error) => fail_for(error),
            };
        }
    }

    async fn await_assistant_stream(
        &self,
        client: &GenAiClient,
        user_message_id: &str,
        model_id: &str,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome> {
        let stream = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(DispatchError::Cancelled("client aborted".into()));
            }
            stream = client.open_response_stream(user_message_id, model_id) => stream?,
        };

        let deadline = Duration::from_millis(self.config.stream_timeout_ms);
        match tokio::time::timeout(deadline, decode_assistant_stream(stream, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(self.config.stream_timeout_ms)),
        }
    }

    /// Whether the given message reached completion within the poll budget.
    async fn wait_for_completion(
        &self,
        client: &GenAiClient,
        message_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        match self.poll_message_content(client, message_id, "", cancel).await {
            Ok(outcome) => Ok(outcome.completed),
            Err(error) if error.is_cancelled() => Err(error),
            Err(_) => Ok(false),
        }
    }

    /// Poll `GET /messages/{id}` with bounded backoff until the message
    /// completes, fails, disappears, or the budget runs out. Fallback text
    /// stands in when the server has no content to give.
    async fn poll_message_content(
        &self,
        client: &GenAiClient,
        message_id: &str,
        fallback: &str,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome> {
        let started = tokio::time::Instant::now();
        let budget = Duration::from_millis(self.config.poll_timeout_ms);
        let mut attempt: u32 = 0;

        loop {
            let delay = self.config.poll_delay(attempt);
            if started.elapsed() + delay > budget {
                return if fallback.is_empty() {
                    Err(DispatchError::Timeout(self.config.poll_timeout_ms))
                } else {
                    Ok(PollOutcome {
                        text: fallback.to_string(),
                        completed: false,
                    })
                };
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(DispatchError::Cancelled("client aborted".into()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;

            let response = match client.get_message(message_id).await {
                Ok(response) => response,
                Err(error) => {
                    tracing::debug!(error = %error, "Message poll attempt failed");
                    continue;
                }
            };

            if response.status == 404 || response.status == 410 {
                // Deleted out from under us.
                return if fallback.is_empty() {
                    Err(DispatchError::Status {
                        status: response.status,
                        body: response.body,
                    })
                } else {
                    Ok(PollOutcome {
                        text: fallback.to_string(),
                        completed: false,
                    })
                };
            }
            if !response.is_success() {
                tracing::debug!(status = response.status, "Message poll returned an error status");
                continue;
            }

            let value: Value = match serde_json::from_str(&response.body) {
                Ok(value) => value,
                Err(_) => continue,
            };
            let payload = value.get("data").unwrap_or(&value);

            if let Some(code) = extract_response_code(payload) {
                if is_failure_status(&code) {
                    return Err(DispatchError::ResponseFailed(code));
                }
            }

            let Some(status) = extract_status(payload) else {
                continue;
            };
            if is_failure_status(&status) {
                return Err(DispatchError::ResponseFailed(status));
            }
            if is_completion_status(&status) {
                let content = extract_content(payload).unwrap_or("");
                let text = if content.is_empty() {
                    fallback.to_string()
                } else {
                    content.to_string()
                };
                if text.is_empty() {
                    return Err(DispatchError::InvalidPayload(
                        "completed message carried no content".into(),
                    ));
                }
                return Ok(PollOutcome {
                    text,
                    completed: true,
                });
            }
            // Still processing.
        }
    }
}

fn fail_for(error: DispatchError) -> TurnOutcome {
    let reset = match &error {
        // Auth loss or a vanished chat poisons the slot.
        DispatchError::Status { status, .. } => matches!(*status, 401 | 403 | 404 | 410),
        DispatchError::Cancelled(_) => true,
        _ => false,
    };
    TurnOutcome::Fail { error, reset }
}

/// Fire the server-side cancel without awaiting it.
fn spawn_cancel(client: &GenAiClient, user_message_id: &str) {
    let client = client.clone();
    let id = user_message_id.to_string();
    tokio::spawn(async move {
        if let Err(error) = client.cancel_response(&id).await {
            tracing::debug!(message_id = %id, error = %error, "Stream cancel request failed");
        }
    });
}

fn normalize_reply(text: &str) -> String {
    text.trim().to_string()
}

/// Prompt shared by the single and batched paths. `batch_note` carries the
/// segment-count instructions for combined payloads.
pub(crate) fn build_translation_prompt(
    lang: &LangConfig,
    article: Option<&ArticleContext>,
    batch_note: Option<&str>,
    body: &str,
) -> String {
    let mut prompt = format!(
        "Translate the text after the blank line from {} into {}. \
         Reply with the translation only, preserving the line structure.",
        lang.source, lang.target
    );
    if let Some(article) = article {
        prompt.push_str(&format!(
            "\nPage context: {} — {}",
            article.title, article.summary
        ));
    }
    if let Some(note) = batch_note {
        prompt.push('\n');
        prompt.push_str(note);
    }
    prompt.push_str("\n\n");
    prompt.push_str(body);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpResponse, MockHttpClient};
    use crate::store::{KeyValueStore, MemoryStore};
    use crate::types::ProviderKind;

    fn provider() -> ProviderConfig {
        ProviderConfig {
            id: "genai".into(),
            kind: ProviderKind::GenAi,
            base_url: "https://genai.example.com".into(),
            model: "model-1".into(),
        }
    }

    fn config() -> GenAiConfig {
        GenAiConfig {
            max_slots_per_key: 2,
            idle_ttl_ms: 600_000,
            max_recovery_attempts: 3,
            poll_base_interval_ms: 5,
            poll_max_backoff_multiplier: 3,
            poll_timeout_ms: 300,
            request_timeout_ms: 1_000,
            stream_timeout_ms: 1_000,
        }
    }

    async fn driver(mock: &MockHttpClient) -> GenAiDriver {
        let store = MemoryStore::shared();
        let pool = ChatPool::load(store.clone(), 2, Duration::from_secs(600))
            .await
            .unwrap();
        GenAiDriver::new(
            Arc::new(mock.clone()),
            pool,
            config(),
            TranslationCache::new(store),
        )
    }

    /// Script one full successful turn: send → stream → poll.
    fn enqueue_turn(mock: &MockHttpClient, user_id: &str, assistant_id: &str, reply: &str) {
        mock.add_json(
            "POST /api/chat/v1/messages",
            &format!(r#"{{"guid":"{}"}}"#, user_id),
        );
        mock.add_stream(
            "POST /api/chat/v1/messages-response",
            vec![format!(
                "data: {{\"guid\":\"{}\",\"event_status\":\"FINAL_ANSWER\"}}\n\n",
                assistant_id
            )],
        );
        mock.add_json(
            &format!("GET /api/chat/v1/messages/{}", assistant_id),
            &format!(r#"{{"status":"COMPLETED","content":"{}"}}"#, reply),
        );
    }

    #[tokio::test]
    async fn successful_turn_chains_the_parent_id() {
        let mock = MockHttpClient::new();
        mock.add_json("POST /api/chat/v1/chats", r#"{"guid":"chat-1"}"#);
        enqueue_turn(&mock, "u-1", "a-1", "你好");
        enqueue_turn(&mock, "u-2", "a-2", "世界");

        let driver = driver(&mock).await;
        let cancel = CancellationToken::new();
        let lang = LangConfig::new("en", "zh-CN");

        let first = driver
            .translate(&provider(), &lang, "hello", None, &cancel)
            .await
            .unwrap();
        assert_eq!(first, "你好");

        let second = driver
            .translate(&provider(), &lang, "world", None, &cancel)
            .await
            .unwrap();
        assert_eq!(second, "世界");

        // One chat for both turns, and the second user turn carried the
        // first assistant id as its parent.
        assert_eq!(mock.calls_to("/api/chat/v1/chats"), 1);
        let sends: Vec<_> = mock
            .calls()
            .into_iter()
            .filter(|c| c.path == "/api/chat/v1/messages" && c.method == "POST")
            .collect();
        assert_eq!(sends.len(), 2);
        assert!(!sends[0]
            .body
            .as_deref()
            .unwrap()
            .contains("parentMessageGuid"));
        assert!(sends[1]
            .body
            .as_deref()
            .unwrap()
            .contains("\"parentMessageGuid\":\"a-1\""));
    }

    #[tokio::test]
    async fn parent_busy_waits_once_then_succeeds() {
        let mock = MockHttpClient::new();
        mock.add_json("POST /api/chat/v1/chats", r#"{"guid":"chat-1"}"#);
        // Establish a parent with one successful turn.
        enqueue_turn(&mock, "u-1", "a-1", "first");

        // Second call: the send is rejected with CHAT_ERROR_4 once.
        mock.add_response(
            "POST /api/chat/v1/messages",
            Ok(HttpResponse {
                status: 422,
                body: r#"{"errorCode":"CHAT_ERROR_4"}"#.to_string(),
            }),
        );
        // The driver waits for the busy parent to complete...
        mock.add_json(
            "GET /api/chat/v1/messages/a-1",
            r#"{"status":"COMPLETED","content":"first"}"#,
        );
        // ...then retries the send and the turn goes through.
        enqueue_turn(&mock, "u-2", "a-2", "second");

        let driver = driver(&mock).await;
        let cancel = CancellationToken::new();
        let lang = LangConfig::new("en", "fr");

        driver
            .translate(&provider(), &lang, "one", None, &cancel)
            .await
            .unwrap();
        let result = driver
            .translate(&provider(), &lang, "two", None, &cancel)
            .await
            .unwrap();
        assert_eq!(result, "second");

        // No chat reset happened: one chat created, nothing deleted.
        assert_eq!(mock.calls_to("/api/chat/v1/chats"), 1);
        assert!(!mock
            .calls()
            .iter()
            .any(|c| c.method == "DELETE" && c.path == "/api/chat/v1/chats"));
    }

    #[tokio::test]
    async fn parent_busy_without_parent_resets_until_exhausted() {
        let mock = MockHttpClient::new();
        for n in 0..3 {
            let body = format!(r#"{{"guid":"chat-{}"}}"#, n);
            mock.add_json("POST /api/chat/v1/chats", &body);
            mock.add_response(
                "POST /api/chat/v1/messages",
                Ok(HttpResponse {
                    status: 422,
                    body: r#"{"errorCode":"CHAT_ERROR_4"}"#.to_string(),
                }),
            );
            mock.add_json("DELETE /api/chat/v1/chats", "{}");
        }

        let driver = driver(&mock).await;
        let result = driver
            .translate(
                &provider(),
                &LangConfig::new("en", "de"),
                "text",
                None,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result, Err(DispatchError::ExhaustedRecovery));

        let creates = mock
            .calls()
            .iter()
            .filter(|c| c.method == "POST" && c.path == "/api/chat/v1/chats")
            .count();
        assert_eq!(creates, 3);

        // Remote deletes are fired without being awaited; give them a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let deletes = mock
            .calls()
            .iter()
            .filter(|c| c.method == "DELETE" && c.path == "/api/chat/v1/chats")
            .count();
        assert_eq!(deletes, 3);
    }

    #[tokio::test]
    async fn failed_poll_status_resets_the_chat_and_surfaces() {
        let mock = MockHttpClient::new();
        mock.add_json("POST /api/chat/v1/chats", r#"{"guid":"chat-1"}"#);
        mock.add_json("POST /api/chat/v1/messages", r#"{"guid":"u-1"}"#);
        mock.add_stream(
            "POST /api/chat/v1/messages-response",
            vec!["data: {\"guid\":\"a-1\",\"event_status\":\"FINAL_ANSWER\"}\n\n"],
        );
        mock.add_json(
            "GET /api/chat/v1/messages/a-1",
            r#"{"status":"FAILED","responseCode":"R50001"}"#,
        );
        mock.add_json("DELETE /api/chat/v1/chats", "{}");

        let driver = driver(&mock).await;
        let result = driver
            .translate(
                &provider(),
                &LangConfig::new("en", "es"),
                "text",
                None,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(DispatchError::ResponseFailed(_))));

        // The poisoned chat was deleted remotely.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(mock
            .calls()
            .iter()
            .any(|c| c.method == "DELETE" && c.path == "/api/chat/v1/chats"));
    }

    #[tokio::test]
    async fn empty_poll_content_uses_stream_fallback() {
        let mock = MockHttpClient::new();
        mock.add_json("POST /api/chat/v1/chats", r#"{"guid":"chat-1"}"#);
        mock.add_json("POST /api/chat/v1/messages", r#"{"guid":"u-1"}"#);
        mock.add_stream(
            "POST /api/chat/v1/messages-response",
            vec![
                "data: {\"guid\":\"a-1\",\"event_status\":\"CHUNK\",\"content\":\"streamed \"}\n\n",
                "data: {\"guid\":\"a-1\",\"event_status\":\"CHUNK\",\"content\":\"reply\"}\n\n",
                "data: {\"guid\":\"a-1\",\"event_status\":\"FINAL_ANSWER\"}\n\n",
            ],
        );
        mock.add_json(
            "GET /api/chat/v1/messages/a-1",
            r#"{"status":"COMPLETED","content":""}"#,
        );

        let driver = driver(&mock).await;
        let result = driver
            .translate(
                &provider(),
                &LangConfig::new("en", "ja"),
                "text",
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result, "streamed reply");
    }

    #[tokio::test]
    async fn hydrated_pending_turn_is_reconciled_before_sending() {
        let store = MemoryStore::shared();
        let persisted = serde_json::json!({
            "genai:translate:https://genai.example.com": {
                "slots": [{
                    "chat_id": "chat-old",
                    "last_used": chrono::Utc::now(),
                    "parent_message_id": "a-0",
                    "pending_message_id": "u-0",
                    "pending_since": chrono::Utc::now()
                }]
            }
        });
        store
            .set(crate::pool::POOL_STORE_KEY, persisted.to_string())
            .await
            .unwrap();

        let mock = MockHttpClient::new();
        // Reconciliation poll for the suspect turn.
        mock.add_json(
            "GET /api/chat/v1/messages/u-0",
            r#"{"status":"COMPLETED","content":"stale"}"#,
        );
        enqueue_turn(&mock, "u-1", "a-1", "fresh");

        let pool = ChatPool::load(store.clone(), 2, Duration::from_secs(600))
            .await
            .unwrap();
        let driver = GenAiDriver::new(
            Arc::new(mock.clone()),
            pool,
            config(),
            TranslationCache::new(store),
        );

        let result = driver
            .translate(
                &provider(),
                &LangConfig::new("en", "ko"),
                "text",
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result, "fresh");
        // No new chat was created: the hydrated slot carried the turn.
        assert_eq!(mock.calls_to("/api/chat/v1/chats"), 0);
        // The suspect message was reconciled first.
        assert_eq!(mock.calls()[0].path, "/api/chat/v1/messages/u-0");
    }

    #[tokio::test]
    async fn cancellation_during_poll_fires_the_cancel_endpoint() {
        let mock = MockHttpClient::new();
        mock.add_json("POST /api/chat/v1/chats", r#"{"guid":"chat-1"}"#);
        mock.add_json("POST /api/chat/v1/messages", r#"{"guid":"u-1"}"#);
        // Stream ends with only an id; the driver moves on to polling,
        // where no responses are configured, so it keeps polling until the
        // cancel fires.
        mock.add_stream(
            "POST /api/chat/v1/messages-response",
            vec!["data: {\"guid\":\"a-1\",\"event_status\":\"CHUNK\",\"content\":\"x\"}\n\n"],
        );
        mock.add_json("POST /api/chat/v1/messages-response/cancel", "{}");
        mock.add_json("DELETE /api/chat/v1/chats", "{}");

        let driver = driver(&mock).await;
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            canceller.cancel();
        });

        let result = driver
            .translate(
                &provider(),
                &LangConfig::new("en", "it"),
                "text",
                None,
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(DispatchError::Cancelled(_))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let calls = mock.calls();
        let cancel_call = calls
            .iter()
            .find(|c| c.path == "/api/chat/v1/messages-response/cancel")
            .expect("cancel endpoint called");
        assert!(cancel_call
            .body
            .as_deref()
            .unwrap()
            .contains("\"messageGuid\":\"u-1\""));
        // Abort is a reset condition: the chat was deleted too.
        assert!(calls
            .iter()
            .any(|c| c.method == "DELETE" && c.path == "/api/chat/v1/chats"));
    }
}
