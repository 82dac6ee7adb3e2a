//! Generic LLM translation backend.
//!
//! Speaks the common chat-completions shape: one POST per payload, the
//! translation instructions in the system message, the (possibly
//! separator-joined) text as the user message.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{DispatchError, Result};
use crate::http::{HttpClient, HttpRequest};
use crate::types::{ArticleContext, LangConfig, ProviderConfig, BATCH_SEPARATOR};

/// Stateless translation provider invocation; implemented by the LLM
/// backend and by test doubles.
#[async_trait]
pub trait TranslationBackend: Send + Sync {
    async fn translate(
        &self,
        provider: &ProviderConfig,
        lang: &LangConfig,
        article: Option<&ArticleContext>,
        payload: &str,
    ) -> Result<String>;
}

pub struct LlmBackend {
    http: Arc<dyn HttpClient>,
    timeout_ms: u64,
}

impl LlmBackend {
    pub fn new(http: Arc<dyn HttpClient>, timeout_ms: u64) -> Self {
        Self { http, timeout_ms }
    }

    fn system_prompt(lang: &LangConfig, article: Option<&ArticleContext>) -> String {
        let mut prompt = format!(
            "You are a translation engine. Translate the user's text from {} into {}. \
             Reply with the translation only. When the input contains {} tokens, keep \
             them in place and translate each segment independently.",
            lang.source, lang.target, BATCH_SEPARATOR
        );
        if let Some(article) = article {
            prompt.push_str(&format!(
                " Page context: {} — {}",
                article.title, article.summary
            ));
        }
        prompt
    }
}

#[async_trait]
impl TranslationBackend for LlmBackend {
    #[tracing::instrument(skip(self, lang, article, payload), fields(provider = %provider.id, payload_len = payload.len()))]
    async fn translate(
        &self,
        provider: &ProviderConfig,
        lang: &LangConfig,
        article: Option<&ArticleContext>,
        payload: &str,
    ) -> Result<String> {
        let body = json!({
            "model": provider.model,
            "messages": [
                { "role": "system", "content": Self::system_prompt(lang, article) },
                { "role": "user", "content": payload },
            ],
        })
        .to_string();

        let url = format!(
            "{}/v1/chat/completions",
            provider.base_url.trim_end_matches('/')
        );
        let request = HttpRequest::new("POST", url).with_json_body(body);
        let response = self.http.execute(&request, self.timeout_ms).await?;

        if !response.is_success() {
            return Err(DispatchError::Status {
                status: response.status,
                body: response.body,
            });
        }

        let value: Value = serde_json::from_str(&response.body)?;
        let content = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DispatchError::InvalidPayload("completion response had no content".into())
            })?;

        Ok(content.trim().to_string())
    }
}
