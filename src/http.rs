//! HTTP client abstraction for the dispatch core.
//!
//! The network transport is an injected collaborator: everything above this
//! module speaks [`HttpClient`], so provider drivers are testable against
//! [`MockHttpClient`] without real network calls. [`ReqwestHttpClient`] is
//! the production implementation, with a cookie store for providers that use
//! session auth.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;

use crate::error::{DispatchError, Result};

/// Stream of body bytes from a streaming (SSE) response.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// A request to a provider endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// HTTP method (e.g. "POST", "GET", "DELETE").
    pub method: String,
    /// Absolute URL.
    pub url: String,
    /// JSON body, when the method carries one.
    pub body: Option<String>,
    /// Extra headers beyond Content-Type.
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn with_json_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Path portion of the URL (used as the mock routing key).
    pub fn path(&self) -> &str {
        let rest = match self.url.find("://") {
            Some(idx) => &self.url[idx + 3..],
            None => &self.url,
        };
        match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => "/",
        }
    }
}

/// Response from a provider endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body as a string.
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Trait for executing HTTP requests.
///
/// Implementations must be safe to share across tasks; callers hold them
/// behind an `Arc<dyn HttpClient>`.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Execute a request and buffer the full response body.
    async fn execute(&self, request: &HttpRequest, timeout_ms: u64) -> Result<HttpResponse>;

    /// Execute a request whose response body is consumed incrementally
    /// (server-sent events). `timeout_ms` bounds connection setup and
    /// response headers only; reading the stream is bounded by the caller.
    async fn execute_stream(&self, request: &HttpRequest, timeout_ms: u64) -> Result<ByteStream>;
}

// ============================================================================
// Production implementation using reqwest
// ============================================================================

/// Production HTTP client backed by reqwest, with a cookie store so that
/// session-authenticated providers keep their login across calls.
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .cookie_store(true)
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    fn build(&self, request: &HttpRequest) -> Result<reqwest::RequestBuilder> {
        let method: reqwest::Method = request
            .method
            .parse()
            .map_err(|_| DispatchError::Internal(format!("invalid method {}", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder
                .header("Content-Type", "application/json")
                .body(body.clone());
        }
        Ok(builder)
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn execute(&self, request: &HttpRequest, timeout_ms: u64) -> Result<HttpResponse> {
        let builder = self
            .build(request)?
            .timeout(Duration::from_millis(timeout_ms));

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout(timeout_ms)
            } else {
                DispatchError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await?;

        tracing::debug!(status, body_len = body.len(), "HTTP request completed");

        Ok(HttpResponse { status, body })
    }

    #[tracing::instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn execute_stream(&self, request: &HttpRequest, timeout_ms: u64) -> Result<ByteStream> {
        // No per-request timeout here: reqwest's timeout covers the whole
        // body, which would cut long-lived event streams. Header arrival is
        // bounded explicitly instead.
        let builder = self
            .build(request)?
            .header("Accept", "text/event-stream");

        let response = tokio::time::timeout(Duration::from_millis(timeout_ms), builder.send())
            .await
            .map_err(|_| DispatchError::Timeout(timeout_ms))?
            .map_err(DispatchError::from)?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Status { status, body });
        }

        tracing::debug!(status, "Event stream opened");

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| DispatchError::Transport(e.to_string())));
        Ok(stream.boxed())
    }
}

// ============================================================================
// Test/mock implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Record of a call made to the mock HTTP client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub method: String,
    pub url: String,
    pub path: String,
    pub body: Option<String>,
    pub streaming: bool,
}

/// Mock HTTP client for tests.
///
/// Responses are keyed by `"{method} {path}"` and returned in FIFO order;
/// streaming endpoints are scripted as chunk sequences. Every call is
/// recorded for assertions.
#[derive(Clone, Default)]
pub struct MockHttpClient {
    responses: Arc<Mutex<HashMap<String, Vec<Result<HttpResponse>>>>>,
    stream_responses: Arc<Mutex<HashMap<String, Vec<Result<Vec<Bytes>>>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a buffered response for `"{method} {path}"`.
    pub fn add_response(&self, key: &str, response: Result<HttpResponse>) {
        self.responses
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(response);
    }

    /// Queue a JSON 200 response for `"{method} {path}"`.
    pub fn add_json(&self, key: &str, body: &str) {
        self.add_response(
            key,
            Ok(HttpResponse {
                status: 200,
                body: body.to_string(),
            }),
        );
    }

    /// Queue a scripted event-stream for `"{method} {path}"`; each element
    /// arrives as one chunk.
    pub fn add_stream<S: Into<String>>(&self, key: &str, chunks: Vec<S>) {
        let chunks = chunks
            .into_iter()
            .map(|c| Bytes::from(c.into().into_bytes()))
            .collect();
        self.stream_responses
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(Ok(chunks));
    }

    /// Queue a failure when opening the stream for `"{method} {path}"`.
    pub fn add_stream_error(&self, key: &str, error: DispatchError) {
        self.stream_responses
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(Err(error));
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of calls whose path matched the given prefix.
    pub fn calls_to(&self, path_prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.path.starts_with(path_prefix))
            .count()
    }

    fn record(&self, request: &HttpRequest, streaming: bool) {
        self.calls.lock().push(MockCall {
            method: request.method.clone(),
            url: request.url.clone(),
            path: request.path().to_string(),
            body: request.body.clone(),
            streaming,
        });
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: &HttpRequest, _timeout_ms: u64) -> Result<HttpResponse> {
        self.record(request, false);

        let key = format!("{} {}", request.method, request.path());
        let mut responses = self.responses.lock();
        if let Some(queue) = responses.get_mut(&key) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }

        Err(DispatchError::Internal(format!(
            "no mock response configured for {}",
            key
        )))
    }

    async fn execute_stream(&self, request: &HttpRequest, _timeout_ms: u64) -> Result<ByteStream> {
        self.record(request, true);

        let key = format!("{} {}", request.method, request.path());
        let mut responses = self.stream_responses.lock();
        if let Some(queue) = responses.get_mut(&key) {
            if !queue.is_empty() {
                let chunks = queue.remove(0)?;
                return Ok(stream::iter(chunks.into_iter().map(Ok)).boxed());
            }
        }

        Err(DispatchError::Internal(format!(
            "no mock stream configured for {}",
            key
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_extraction() {
        let request = HttpRequest::new("GET", "https://host.example.com/api/chat/v1/chats");
        assert_eq!(request.path(), "/api/chat/v1/chats");

        let bare = HttpRequest::new("GET", "https://host.example.com");
        assert_eq!(bare.path(), "/");
    }

    #[tokio::test]
    async fn mock_returns_responses_in_fifo_order() {
        let mock = MockHttpClient::new();
        mock.add_json("GET /status", r#"{"n":1}"#);
        mock.add_json("GET /status", r#"{"n":2}"#);

        let request = HttpRequest::new("GET", "https://api.example.com/status");
        let first = mock.execute(&request, 1_000).await.unwrap();
        let second = mock.execute(&request, 1_000).await.unwrap();

        assert_eq!(first.body, r#"{"n":1}"#);
        assert_eq!(second.body, r#"{"n":2}"#);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn mock_unconfigured_path_errors() {
        let mock = MockHttpClient::new();
        let request = HttpRequest::new("POST", "https://api.example.com/unknown");
        assert!(mock.execute(&request, 1_000).await.is_err());
    }

    #[tokio::test]
    async fn mock_stream_yields_scripted_chunks() {
        let mock = MockHttpClient::new();
        mock.add_stream("POST /events", vec!["data: one\n\n", "data: two\n\n"]);

        let request = HttpRequest::new("POST", "https://api.example.com/events");
        let mut stream = mock.execute_stream(&request, 1_000).await.unwrap();

        let mut collected = String::new();
        while let Some(chunk) = stream.next().await {
            collected.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
        }
        assert_eq!(collected, "data: one\n\ndata: two\n\n");
    }
}
