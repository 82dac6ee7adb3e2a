//! REST + SSE client for the conversational GenAI provider.
//!
//! Session auth rides on cookies inside the injected HTTP client. Response
//! bodies vary between `{...}` and `{"data": {...}}` wrapping, so id
//! extraction checks both.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{DispatchError, Result};
use crate::http::{ByteStream, HttpClient, HttpRequest, HttpResponse};

const SESSION_PATH: &str = "/api/account/auth/session";
const CHATS_PATH: &str = "/api/chat/v1/chats";
const MESSAGES_PATH: &str = "/api/chat/v1/messages";
const RESPONSE_PATH: &str = "/api/chat/v1/messages-response";
const CANCEL_PATH: &str = "/api/chat/v1/messages-response/cancel";

/// Server error code meaning the parent message is still processing.
const PARENT_BUSY_CODE: &str = "CHAT_ERROR_4";

#[derive(Clone)]
pub struct GenAiClient {
    http: Arc<dyn HttpClient>,
    base_url: String,
    timeout_ms: u64,
}

impl GenAiClient {
    pub fn new(http: Arc<dyn HttpClient>, base_url: impl Into<String>, timeout_ms: u64) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http,
            base_url,
            timeout_ms,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Probe session liveness: 200 with a non-empty `data` field means the
    /// cookie session is authenticated.
    pub async fn check_session(&self) -> Result<bool> {
        let request = HttpRequest::new("GET", self.url(SESSION_PATH));
        let response = self.http.execute(&request, self.timeout_ms).await?;
        if response.status != 200 {
            return Ok(false);
        }
        let value: Value = match serde_json::from_str(&response.body) {
            Ok(value) => value,
            Err(_) => return Ok(false),
        };
        Ok(match value.get("data") {
            Some(Value::Null) | None => false,
            Some(Value::Object(map)) => !map.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        })
    }

    /// Create a remote chat; returns its guid.
    pub async fn create_chat(&self) -> Result<String> {
        let request =
            HttpRequest::new("POST", self.url(CHATS_PATH)).with_json_body("{}".to_string());
        let response = self.http.execute(&request, self.timeout_ms).await?;
        let value = self.expect_success(response)?;
        extract_guid(&value)
            .ok_or_else(|| DispatchError::InvalidPayload("create chat returned no guid".into()))
    }

    /// Destroy remote chats. Callers treat failures as best-effort.
    pub async fn delete_chats(&self, chat_ids: &[String]) -> Result<()> {
        let body = json!({ "chatGuids": chat_ids }).to_string();
        let request = HttpRequest::new("DELETE", self.url(CHATS_PATH)).with_json_body(body);
        let response = self.http.execute(&request, self.timeout_ms).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(DispatchError::Status {
                status: response.status,
                body: response.body,
            })
        }
    }

    /// Send a user turn; returns the new message guid. HTTP 422 with
    /// `CHAT_ERROR_4` maps to [`DispatchError::PendingResponse`].
    pub async fn send_message(
        &self,
        chat_id: &str,
        content: &str,
        parent_message_id: Option<&str>,
    ) -> Result<String> {
        let mut body = json!({
            "chatGuid": chat_id,
            "content": content,
        });
        if let Some(parent) = parent_message_id {
            body["parentMessageGuid"] = json!(parent);
        }

        let request =
            HttpRequest::new("POST", self.url(MESSAGES_PATH)).with_json_body(body.to_string());
        let response = self.http.execute(&request, self.timeout_ms).await?;

        if response.status == 422 && body_error_code(&response.body) == Some(PARENT_BUSY_CODE) {
            return Err(DispatchError::PendingResponse);
        }

        let value = self.expect_success(response)?;
        extract_guid(&value)
            .ok_or_else(|| DispatchError::InvalidPayload("send message returned no guid".into()))
    }

    /// Open the assistant reply stream for a user message.
    pub async fn open_response_stream(
        &self,
        user_message_id: &str,
        model_id: &str,
    ) -> Result<ByteStream> {
        let body = json!({
            "messageGuid": user_message_id,
            "modelId": model_id,
        })
        .to_string();
        let request = HttpRequest::new("POST", self.url(RESPONSE_PATH)).with_json_body(body);
        self.http.execute_stream(&request, self.timeout_ms).await
    }

    /// Ask the server to stop streaming a reply. Best-effort.
    pub async fn cancel_response(&self, user_message_id: &str) -> Result<()> {
        let body = json!({ "messageGuid": user_message_id }).to_string();
        let request = HttpRequest::new("POST", self.url(CANCEL_PATH)).with_json_body(body);
        let response = self.http.execute(&request, self.timeout_ms).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(DispatchError::Status {
                status: response.status,
                body: response.body,
            })
        }
    }

    /// Poll one message. The raw response is returned so the poller can
    /// interpret 404/410 as deletion.
    pub async fn get_message(&self, message_id: &str) -> Result<HttpResponse> {
        let request = HttpRequest::new("GET", format!("{}/{}", self.url(MESSAGES_PATH), message_id));
        self.http.execute(&request, self.timeout_ms).await
    }

    fn expect_success(&self, response: HttpResponse) -> Result<Value> {
        if !response.is_success() {
            return Err(DispatchError::Status {
                status: response.status,
                body: response.body,
            });
        }
        Ok(serde_json::from_str(&response.body)?)
    }
}

/// Guid from the top level or a `data` wrapper.
fn extract_guid(value: &Value) -> Option<String> {
    let direct = value.get("guid").and_then(Value::as_str);
    let wrapped = value
        .get("data")
        .and_then(|data| data.get("guid"))
        .and_then(Value::as_str);
    direct
        .or(wrapped)
        .filter(|guid| !guid.is_empty())
        .map(String::from)
}

fn body_error_code(body: &str) -> Option<&'static str> {
    let value: Value = serde_json::from_str(body).ok()?;
    let code = value
        .get("errorCode")
        .and_then(Value::as_str)
        .or_else(|| value.get("error_code").and_then(Value::as_str))?;
    (code == PARENT_BUSY_CODE).then_some(PARENT_BUSY_CODE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::MockHttpClient;

    fn client(mock: &MockHttpClient) -> GenAiClient {
        GenAiClient::new(
            Arc::new(mock.clone()),
            "https://genai.example.com/",
            5_000,
        )
    }

    #[tokio::test]
    async fn session_probe_requires_non_empty_data() {
        let mock = MockHttpClient::new();
        mock.add_json("GET /api/account/auth/session", r#"{"data":{"user":"u"}}"#);
        mock.add_json("GET /api/account/auth/session", r#"{"data":null}"#);
        mock.add_response(
            "GET /api/account/auth/session",
            Ok(crate::http::HttpResponse {
                status: 401,
                body: String::new(),
            }),
        );

        let client = client(&mock);
        assert!(client.check_session().await.unwrap());
        assert!(!client.check_session().await.unwrap());
        assert!(!client.check_session().await.unwrap());
    }

    #[tokio::test]
    async fn create_chat_reads_plain_and_wrapped_guids() {
        let mock = MockHttpClient::new();
        mock.add_json("POST /api/chat/v1/chats", r#"{"guid":"chat-1"}"#);
        mock.add_json("POST /api/chat/v1/chats", r#"{"data":{"guid":"chat-2"}}"#);

        let client = client(&mock);
        assert_eq!(client.create_chat().await.unwrap(), "chat-1");
        assert_eq!(client.create_chat().await.unwrap(), "chat-2");
    }

    #[tokio::test]
    async fn send_message_maps_parent_busy() {
        let mock = MockHttpClient::new();
        mock.add_response(
            "POST /api/chat/v1/messages",
            Ok(crate::http::HttpResponse {
                status: 422,
                body: r#"{"errorCode":"CHAT_ERROR_4"}"#.to_string(),
            }),
        );
        mock.add_json("POST /api/chat/v1/messages", r#"{"guid":"msg-1"}"#);

        let client = client(&mock);
        assert_eq!(
            client.send_message("chat-1", "hello", None).await,
            Err(DispatchError::PendingResponse)
        );
        assert_eq!(
            client
                .send_message("chat-1", "hello", Some("parent-1"))
                .await
                .unwrap(),
            "msg-1"
        );

        // The parent id went out on the retry.
        let calls = mock.calls();
        let retry_body = calls[1].body.as_deref().unwrap();
        assert!(retry_body.contains("\"parentMessageGuid\":\"parent-1\""));
    }

    #[tokio::test]
    async fn other_422_is_a_plain_status_error() {
        let mock = MockHttpClient::new();
        mock.add_response(
            "POST /api/chat/v1/messages",
            Ok(crate::http::HttpResponse {
                status: 422,
                body: r#"{"errorCode":"CHAT_ERROR_9"}"#.to_string(),
            }),
        );

        let client = client(&mock);
        assert!(matches!(
            client.send_message("chat-1", "hello", None).await,
            Err(DispatchError::Status { status: 422, .. })
        ));
    }

    #[tokio::test]
    async fn delete_chats_sends_guid_list() {
        let mock = MockHttpClient::new();
        mock.add_json("DELETE /api/chat/v1/chats", "{}");

        let client = client(&mock);
        client
            .delete_chats(&["chat-1".to_string(), "chat-2".to_string()])
            .await
            .unwrap();

        let calls = mock.calls();
        let body = calls[0].body.as_deref().unwrap();
        assert!(body.contains("\"chatGuids\":[\"chat-1\",\"chat-2\"]"));
    }
}
