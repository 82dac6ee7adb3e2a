//! Server-sent-events decoder for assistant reply streams.
//!
//! The provider frames events as `data:` lines terminated by blank lines,
//! with JSON payloads that vary in field spelling across server versions.
//! The decoder is a pull parser feeding a small per-event state machine: it
//! tracks the most recent message id, accumulates visible streaming chunks
//! as fallback content, and returns as soon as a completion event is seen.
//! Malformed JSON drops to regex heuristics for that event only.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use futures::StreamExt;

use crate::error::{DispatchError, Result};
use crate::http::ByteStream;

/// Statuses that mark the assistant reply as finished.
const COMPLETION_STATUSES: [&str; 6] = [
    "FINAL_ANSWER",
    "SUCCESS",
    "R20000",
    "DONE",
    "COMPLETED",
    "COMPLETE",
];

/// Statuses that mark the reply as failed.
const FAILURE_STATUSES: [&str; 3] = ["FAIL", "FAILED", "ERROR"];

static GUID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""guid"\s*:\s*"([^"]+)""#).expect("guid regex"));

/// Result of decoding one assistant stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    /// Message id the stream reported (used for follow-up polling).
    pub response_id: String,
    /// Assistant text accumulated from visible streaming chunks; used when
    /// the follow-up poll returns an empty payload.
    pub fallback_content: String,
}

/// Message id from any of the spellings the server uses.
pub(crate) fn extract_message_id(value: &Value) -> Option<String> {
    for key in [
        "guid",
        "id",
        "message_guid",
        "messageGuid",
        "response_guid",
        "responseGuid",
    ] {
        if let Some(id) = value.get(key).and_then(Value::as_str) {
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    None
}

/// Event status, uppercased, from direct keys or the nested
/// `processing_content[].event_status` shape.
pub(crate) fn extract_status(value: &Value) -> Option<String> {
    for key in [
        "event_status",
        "eventStatus",
        "status",
        "response_code",
        "responseCode",
    ] {
        if let Some(status) = value.get(key).and_then(Value::as_str) {
            if !status.is_empty() {
                return Some(status.to_uppercase());
            }
        }
    }

    if let Some(items) = value.get("processing_content").and_then(Value::as_array) {
        for item in items {
            if let Some(status) = item.get("event_status").and_then(Value::as_str) {
                if !status.is_empty() {
                    return Some(status.to_uppercase());
                }
            }
        }
    }

    None
}

/// Explicit response code, when present.
pub(crate) fn extract_response_code(value: &Value) -> Option<String> {
    for key in ["response_code", "responseCode"] {
        if let Some(code) = value.get(key).and_then(Value::as_str) {
            if !code.is_empty() {
                return Some(code.to_uppercase());
            }
        }
    }
    None
}

pub(crate) fn extract_content(value: &Value) -> Option<&str> {
    value
        .get("content")
        .and_then(Value::as_str)
        .filter(|content| !content.is_empty())
}

pub(crate) fn is_completion_status(status: &str) -> bool {
    COMPLETION_STATUSES.contains(&status)
}

/// Terminal failure: a textual failure status or an `R5xxxx` code.
pub(crate) fn is_failure_status(status: &str) -> bool {
    FAILURE_STATUSES.contains(&status)
        || (status.starts_with("R5") && status.len() >= 3 && status[1..].chars().all(|c| c.is_ascii_digit()))
}

/// Incremental `data:` frame parser. Bytes go in, complete event payloads
/// come out; lines only split on `\n`, so multi-byte UTF-8 sequences are
/// never cut.
#[derive(Default)]
struct EventParser {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl EventParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let mut line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            }
            // Other SSE fields (event:, id:, retry:, comments) are ignored.
        }

        events
    }

    /// Flush a trailing event that was never terminated by a blank line.
    fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let mut line = String::from_utf8_lossy(&self.buffer).into_owned();
            self.buffer.clear();
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            }
        }
        if self.data_lines.is_empty() {
            None
        } else {
            let event = self.data_lines.join("\n");
            self.data_lines.clear();
            Some(event)
        }
    }
}

struct DecodeState {
    seen_id: Option<String>,
    fallback: String,
}

impl DecodeState {
    fn outcome(&self) -> Option<StreamOutcome> {
        self.seen_id.as_ref().map(|id| StreamOutcome {
            response_id: id.clone(),
            fallback_content: self.fallback.clone(),
        })
    }
}

/// Process one event; returns the final outcome when the event carries a
/// completion signal and an id is known.
fn process_event(data: &str, state: &mut DecodeState) -> Option<StreamOutcome> {
    match serde_json::from_str::<Value>(data) {
        Ok(value) => {
            if let Some(id) = extract_message_id(&value) {
                state.seen_id = Some(id);
            }

            let code = extract_response_code(&value);
            let status = extract_status(&value);

            if let Some(content) = extract_content(&value) {
                // A response-code-bearing event is a control frame, not a
                // visible chunk.
                if code.is_none()
                    && matches!(status.as_deref(), Some("CHUNK") | Some("STREAM"))
                {
                    state.fallback.push_str(content);
                }
            }

            if status.as_deref().is_some_and(is_completion_status) {
                return state.outcome();
            }
            None
        }
        Err(_) => {
            // Heuristic path for truncated or invalid JSON.
            if state.seen_id.is_none() {
                if let Some(caps) = GUID_RE.captures(data) {
                    state.seen_id = Some(caps[1].to_string());
                }
            }
            if COMPLETION_STATUSES.iter().any(|s| data.contains(s)) {
                return state.outcome();
            }
            None
        }
    }
}

/// Decode an assistant event stream down to `(response id, fallback text)`.
///
/// Returns as soon as the first completion event is seen. A stream that
/// ends early still resolves if any id was observed; otherwise the call
/// fails with [`DispatchError::StreamMissingId`]. Firing `cancel` aborts
/// the read and surfaces a cancellation error.
pub async fn decode_assistant_stream(
    mut stream: ByteStream,
    cancel: &CancellationToken,
) -> Result<StreamOutcome> {
    let mut parser = EventParser::default();
    let mut state = DecodeState {
        seen_id: None,
        fallback: String::new(),
    };
    let mut stream_error: Option<DispatchError> = None;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(DispatchError::Cancelled("assistant stream aborted".into()));
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                for event in parser.push(&bytes) {
                    if let Some(outcome) = process_event(&event, &mut state) {
                        return Ok(outcome);
                    }
                }
            }
            Some(Err(error)) => {
                tracing::warn!(error = %error, "Assistant stream broke mid-read");
                stream_error = Some(error);
                break;
            }
            None => break,
        }
    }

    if let Some(event) = parser.finish() {
        if let Some(outcome) = process_event(&event, &mut state) {
            return Ok(outcome);
        }
    }

    match state.outcome() {
        Some(outcome) => Ok(outcome),
        None => Err(stream_error.unwrap_or(DispatchError::StreamMissingId)),
    }
}
