use thiserror::Error;

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors that can occur in the dispatch core.
///
/// Variants carry rendered strings rather than source error types so that a
/// single terminal error can be cloned out to every deduplicated waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Network-level failure (connect, DNS, broken stream). Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// A task exceeded its wall-clock deadline. Retryable.
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// Non-2xx HTTP response from a provider endpoint.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The conversation's parent message is still processing
    /// (server code `CHAT_ERROR_4` on the send-message endpoint).
    #[error("parent message still processing")]
    PendingResponse,

    /// The provider reported a terminal failure status or `R5xxxx` code.
    #[error("provider failure: {0}")]
    ResponseFailed(String),

    /// The assistant stream ended without ever yielding a message id.
    #[error("assistant stream ended without a message id")]
    StreamMissingId,

    /// A batch response did not split into one fragment per input task.
    #[error("batch returned {got} fragments for {expected} tasks")]
    BatchCountMismatch { expected: usize, got: usize },

    /// The request was cancelled by its client or by a tab close.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The GenAI driver exhausted its chat recovery attempts.
    #[error("chat recovery attempts exhausted")]
    ExhaustedRecovery,

    /// A response body could not be decoded into the expected shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Persistence layer failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Whether the request queue should retry this failure.
    ///
    /// Transient network faults, timeouts, and 5xx responses are retried;
    /// everything else is terminal for the attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Transport(_) | DispatchError::Timeout(_) => true,
            DispatchError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether this error is an abort propagated from a client cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled(_))
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest doesn't expose the configured deadline here
            DispatchError::Timeout(0)
        } else {
            DispatchError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::InvalidPayload(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(DispatchError::Transport("reset".into()).is_retryable());
        assert!(DispatchError::Timeout(30_000).is_retryable());
        assert!(DispatchError::Status {
            status: 503,
            body: "overloaded".into()
        }
        .is_retryable());

        assert!(!DispatchError::Status {
            status: 422,
            body: "{}".into()
        }
        .is_retryable());
        assert!(!DispatchError::PendingResponse.is_retryable());
        assert!(!DispatchError::Cancelled("tab closed".into()).is_retryable());
        assert!(!DispatchError::StreamMissingId.is_retryable());
    }

    #[test]
    fn cancelled_classification() {
        assert!(DispatchError::Cancelled("user".into()).is_cancelled());
        assert!(!DispatchError::Timeout(1).is_cancelled());
    }
}
