//! Error taxonomy shared by the tool client, gateway, and engine.
//!
//! Two families are kept deliberately separate: expected, recoverable tool
//! failures (`ToolError`, folded back into the transcript as error tool
//! results so the model can self-correct) and unexpected, fatal failures
//! (`OrchestrationError`, which abort the run).

use std::time::Duration;

/// Broad classification used for retry decisions and user-facing mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed caller or model arguments. Never retried.
    InvalidInput,
    /// Application-level (negative code) error from the tool service.
    RemoteProtocol,
    /// HTTP 5xx or unclassified network failure.
    RemoteTransport,
    /// Request exceeded its deadline (includes HTTP 408).
    Timeout,
    /// HTTP 429.
    RateLimited,
    /// Any failure contacting the model gateway.
    ModelGateway,
    /// The round safety bound was hit without a final answer.
    RoundBudgetExceeded,
    Internal,
}

impl ErrorKind {
    /// Whether a failure of this kind is safe to retry with backoff.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RemoteTransport | ErrorKind::Timeout | ErrorKind::RateLimited
        )
    }
}

/// Classify an HTTP status code from the tool service.
#[must_use]
pub fn kind_for_status(status: u16) -> ErrorKind {
    match status {
        408 => ErrorKind::Timeout,
        429 => ErrorKind::RateLimited,
        400..=499 => ErrorKind::InvalidInput,
        500..=599 => ErrorKind::RemoteTransport,
        _ => ErrorKind::Internal,
    }
}

/// Max bytes of response body carried in an error for diagnostics.
const BODY_SNIPPET_BYTES: usize = 500;

fn snippet(body: &str) -> String {
    if body.len() <= BODY_SNIPPET_BYTES {
        return body.to_string();
    }
    let mut end = BODY_SNIPPET_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// Typed failure from the remote tool service.
///
/// Always carries a classification, the original message, and whatever
/// structured context is available. Never a bare transport exception.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
    pub status: Option<u16>,
    pub body_snippet: Option<String>,
}

impl ToolError {
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            message: message.into(),
            status: None,
            body_snippet: None,
        }
    }

    #[must_use]
    pub fn protocol(code: i64, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::RemoteProtocol,
            message: format!("Tool service error {code}: {}", message.into()),
            status: None,
            body_snippet: None,
        }
    }

    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::RemoteTransport,
            message: message.into(),
            status: None,
            body_snippet: None,
        }
    }

    #[must_use]
    pub fn timeout(elapsed: Duration) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: format!("Tool call timed out after {:.1}s", elapsed.as_secs_f64()),
            status: None,
            body_snippet: None,
        }
    }

    /// Build an error from an HTTP status and response body.
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        Self {
            kind: kind_for_status(status),
            message: format!("Tool service returned HTTP {status}"),
            status: Some(status),
            body_snippet: if body.trim().is_empty() {
                None
            } else {
                Some(snippet(body))
            },
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Serialize this error as ordinary tool output so the model consumes
    /// it as data rather than a transport failure.
    #[must_use]
    pub fn as_result_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "kind": self.kind,
                "message": self.message,
                "status": self.status,
            }
        })
    }
}

/// Failure from the model gateway. Fatal for the run that hit it.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct GatewayError {
    pub message: String,
    pub status: Option<u16>,
}

impl GatewayError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    #[must_use]
    pub fn http(status: u16, body: &str) -> Self {
        Self {
            message: format!("Model gateway returned HTTP {status}: {}", snippet(body)),
            status: Some(status),
        }
    }
}

/// Terminal failure surfaced to the caller of an orchestration run.
///
/// Carries a plain-language message and actionable suggestions; `Display`
/// never prints a stack trace.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct OrchestrationError {
    pub kind: ErrorKind,
    pub message: String,
    pub suggestions: Vec<String>,
    pub detail: Option<String>,
}

impl OrchestrationError {
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            message: message.into(),
            suggestions: vec!["Check the request arguments and try again.".to_string()],
            detail: None,
        }
    }

    #[must_use]
    pub fn round_budget(max_rounds: u32, last_output: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::RoundBudgetExceeded,
            message: format!(
                "The question could not be answered within {max_rounds} rounds of analysis."
            ),
            suggestions: vec![
                "Try a more specific question.".to_string(),
                "Break the question into smaller parts.".to_string(),
            ],
            detail: {
                let last = last_output.into();
                if last.is_empty() { None } else { Some(last) }
            },
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: message.into(),
            suggestions: vec!["Retry the request; if it persists, contact support.".to_string()],
            detail: None,
        }
    }
}

impl From<GatewayError> for OrchestrationError {
    fn from(value: GatewayError) -> Self {
        Self {
            kind: ErrorKind::ModelGateway,
            message: "The language model could not be reached.".to_string(),
            suggestions: vec![
                "Check connectivity to the model gateway.".to_string(),
                "Retry in a few seconds.".to_string(),
            ],
            detail: Some(value.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_follow_taxonomy() {
        assert!(kind_for_status(503).is_retryable());
        assert!(kind_for_status(429).is_retryable());
        assert!(kind_for_status(408).is_retryable());
        assert!(!kind_for_status(404).is_retryable());
        assert!(!kind_for_status(422).is_retryable());
        assert!(!ErrorKind::RemoteProtocol.is_retryable());
        assert!(!ErrorKind::InvalidInput.is_retryable());
    }

    #[test]
    fn from_status_truncates_long_bodies() {
        let body = "x".repeat(2_000);
        let err = ToolError::from_status(500, &body);
        let snippet = err.body_snippet.unwrap();
        assert!(snippet.len() < 600);
        assert!(snippet.ends_with("..."));
    }

    #[test]
    fn error_payload_is_valid_json_data() {
        let err = ToolError::protocol(-32001, "session expired");
        let payload = err.as_result_payload();
        assert_eq!(payload["error"]["kind"], "remote_protocol");
        assert!(
            payload["error"]["message"]
                .as_str()
                .unwrap()
                .contains("session expired")
        );
    }

    #[test]
    fn gateway_error_maps_to_fatal_orchestration_error() {
        let err: OrchestrationError = GatewayError::http(502, "bad gateway").into();
        assert_eq!(err.kind, ErrorKind::ModelGateway);
        assert!(!err.suggestions.is_empty());
        assert!(err.detail.unwrap().contains("502"));
    }
}
