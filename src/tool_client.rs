//! Client for the remote tool-execution service.
//!
//! The service requires a one-time session handshake; the token is then
//! attached to every call. The protocol is fragile in three distinct ways,
//! each with its own recovery rule:
//!
//! - A "missing/invalid session" failure triggers exactly one forced
//!   re-handshake and one replay of the original call, with no backoff
//!   delay. A second session failure after the replay is terminal for that
//!   call. The refresh is coalesced across concurrent callers.
//! - A not-acceptable (406) failure triggers one replay with a relaxed
//!   `Accept` header. Also one-shot, never combined with the session
//!   replay in the same attempt.
//! - Retryable transport failures (5xx, 429, 408/timeout, network) retry
//!   with exponential backoff up to the configured maximum.
//!
//! Response bodies go through [`crate::envelope::normalize_body`] because
//! the service answers in several incompatible envelopes.

use std::time::Duration;

use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::config::ToolServiceConfig;
use crate::envelope;
use crate::error::ToolError;

/// Application error code the service uses for a missing or expired
/// session.
const SESSION_ERROR_CODE: i64 = -32001;

/// Tool that enumerates every datasource; blocked when a run is pinned to
/// one datasource.
pub const LIST_DATASOURCES_TOOL: &str = "list-datasources";
/// Tool that runs an aggregated query against one datasource.
pub const QUERY_DATASOURCE_TOOL: &str = "query-datasource";
/// Tool that reads field metadata for one datasource.
pub const READ_METADATA_TOOL: &str = "read-metadata";

/// Argument key naming the target datasource on a tool call.
pub const DATASOURCE_ARG: &str = "datasourceId";

// === Session ===

/// Opaque token from the handshake. One per client instance; refreshed in
/// place, never multiplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    token: String,
}

impl SessionHandle {
    fn new(token: String) -> Self {
        Self { token }
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

// === Client ===

/// Stateful client for the tool-execution service.
pub struct ToolServiceClient {
    http: reqwest::Client,
    config: ToolServiceConfig,
    session: Mutex<Option<SessionHandle>>,
}

/// Per-call failure source, before retry classification collapses it.
enum CallFailure {
    /// The service flagged the session as missing or invalid.
    Session(ToolError),
    /// The service rejected the Accept header (406 class).
    NotAcceptable(ToolError),
    Other(ToolError),
}

impl ToolServiceClient {
    pub fn new(config: ToolServiceConfig) -> Result<Self, ToolError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ToolError::transport(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            config,
            session: Mutex::new(None),
        })
    }

    /// Execute one logical tool call.
    ///
    /// Handles the session handshake, one-shot remediations, backoff
    /// retries, timeout, and envelope normalization. On success the
    /// returned value is the normalized JSON payload.
    pub async fn call(&self, name: &str, args: &Value) -> Result<Value, ToolError> {
        if name.is_empty() {
            return Err(ToolError::invalid_input("Tool name must not be empty"));
        }
        if !args.is_object() {
            return Err(ToolError::invalid_input(format!(
                "Tool '{name}' arguments must be a JSON object"
            )));
        }

        let mut session_replayed = false;
        let mut accept_adjusted = false;
        let mut attempt: u32 = 0;
        let retry = &self.config.retry;

        loop {
            let token = self.ensure_session().await?;
            let relaxed_accept = accept_adjusted;

            match self.send_call(name, args, &token, relaxed_accept).await {
                Ok(value) => return Ok(value),
                Err(CallFailure::Session(err)) => {
                    if session_replayed {
                        // Replay already spent; a second session failure is
                        // terminal for this call.
                        tracing::error!(tool = name, "session invalid again after replay");
                        return Err(err);
                    }
                    session_replayed = true;
                    tracing::warn!(tool = name, "session rejected; re-handshaking once");
                    self.refresh_session(&token).await?;
                    // Replay immediately: no backoff delay, no attempt spent.
                    continue;
                }
                Err(CallFailure::NotAcceptable(err)) => {
                    if accept_adjusted {
                        return Err(err);
                    }
                    accept_adjusted = true;
                    tracing::warn!(tool = name, "adjusting Accept header and replaying once");
                    continue;
                }
                Err(CallFailure::Other(err)) => {
                    if !err.is_retryable() || !retry.enabled || attempt >= retry.max_retries {
                        return Err(err);
                    }
                    let delay = retry.delay_for_attempt(attempt);
                    attempt += 1;
                    tracing::warn!(
                        tool = name,
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        error = %err,
                        "retryable tool call failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Execute a list-returning call, tolerating the wrapper shapes the
    /// service uses (bare array, or wrapped under a conventional key).
    pub async fn call_list(&self, name: &str, args: &Value) -> Result<Vec<Value>, ToolError> {
        let value = self.call(name, args).await?;
        envelope::unwrap_list(&value).ok_or_else(|| {
            ToolError::invalid_input(format!(
                "Tool '{name}' returned a non-list shape with no known wrapper key"
            ))
        })
    }

    // === Session management ===

    /// Get the current session token, performing the handshake on first
    /// use. Concurrent first calls coalesce on the mutex.
    async fn ensure_session(&self) -> Result<String, ToolError> {
        let mut guard = self.session.lock().await;
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.token().to_string());
        }
        let handle = self.handshake().await?;
        let token = handle.token().to_string();
        *guard = Some(handle);
        Ok(token)
    }

    /// Replace a stale session token. Idempotent and coalescing: if
    /// another caller already refreshed past `stale`, the newer token is
    /// kept and no second handshake happens.
    async fn refresh_session(&self, stale: &str) -> Result<(), ToolError> {
        let mut guard = self.session.lock().await;
        if let Some(handle) = guard.as_ref()
            && handle.token() != stale
        {
            return Ok(());
        }
        let handle = self.handshake().await?;
        *guard = Some(handle);
        Ok(())
    }

    async fn handshake(&self) -> Result<SessionHandle, ToolError> {
        let url = format!("{}/api/v1/session", self.config.base_url);
        tracing::info!(url = %url, "performing tool service handshake");

        let send = self.http.post(&url).json(&json!({}));
        let response = tokio::time::timeout(self.config.handshake_timeout, send.send())
            .await
            .map_err(|_| ToolError::timeout(self.config.handshake_timeout))?
            .map_err(|e| ToolError::transport(format!("Handshake failed: {e}")))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if !(200..300).contains(&status) {
            return Err(ToolError::from_status(status, &body));
        }

        let value = envelope::normalize_body(&body)
            .ok_or_else(|| ToolError::transport("Handshake response was not parseable"))?;
        let token = value
            .get("sessionToken")
            .or_else(|| value.get("token"))
            .or_else(|| value.get("session").and_then(|s| s.get("id")))
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::transport("Handshake response carried no session token"))?;

        Ok(SessionHandle::new(token.to_string()))
    }

    // === Transport ===

    async fn send_call(
        &self,
        name: &str,
        args: &Value,
        token: &str,
        relaxed_accept: bool,
    ) -> Result<Value, CallFailure> {
        let url = format!("{}/api/v1/tools/{name}", self.config.base_url);
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Session-Token",
            HeaderValue::from_str(token)
                .map_err(|e| CallFailure::Other(ToolError::invalid_input(e.to_string())))?,
        );
        if relaxed_accept {
            headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        } else {
            headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        }

        let send = self
            .http
            .post(&url)
            .headers(headers)
            .json(&json!({ "arguments": args }));

        let started = std::time::Instant::now();
        let response = match tokio::time::timeout(self.config.call_timeout, send.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(CallFailure::Other(ToolError::transport(format!(
                    "Tool call '{name}' failed: {e}"
                ))));
            }
            Err(_) => {
                return Err(CallFailure::Other(ToolError::timeout(started.elapsed())));
            }
        };

        let status = response.status().as_u16();
        let remaining = self
            .config
            .call_timeout
            .saturating_sub(started.elapsed())
            .max(Duration::from_millis(1));
        let body = match tokio::time::timeout(remaining, response.text()).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                return Err(CallFailure::Other(ToolError::transport(format!(
                    "Failed to read tool response body: {e}"
                ))));
            }
            Err(_) => {
                return Err(CallFailure::Other(ToolError::timeout(started.elapsed())));
            }
        };

        self.classify_response(status, &body)
    }

    /// Turn an HTTP response into a normalized value or a classified
    /// failure, checking the session and not-acceptable signatures before
    /// the generic status mapping.
    fn classify_response(&self, status: u16, body: &str) -> Result<Value, CallFailure> {
        let parsed = envelope::normalize_body(body);

        // Application-level errors ride in a 200 or error status alike;
        // inspect the payload first.
        if let Some(value) = &parsed
            && let Some(error) = value.get("error")
        {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();

            if is_session_failure(status, code, &message) {
                return Err(CallFailure::Session(ToolError::protocol(code, message)));
            }
            if code < 0 {
                return Err(CallFailure::Other(ToolError::protocol(code, message)));
            }
        }

        if status == 401 {
            return Err(CallFailure::Session(ToolError::from_status(status, body)));
        }
        if status == 406 {
            return Err(CallFailure::NotAcceptable(ToolError::from_status(
                status, body,
            )));
        }
        if !(200..300).contains(&status) {
            return Err(CallFailure::Other(ToolError::from_status(status, body)));
        }

        parsed.ok_or_else(|| {
            CallFailure::Other(ToolError {
                kind: crate::error::ErrorKind::RemoteTransport,
                message: "Tool response body was not parseable in any known envelope".to_string(),
                status: Some(status),
                body_snippet: Some(body.chars().take(200).collect()),
            })
        })
    }

    /// Expose the current session token for diagnostics and tests.
    pub async fn current_session(&self) -> Option<SessionHandle> {
        self.session.lock().await.clone()
    }
}

/// The service's "missing/invalid session" signature: HTTP 401, the
/// dedicated application code, or an error message naming an expired or
/// invalid session.
fn is_session_failure(status: u16, code: i64, message: &str) -> bool {
    if status == 401 || code == SESSION_ERROR_CODE {
        return true;
    }
    let lower = message.to_lowercase();
    lower.contains("session")
        && (lower.contains("invalid") || lower.contains("expired") || lower.contains("missing"))
}

// === Tool schemas ===

/// Tool definitions exposed to the model for the data service.
#[must_use]
pub fn builtin_tool_schemas() -> Vec<crate::models::Tool> {
    vec![
        crate::models::Tool {
            name: READ_METADATA_TOOL.to_string(),
            description: "Read field names, types, and descriptions for a datasource."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "datasourceId": { "type": "string", "description": "Datasource to inspect" }
                },
                "required": ["datasourceId"]
            }),
        },
        crate::models::Tool {
            name: QUERY_DATASOURCE_TOOL.to_string(),
            description: "Run an aggregated query against a datasource and return rows."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "datasourceId": { "type": "string" },
                    "fields": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Fields and aggregations to return"
                    },
                    "filters": { "type": "array", "items": { "type": "object" } },
                    "limit": { "type": "integer" }
                },
                "required": ["datasourceId", "fields"]
            }),
        },
        crate::models::Tool {
            name: LIST_DATASOURCES_TOOL.to_string(),
            description: "Enumerate every datasource available to the caller.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        },
    ]
}
