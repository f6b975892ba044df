//! Streaming client for the language-model gateway.
//!
//! Stateless per request: each reasoning round issues one streaming POST
//! and exposes the raw fragment sequence. SSE framing is done by hand over
//! the byte stream (buffer, split on newlines, collect `data:` payloads,
//! parse each event object), with a synthetic `message_stop` if the server
//! closes without one.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::Value;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::models::{MessageRequest, StreamEvent};

/// Boxed fragment stream handed to the accumulator.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, GatewayError>> + Send>>;

/// Seam between the engine and the model gateway. The engine only needs
/// "give me a fragment stream for this request", which keeps it testable
/// against a scripted client.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream_message(&self, request: MessageRequest) -> Result<EventStream, GatewayError>;

    fn model(&self) -> &str;
}

/// HTTP implementation of [`ModelClient`].
#[must_use]
pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| GatewayError::new(format!("Invalid API key header: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::new(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { http, config })
    }
}

#[async_trait]
impl ModelClient for GatewayClient {
    async fn stream_message(&self, request: MessageRequest) -> Result<EventStream, GatewayError> {
        let url = format!("{}/v1/messages", self.config.base_url);
        let mut request = request;
        request.stream = Some(true);

        let response = send_with_retry(&self.config, || self.http.post(&url).json(&request))
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::http(status.as_u16(), &body));
        }

        let byte_stream = response.bytes_stream();

        let stream = async_stream::stream! {
            use futures_util::StreamExt;

            let mut byte_buf: Vec<u8> = Vec::new();
            let mut data_buf = String::new();
            let mut saw_message_stop = false;

            let mut byte_stream = std::pin::pin!(byte_stream);

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(GatewayError::new(format!("Stream read error: {e}")));
                        break;
                    }
                };

                byte_buf.extend_from_slice(&chunk);

                // Process complete SSE lines from the buffer
                loop {
                    let buf_str = String::from_utf8_lossy(&byte_buf);
                    let Some(newline_pos) = buf_str.find('\n') else { break };
                    let line: String = buf_str[..newline_pos].trim_end_matches('\r').to_string();
                    let consumed = newline_pos + 1;
                    byte_buf = byte_buf[consumed..].to_vec();

                    if line.is_empty() {
                        // Empty line = event boundary, parse accumulated data
                        if !data_buf.is_empty() {
                            let data = std::mem::take(&mut data_buf);
                            if data.trim() == "[DONE]" {
                                continue;
                            }
                            match serde_json::from_str::<StreamEvent>(&data) {
                                Ok(event) => {
                                    if matches!(event, StreamEvent::MessageStop) {
                                        saw_message_stop = true;
                                    }
                                    yield Ok(event);
                                }
                                Err(e) => {
                                    // Unknown event kinds are expected as the
                                    // protocol grows; log and keep reading.
                                    if serde_json::from_str::<Value>(&data).is_ok() {
                                        tracing::debug!("skipping unknown stream event: {data}");
                                    } else {
                                        yield Err(GatewayError::new(format!(
                                            "Malformed stream event: {e}"
                                        )));
                                    }
                                }
                            }
                        }
                        continue;
                    }

                    if let Some(data) = line.strip_prefix("data: ") {
                        data_buf.push_str(data);
                    } else if let Some(data) = line.strip_prefix("data:") {
                        data_buf.push_str(data);
                    }
                    // Ignore other SSE fields (event:, id:, retry:)
                }
            }

            if !saw_message_stop {
                yield Ok(StreamEvent::MessageStop);
            }
        };

        Ok(Box::pin(stream))
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

/// Send the initial request, retrying 429/5xx and connect errors with the
/// configured backoff before giving up.
async fn send_with_retry<F>(
    config: &GatewayConfig,
    mut build: F,
) -> Result<reqwest::Response, GatewayError>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let policy = &config.retry;
    let mut attempt: u32 = 0;

    loop {
        let result = build().send().await;

        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let retryable = status.as_u16() == 429 || status.is_server_error();
                if !retryable || !policy.enabled || attempt >= policy.max_retries {
                    // Hand back the failed response so the caller can read
                    // the body into the error.
                    return Ok(response);
                }

                tracing::warn!(
                    status = status.as_u16(),
                    attempt = attempt + 1,
                    "retryable gateway status"
                );
            }
            Err(err) => {
                if !policy.enabled || attempt >= policy.max_retries {
                    return Err(GatewayError::new(format!("Gateway request failed: {err}")));
                }
                tracing::warn!(attempt = attempt + 1, "gateway request error: {err}");
            }
        }

        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        tokio::time::sleep(delay).await;
    }
}
