//! Orchestration engine: the round loop that turns a question into an
//! answer.
//!
//! Each round asks the model, discovers requested tool calls, executes
//! them against the data service, and feeds results back. A round with no
//! tool calls ends the loop through an answer-only re-query that streams
//! the settled answer to the caller. The loop is bounded; hitting the
//! bound triggers one partial-answer attempt before the run fails.
//!
//! The engine is the only writer of a run's transcript. Tool calls within
//! a round execute sequentially, in call order, so progress events reflect
//! real completion order and later calls may rely on earlier ones.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::accumulator::{AccumulatedMessage, AccumulatorSignal, StreamAccumulator};
use crate::clarify;
use crate::config::EngineConfig;
use crate::context_cache::ContextProvider;
use crate::error::{ErrorKind, GatewayError, OrchestrationError, ToolError};
use crate::gateway::ModelClient;
use crate::history::{HistoryStore, Turn};
use crate::models::{ContentBlock, Message, MessageRequest, ToolCall};
use crate::tool_client::{
    DATASOURCE_ARG, LIST_DATASOURCES_TOOL, QUERY_DATASOURCE_TOOL, ToolServiceClient,
    builtin_tool_schemas,
};
use crate::truncation::bound_result;

use super::events::{Citation, ProgressEvent, ProgressSink};

/// Maximum time to wait for a single stream fragment before assuming a
/// stall.
const STREAM_CHUNK_TIMEOUT_SECS: u64 = 90;
/// Tolerated mid-stream errors before a pass is abandoned.
const MAX_STREAM_ERRORS: u32 = 3;
/// Top-level keys kept in a tool-result progress summary.
const SUMMARY_MAX_KEYS: usize = 5;
/// Instruction appended for the partial-answer attempt at round exhaustion.
const PARTIAL_ANSWER_NUDGE: &str =
    "Stop querying. Answer the original question now with the data already \
     gathered, and say what is missing if the data is incomplete.";

// === Run inputs and outputs ===

/// One orchestration run request.
#[derive(Clone)]
pub struct RunRequest {
    pub user_text: String,
    pub session_id: String,
    /// When set, the run is pinned to this datasource: calls naming any
    /// other datasource, or enumerating datasources, fail locally.
    pub datasource_id: Option<String>,
    /// Override for the configured round bound.
    pub max_rounds: Option<u32>,
    pub sink: ProgressSink,
    pub cancel: CancellationToken,
}

impl RunRequest {
    #[must_use]
    pub fn new(user_text: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_text: user_text.into(),
            session_id: session_id.into(),
            datasource_id: None,
            max_rounds: None,
            sink: ProgressSink::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_datasource(mut self, id: impl Into<String>) -> Self {
        self.datasource_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = Some(rounds);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: ProgressSink) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Successful run outcome.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub answer_text: String,
    pub citations: Vec<Citation>,
    pub rounds_used: u32,
}

// === Helpers ===

/// Bounded summary of a tool result for progress events: a handful of
/// top-level keys, arrays and objects collapsed to counts, never the full
/// payload.
fn summarize_result(value: &Value) -> Value {
    let Some(obj) = value.as_object() else {
        return match value {
            Value::Array(items) => json!({ "count": items.len() }),
            other => other.clone(),
        };
    };

    let mut summary = serde_json::Map::new();
    for (key, entry) in obj.iter().take(SUMMARY_MAX_KEYS) {
        let condensed = match entry {
            Value::Array(items) => json!({ "count": items.len() }),
            Value::Object(fields) => json!({ "keys": fields.len() }),
            Value::String(text) if text.len() > 120 => {
                let cut: String = text.chars().take(117).collect();
                Value::String(format!("{cut}..."))
            }
            scalar => scalar.clone(),
        };
        summary.insert(key.clone(), condensed);
    }
    if obj.len() > SUMMARY_MAX_KEYS {
        summary.insert(
            "omittedKeys".to_string(),
            json!(obj.len() - SUMMARY_MAX_KEYS),
        );
    }
    Value::Object(summary)
}

/// Enforce the locked-datasource invariant before a call is dispatched.
fn validate_scope(call: &ToolCall, locked: Option<&str>) -> Result<(), ToolError> {
    let Some(locked) = locked else {
        return Ok(());
    };
    if call.name == LIST_DATASOURCES_TOOL {
        return Err(ToolError::invalid_input(format!(
            "This run is scoped to datasource '{locked}'; enumerating datasources is not allowed"
        )));
    }
    if let Some(named) = call.input.get(DATASOURCE_ARG).and_then(Value::as_str)
        && named != locked
    {
        return Err(ToolError::invalid_input(format!(
            "This run is scoped to datasource '{locked}'; tool call named '{named}'"
        )));
    }
    Ok(())
}

/// Extract a citation from a successful datasource query call.
fn citation_for(call: &ToolCall) -> Option<Citation> {
    if call.name != QUERY_DATASOURCE_TOOL {
        return None;
    }
    let fields = call
        .input
        .get("fields")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(Citation {
        tool: call.name.clone(),
        datasource_id: call
            .input
            .get(DATASOURCE_ARG)
            .and_then(Value::as_str)
            .map(str::to_string),
        fields,
    })
}

fn cancelled_error() -> OrchestrationError {
    OrchestrationError {
        kind: ErrorKind::Internal,
        message: "The request was cancelled.".to_string(),
        suggestions: Vec::new(),
        detail: None,
    }
}

// === Engine ===

/// The orchestration engine. One instance serves many concurrent runs;
/// each run's transcript and buffers are owned by that run alone.
pub struct Engine {
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolServiceClient>,
    history: Arc<dyn HistoryStore>,
    context: Arc<dyn ContextProvider>,
    config: EngineConfig,
}

/// Outcome of one accumulator pass over one stream.
struct PassOutcome {
    message: AccumulatedMessage,
    /// Set when the stream died before completing; the accumulated state
    /// is still valid up to that point.
    stream_failure: Option<GatewayError>,
}

impl Engine {
    pub fn new(
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolServiceClient>,
        history: Arc<dyn HistoryStore>,
        context: Arc<dyn ContextProvider>,
        config: EngineConfig,
    ) -> Self {
        Self {
            model,
            tools,
            history,
            context,
            config,
        }
    }

    /// Run one orchestration to completion: returns the final answer text
    /// after emitting the progress events of the run.
    pub async fn execute(&self, request: RunRequest) -> Result<RunOutcome, OrchestrationError> {
        let run_id = uuid::Uuid::new_v4();
        let result = self.execute_inner(&request, run_id).await;

        if let Err(err) = &result
            && !request.cancel.is_cancelled()
        {
            // Best-effort terminal notification; emission failures are
            // swallowed inside the sink.
            request
                .sink
                .emit(ProgressEvent::Error {
                    message: err.message.clone(),
                    suggestions: err.suggestions.clone(),
                    detail: err.detail.clone(),
                })
                .await;
        }

        result
    }

    async fn execute_inner(
        &self,
        request: &RunRequest,
        run_id: uuid::Uuid,
    ) -> Result<RunOutcome, OrchestrationError> {
        let user_text = request.user_text.trim();
        if user_text.is_empty() {
            return Err(OrchestrationError::invalid_input(
                "The question must not be empty.",
            ));
        }
        let max_rounds = request.max_rounds.unwrap_or(self.config.max_rounds).max(1);

        tracing::info!(%run_id, session = %request.session_id, "orchestration run started");

        // Pre-flight ambiguity check can short-circuit the whole run.
        if self.config.preflight_clarification
            && let Some(clarification) = clarify::check(user_text)
        {
            tracing::info!(%run_id, reason = %clarification.reason, "short-circuit: clarification");
            let text = clarification.question;
            request.sink.emit(ProgressEvent::AnswerStarted).await;
            request
                .sink
                .emit(ProgressEvent::AnswerChunk { text: text.clone() })
                .await;
            request
                .sink
                .emit(ProgressEvent::AnswerComplete {
                    text: text.clone(),
                    citations: Vec::new(),
                })
                .await;
            return Ok(RunOutcome {
                answer_text: text,
                citations: Vec::new(),
                rounds_used: 0,
            });
        }

        // Seed the transcript: system context, prior turns, the question.
        let system = match self
            .context
            .system_context(request.datasource_id.as_deref())
            .await
        {
            Ok(context) => Some(context).filter(|c| !c.trim().is_empty()),
            Err(err) => {
                tracing::warn!(%run_id, error = %err, "context provider failed; continuing without");
                None
            }
        };

        let mut transcript: Vec<Message> = self.history.prior_turns(&request.session_id).await;
        transcript.push(Message::user_text(user_text));

        let tool_schemas = builtin_tool_schemas();
        let mut citations: Vec<Citation> = Vec::new();
        let mut rounds_used = 0u32;

        for round in 1..=max_rounds {
            if request.cancel.is_cancelled() {
                return Err(cancelled_error());
            }
            rounds_used = round;

            request
                .sink
                .emit(ProgressEvent::ReasoningStarted { round })
                .await;

            // Pass 1: discover tool calls. This drains the stream, so the
            // answer (if any) is re-streamed by a second pass below.
            let discovery_request = self.build_request(&transcript, system.clone(), true, &tool_schemas);
            let stream = self
                .model
                .stream_message(discovery_request)
                .await
                .map_err(OrchestrationError::from)?;
            let outcome = self.run_pass(stream, &request.cancel, None).await?;

            if let Some(failure) = &outcome.stream_failure
                && !outcome.message.has_tool_calls()
            {
                // Nothing recoverable came out of the stream.
                return Err(GatewayError::new(failure.message.clone()).into());
            }

            if !outcome.message.has_tool_calls() {
                // No tool calls: realize the settled answer with an
                // answer-only re-query and stream it chunk by chunk.
                let answer = self
                    .answer_pass(&transcript, system.clone(), request)
                    .await?;
                return self
                    .complete(request, user_text, answer, citations, rounds_used)
                    .await;
            }

            tracing::debug!(
                %run_id,
                round,
                calls = outcome.message.tool_calls.len(),
                "executing tool calls"
            );

            let (pair, round_citations) = self
                .execute_round_calls(&outcome.message, request)
                .await?;
            citations.extend(round_citations);

            // The ToolUse message and its ToolResult message land in the
            // transcript together, in that order.
            transcript.push(pair.0);
            transcript.push(pair.1);
        }

        // Round budget exhausted: one last answer-only attempt.
        tracing::warn!(%run_id, max_rounds, "round budget exhausted; attempting partial answer");
        transcript.push(Message::user_text(PARTIAL_ANSWER_NUDGE));

        match self.answer_pass(&transcript, system.clone(), request).await {
            Ok(answer) if !answer.trim().is_empty() => {
                self.complete(request, user_text, answer, citations, rounds_used)
                    .await
            }
            Ok(_) | Err(_) => Err(OrchestrationError::round_budget(max_rounds, "")),
        }
    }

    /// Execute one round's tool calls sequentially, in call order.
    ///
    /// Returns the assistant/user message pair to append atomically, plus
    /// any citations gathered from successful query calls.
    async fn execute_round_calls(
        &self,
        message: &AccumulatedMessage,
        request: &RunRequest,
    ) -> Result<((Message, Message), Vec<Citation>), OrchestrationError> {
        let mut assistant_blocks: Vec<ContentBlock> = Vec::new();
        if !message.answer_text.trim().is_empty() {
            assistant_blocks.push(ContentBlock::Text {
                text: message.answer_text.clone(),
            });
        }
        for call in &message.tool_calls {
            assistant_blocks.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            });
        }

        let mut result_blocks: Vec<ContentBlock> = Vec::new();
        let mut citations = Vec::new();

        for call in &message.tool_calls {
            if request.cancel.is_cancelled() {
                return Err(cancelled_error());
            }

            request
                .sink
                .emit(ProgressEvent::ToolCallStarted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                })
                .await;

            let result = match validate_scope(call, request.datasource_id.as_deref()) {
                Ok(()) => self.tools.call(&call.name, &call.input).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(value) => {
                    let bounded = bound_result(
                        &value,
                        self.config.row_cap,
                        self.config.result_byte_ceiling,
                    );
                    if bounded.truncated {
                        tracing::debug!(
                            tool = %call.name,
                            total_rows = ?bounded.total_rows,
                            kept_rows = ?bounded.kept_rows,
                            "tool result truncated"
                        );
                    }

                    request
                        .sink
                        .emit(ProgressEvent::ToolCallCompleted {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            summary: summarize_result(&value),
                            is_error: false,
                        })
                        .await;

                    if let Some(citation) = citation_for(call) {
                        citations.push(citation);
                    }

                    result_blocks.push(ContentBlock::ToolResult {
                        tool_use_id: call.id.clone(),
                        content: bounded.content,
                        is_error: false,
                    });
                }
                Err(err) => {
                    tracing::warn!(tool = %call.name, error = %err, "tool call failed");
                    // The error payload is already bounded: kind, message, status.
                    let payload = err.as_result_payload();

                    request
                        .sink
                        .emit(ProgressEvent::ToolCallCompleted {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            summary: payload.clone(),
                            is_error: true,
                        })
                        .await;

                    // The failure goes back to the model as ordinary tool
                    // output so it can correct its arguments next round.
                    result_blocks.push(ContentBlock::ToolResult {
                        tool_use_id: call.id.clone(),
                        content: payload.to_string(),
                        is_error: true,
                    });
                }
            }
        }

        let assistant = Message {
            role: "assistant".to_string(),
            content: assistant_blocks,
        };
        let results = Message {
            role: "user".to_string(),
            content: result_blocks,
        };
        Ok(((assistant, results), citations))
    }

    /// Answer-only re-query: stream the settled answer chunk by chunk.
    async fn answer_pass(
        &self,
        transcript: &[Message],
        system: Option<String>,
        request: &RunRequest,
    ) -> Result<String, OrchestrationError> {
        let answer_request = self.build_request(transcript, system, false, &[]);
        let stream = self
            .model
            .stream_message(answer_request)
            .await
            .map_err(OrchestrationError::from)?;

        request.sink.emit(ProgressEvent::AnswerStarted).await;
        let outcome = self
            .run_pass(stream, &request.cancel, Some(&request.sink))
            .await?;

        if let Some(failure) = outcome.stream_failure
            && outcome.message.answer_text.trim().is_empty()
        {
            return Err(GatewayError::new(failure.message).into());
        }

        Ok(outcome.message.answer_text)
    }

    /// Drive one accumulator pass over a fragment stream. When `sink` is
    /// given, answer deltas are relayed as `answer_chunk` events.
    async fn run_pass(
        &self,
        stream: crate::gateway::EventStream,
        cancel: &CancellationToken,
        sink: Option<&ProgressSink>,
    ) -> Result<PassOutcome, OrchestrationError> {
        let mut accumulator = StreamAccumulator::new();
        let mut stream = pin!(stream);
        let mut stream_failure: Option<GatewayError> = None;
        let mut stream_errors = 0u32;
        let chunk_timeout = Duration::from_secs(STREAM_CHUNK_TIMEOUT_SECS);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled_error()),
                item = tokio::time::timeout(chunk_timeout, stream.next()) => item,
            };

            let event = match next {
                Ok(Some(Ok(event))) => event,
                Ok(Some(Err(err))) => {
                    stream_errors += 1;
                    tracing::warn!(error = %err, "stream fragment error");
                    stream_failure.get_or_insert(err);
                    if stream_errors >= MAX_STREAM_ERRORS {
                        break;
                    }
                    continue;
                }
                Ok(None) => break,
                Err(_) => {
                    stream_failure.get_or_insert(GatewayError::new(format!(
                        "Stream stalled: no fragment for {STREAM_CHUNK_TIMEOUT_SECS}s"
                    )));
                    break;
                }
            };

            for signal in accumulator.observe(&event) {
                if let AccumulatorSignal::AnswerDelta(text) = signal
                    && let Some(sink) = sink
                {
                    sink.emit(ProgressEvent::AnswerChunk { text }).await;
                }
            }
        }

        Ok(PassOutcome {
            message: accumulator.finish(),
            stream_failure,
        })
    }

    fn build_request(
        &self,
        transcript: &[Message],
        system: Option<String>,
        with_tools: bool,
        tool_schemas: &[crate::models::Tool],
    ) -> MessageRequest {
        MessageRequest {
            model: self.model.model().to_string(),
            messages: transcript.to_vec(),
            max_tokens: crate::config::DEFAULT_MAX_OUTPUT_TOKENS,
            system,
            tools: if with_tools {
                Some(tool_schemas.to_vec())
            } else {
                None
            },
            tool_choice: if with_tools {
                Some(json!({ "type": "auto" }))
            } else {
                None
            },
            stream: Some(true),
            temperature: None,
        }
    }

    /// Finish a successful run: final events, history append, outcome.
    async fn complete(
        &self,
        request: &RunRequest,
        user_text: &str,
        answer: String,
        citations: Vec<Citation>,
        rounds_used: u32,
    ) -> Result<RunOutcome, OrchestrationError> {
        request
            .sink
            .emit(ProgressEvent::AnswerComplete {
                text: answer.clone(),
                citations: citations.clone(),
            })
            .await;

        self.history
            .record_turn(
                &request.session_id,
                Turn {
                    user_text: user_text.to_string(),
                    answer_text: answer.clone(),
                    at: chrono::Utc::now(),
                },
            )
            .await;

        Ok(RunOutcome {
            answer_text: answer,
            citations,
            rounds_used,
        })
    }
}

#[cfg(test)]
mod tests;
