//! Stream accumulation: reduces one pass of model fragments into answer
//! text and completed tool calls.
//!
//! The fragment protocol correlates a block's start with its deltas only
//! through the zero-based block `index`; deltas never repeat the tool-use
//! id. The accumulator keeps an explicit index-to-buffer table for the
//! lifetime of one pass and resolves every delta through it.
//!
//! One instance covers exactly one pass over one stream. Consuming the
//! stream is destructive, so the engine runs a fresh accumulator against a
//! fresh (equivalent) stream when it needs a second pass.

use std::collections::HashMap;

use serde_json::Value;

use crate::models::{ContentBlockStart, Delta, StreamEvent, ToolCall};

/// Progress phase derived purely from fragment kind. Never invented,
/// only detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Reasoning,
    ToolCalls,
    Answer,
    Complete,
}

/// Signals surfaced to the caller while a pass is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum AccumulatorSignal {
    PhaseChanged(Phase),
    /// An incremental piece of answer text, in arrival order.
    AnswerDelta(String),
}

/// Open tool-use block, keyed externally by its stream index.
#[derive(Debug, Clone)]
struct ToolUseBuffer {
    id: String,
    name: String,
    /// Input declared at block start (usually empty or partial).
    start_input: Value,
    /// Raw JSON fragments concatenated across deltas.
    raw_json: String,
}

impl ToolUseBuffer {
    /// Settle the buffer into a tool call: parse the accumulated JSON and
    /// merge it over the block-start input. A parse failure keeps the
    /// start input; the call is never dropped.
    fn settle(self) -> Option<ToolCall> {
        let input = if self.raw_json.trim().is_empty() {
            self.start_input
        } else if let Some(parsed) = parse_input_buffer(&self.raw_json) {
            merge_inputs(self.start_input, parsed)
        } else {
            tracing::warn!(
                tool = %self.name,
                buffer = %self.raw_json,
                "tool input buffer failed to parse; keeping block-start input"
            );
            self.start_input
        };
        ToolCall::new(self.id, self.name, input)
    }
}

/// Rescue parsing for an accumulated input buffer: direct JSON first, then
/// the envelope pipeline (fences, double-encoding, balanced segment).
fn parse_input_buffer(buffer: &str) -> Option<Value> {
    crate::envelope::normalize_body(buffer).filter(|v| !v.is_string())
}

/// Merge a parsed delta-input over the block-start input. Object keys from
/// the delta side win; non-object pairs resolve to the delta side.
fn merge_inputs(start: Value, parsed: Value) -> Value {
    match (start, parsed) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                base.insert(key, value);
            }
            Value::Object(base)
        }
        (_, parsed) => parsed,
    }
}

/// Result of a completed pass.
#[derive(Debug, Clone)]
pub struct AccumulatedMessage {
    pub answer_text: String,
    pub tool_calls: Vec<ToolCall>,
    pub phase: Phase,
    /// Whether the stream delivered its `message_stop` marker.
    pub done: bool,
}

impl AccumulatedMessage {
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Accumulator for one pass over one fragment stream.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    phase: Option<Phase>,
    answer: String,
    open: HashMap<u32, ToolUseBuffer>,
    /// Stream indexes in block-start order, so settled calls keep the
    /// order the model issued them in.
    order: Vec<u32>,
    completed: Vec<(u32, ToolCall)>,
    done: bool,
}

impl StreamAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase.unwrap_or(Phase::Reasoning)
    }

    /// Feed one fragment. Returns signals for progress reporting.
    pub fn observe(&mut self, event: &StreamEvent) -> Vec<AccumulatorSignal> {
        let mut signals = Vec::new();

        match event {
            StreamEvent::MessageStart { .. } => {
                self.transition(Phase::Reasoning, &mut signals);
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlockStart::Text { text } => {
                    self.transition(Phase::Answer, &mut signals);
                    if !text.is_empty() {
                        self.answer.push_str(text);
                        signals.push(AccumulatorSignal::AnswerDelta(text.clone()));
                    }
                }
                ContentBlockStart::ToolUse { id, name, input } => {
                    self.transition(Phase::ToolCalls, &mut signals);
                    if self.open.contains_key(index) {
                        tracing::warn!(index, "duplicate tool-use block start; replacing buffer");
                    } else {
                        self.order.push(*index);
                    }
                    self.open.insert(
                        *index,
                        ToolUseBuffer {
                            id: id.clone(),
                            name: name.clone(),
                            start_input: input.clone(),
                            raw_json: String::new(),
                        },
                    );
                }
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::TextDelta { text } => {
                    self.transition(Phase::Answer, &mut signals);
                    if !text.is_empty() {
                        self.answer.push_str(text);
                        signals.push(AccumulatorSignal::AnswerDelta(text.clone()));
                    }
                }
                Delta::InputJsonDelta { partial_json } => {
                    // Deltas carry the index, not the id. Resolve through
                    // the table; an unknown index means the start fragment
                    // was lost, which we log rather than guess about.
                    if let Some(buffer) = self.open.get_mut(index) {
                        buffer.raw_json.push_str(partial_json);
                    } else {
                        tracing::warn!(index, "input delta for unknown block index; dropping");
                    }
                }
            },
            StreamEvent::ContentBlockStop { index } => {
                if let Some(buffer) = self.open.remove(index)
                    && let Some(call) = buffer.settle()
                {
                    self.completed.push((*index, call));
                }
            }
            StreamEvent::MessageStop => {
                self.done = true;
                self.transition(Phase::Complete, &mut signals);
            }
            StreamEvent::MessageDelta { .. } | StreamEvent::Ping => {}
        }

        signals
    }

    fn transition(&mut self, next: Phase, signals: &mut Vec<AccumulatorSignal>) {
        if self.phase != Some(next) {
            self.phase = Some(next);
            signals.push(AccumulatorSignal::PhaseChanged(next));
        }
    }

    /// End the pass. Buffers still open (stream ended mid-block) are
    /// settled with whatever they hold: a partial-but-valid tool call is
    /// preferred over silent loss.
    #[must_use]
    pub fn finish(mut self) -> AccumulatedMessage {
        for index in std::mem::take(&mut self.order) {
            if let Some(buffer) = self.open.remove(&index) {
                tracing::warn!(
                    index,
                    tool = %buffer.name,
                    "stream ended before content_block_stop; settling open buffer"
                );
                if let Some(call) = buffer.settle() {
                    self.completed.push((index, call));
                }
            }
        }

        self.completed.sort_by_key(|(index, _)| *index);
        AccumulatedMessage {
            answer_text: self.answer,
            tool_calls: self.completed.into_iter().map(|(_, call)| call).collect(),
            phase: self.phase.unwrap_or(Phase::Reasoning),
            done: self.done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageResponse, Usage};
    use serde_json::json;

    fn message_start() -> StreamEvent {
        StreamEvent::MessageStart {
            message: MessageResponse {
                id: "msg_1".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: "test".to_string(),
                stop_reason: None,
                usage: Usage::default(),
            },
        }
    }

    fn tool_start(index: u32, id: &str, name: &str, input: Value) -> StreamEvent {
        StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlockStart::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            },
        }
    }

    fn json_delta(index: u32, partial: &str) -> StreamEvent {
        StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::InputJsonDelta {
                partial_json: partial.to_string(),
            },
        }
    }

    fn text_delta(index: u32, text: &str) -> StreamEvent {
        StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::TextDelta {
                text: text.to_string(),
            },
        }
    }

    fn run_pass(events: Vec<StreamEvent>) -> (AccumulatedMessage, Vec<AccumulatorSignal>) {
        let mut acc = StreamAccumulator::new();
        let mut signals = Vec::new();
        for event in &events {
            signals.extend(acc.observe(event));
        }
        (acc.finish(), signals)
    }

    #[test]
    fn phases_follow_fragment_kinds() {
        let (message, signals) = run_pass(vec![
            message_start(),
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlockStart::Text {
                    text: String::new(),
                },
            },
            text_delta(0, "Hello"),
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageStop,
        ]);

        let phases: Vec<Phase> = signals
            .iter()
            .filter_map(|s| match s {
                AccumulatorSignal::PhaseChanged(p) => Some(*p),
                AccumulatorSignal::AnswerDelta(_) => None,
            })
            .collect();
        assert_eq!(phases, vec![Phase::Reasoning, Phase::Answer, Phase::Complete]);
        assert_eq!(message.answer_text, "Hello");
        assert!(message.done);
    }

    #[test]
    fn answer_deltas_sum_to_final_text() {
        let chunks = ["The ", "top ", "state ", "is ", "California."];
        let mut events = vec![message_start()];
        events.push(StreamEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlockStart::Text {
                text: String::new(),
            },
        });
        for chunk in chunks {
            events.push(text_delta(0, chunk));
        }
        events.push(StreamEvent::ContentBlockStop { index: 0 });
        events.push(StreamEvent::MessageStop);

        let (message, signals) = run_pass(events);
        let streamed: String = signals
            .iter()
            .filter_map(|s| match s {
                AccumulatorSignal::AnswerDelta(text) => Some(text.as_str()),
                AccumulatorSignal::PhaseChanged(_) => None,
            })
            .collect();
        assert_eq!(streamed, message.answer_text);
        assert_eq!(message.answer_text, "The top state is California.");
    }

    #[test]
    fn tool_input_split_across_deltas_reassembles_by_index() {
        let (message, _) = run_pass(vec![
            message_start(),
            tool_start(1, "call_1", "query-datasource", json!({})),
            json_delta(1, "{\"fields\": [\"state\","),
            json_delta(1, " \"sales\"], \"limit\""),
            json_delta(1, ": 5}"),
            StreamEvent::ContentBlockStop { index: 1 },
            StreamEvent::MessageStop,
        ]);

        assert_eq!(message.tool_calls.len(), 1);
        let call = &message.tool_calls[0];
        assert_eq!(call.name, "query-datasource");
        assert_eq!(call.input, json!({ "fields": ["state", "sales"], "limit": 5 }));
    }

    #[test]
    fn delta_input_merges_over_block_start_input() {
        let (message, _) = run_pass(vec![
            message_start(),
            tool_start(0, "call_1", "query-datasource", json!({ "datasourceId": "ds-7" })),
            json_delta(0, "{\"limit\": 10}"),
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageStop,
        ]);

        assert_eq!(
            message.tool_calls[0].input,
            json!({ "datasourceId": "ds-7", "limit": 10 })
        );
    }

    #[test]
    fn unparseable_buffer_keeps_start_input() {
        let (message, _) = run_pass(vec![
            message_start(),
            tool_start(0, "call_1", "read-metadata", json!({ "datasourceId": "ds-7" })),
            json_delta(0, "{\"broken\": "),
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageStop,
        ]);

        // Never dropped: falls back to the block-start input.
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].input, json!({ "datasourceId": "ds-7" }));
    }

    #[test]
    fn stream_ending_mid_block_still_surfaces_the_call() {
        let (message, _) = run_pass(vec![
            message_start(),
            tool_start(0, "call_1", "query-datasource", json!({})),
            json_delta(0, "{\"fields\": [\"sales\"]}"),
            // No ContentBlockStop, no MessageStop.
        ]);

        assert!(!message.done);
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].input, json!({ "fields": ["sales"] }));
    }

    #[test]
    fn multiple_tool_calls_keep_issue_order() {
        let (message, _) = run_pass(vec![
            message_start(),
            tool_start(0, "call_a", "read-metadata", json!({})),
            json_delta(0, "{\"datasourceId\": \"ds-1\"}"),
            tool_start(1, "call_b", "query-datasource", json!({})),
            json_delta(1, "{\"fields\": [\"x\"]}"),
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::ContentBlockStop { index: 1 },
            StreamEvent::MessageStop,
        ]);

        let names: Vec<&str> = message.tool_calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["read-metadata", "query-datasource"]);
        assert_eq!(message.tool_calls[0].id, "call_a");
    }

    #[test]
    fn delta_for_unknown_index_is_dropped_not_misattributed() {
        let (message, _) = run_pass(vec![
            message_start(),
            tool_start(0, "call_a", "query-datasource", json!({ "limit": 1 })),
            json_delta(3, "{\"fields\": [\"x\"]}"),
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageStop,
        ]);

        assert_eq!(message.tool_calls[0].input, json!({ "limit": 1 }));
    }

    #[test]
    fn fenced_input_buffer_is_rescued() {
        let (message, _) = run_pass(vec![
            message_start(),
            tool_start(0, "call_1", "query-datasource", json!({})),
            json_delta(0, "```json\n{\"fields\": [\"sales\"]}\n```"),
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageStop,
        ]);

        assert_eq!(message.tool_calls[0].input, json!({ "fields": ["sales"] }));
    }
}
