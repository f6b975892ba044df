//! Wire types shared by the model gateway and the orchestration engine.
//!
//! The transcript types (`Message`, `ContentBlock`) and the streaming
//! fragment protocol (`StreamEvent` and friends) mirror the gateway's JSON
//! shapes directly, so everything here is serde-derived.

use serde::{Deserialize, Serialize};

// === Core Message Types ===

/// Request payload for one round against the model gateway.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MessageRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// A transcript message with role and content blocks.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl Message {
    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    #[must_use]
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }
}

/// A single content block inside a message.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// Tool definition exposed to the model.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A complete tool invocation reconstructed from the stream.
///
/// Invariant: `id` and `name` are non-empty and `input` is a JSON object.
/// Use [`ToolCall::new`] to construct one; it is the only way the invariant
/// is enforced.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

impl ToolCall {
    /// Build a validated tool call. Non-object inputs are wrapped under a
    /// `"value"` key rather than rejected, since the model occasionally
    /// emits a bare scalar for single-argument tools.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Option<Self> {
        let id = id.into();
        let name = name.into();
        if id.is_empty() || name.is_empty() {
            return None;
        }
        let input = if input.is_object() {
            input
        } else if input.is_null() {
            serde_json::json!({})
        } else {
            serde_json::json!({ "value": input })
        };
        Some(Self { id, name, input })
    }
}

/// Non-streaming response payload (used by `message_start` fragments).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MessageResponse {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

/// Token usage metadata for a response.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

// === Streaming Structures ===

/// Streaming fragment kinds emitted by the model gateway.
///
/// The `index` on block-scoped fragments is the only join key between a
/// block's start and its later deltas: delta fragments do not repeat the
/// tool-use id.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageResponse },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: u32,
        content_block: ContentBlockStart,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: u32, delta: Delta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: u32 },
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: MessageDelta,
        usage: Option<Usage>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
}

/// Content block types used in streaming starts.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type")]
pub enum ContentBlockStart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value, // usually empty or partial
    },
}

/// Delta events emitted during streaming responses.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type")]
pub enum Delta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

/// Delta payload for message-level updates.
#[derive(Debug, Deserialize, Clone)]
pub struct MessageDelta {
    pub stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_call_rejects_empty_id_and_name() {
        assert!(ToolCall::new("", "query-datasource", json!({})).is_none());
        assert!(ToolCall::new("call_1", "", json!({})).is_none());
    }

    #[test]
    fn tool_call_wraps_non_object_input() {
        let call = ToolCall::new("call_1", "read-metadata", json!("sales")).unwrap();
        assert_eq!(call.input, json!({ "value": "sales" }));

        let call = ToolCall::new("call_2", "read-metadata", serde_json::Value::Null).unwrap();
        assert_eq!(call.input, json!({}));
    }

    #[test]
    fn stream_event_round_trips_tagged_json() {
        let raw = json!({
            "type": "content_block_start",
            "index": 1,
            "content_block": {
                "type": "tool_use",
                "id": "call_9",
                "name": "query-datasource",
                "input": {}
            }
        });
        let event: StreamEvent = serde_json::from_value(raw).unwrap();
        match event {
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlockStart::ToolUse { id, name, .. },
            } => {
                assert_eq!(index, 1);
                assert_eq!(id, "call_9");
                assert_eq!(name, "query-datasource");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn tool_result_block_serializes_is_error() {
        let block = ContentBlock::ToolResult {
            tool_use_id: "call_1".to_string(),
            content: "{\"error\":{\"message\":\"boom\"}}".to_string(),
            is_error: true,
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "tool_result");
        assert_eq!(value["is_error"], true);
    }
}
