//! Progress events emitted by the engine to the caller.
//!
//! Events flow one way over a channel. Emission is always best-effort: a
//! closed or full channel must never abort the run, so failures are logged
//! and swallowed.

use serde_json::Value;

/// A source reference attached to the final answer, derived from the
/// run's successful datasource queries.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Citation {
    pub tool: String,
    pub datasource_id: Option<String>,
    pub fields: Vec<String>,
}

/// Events emitted during one orchestration run, in the order the caller
/// should expect them.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A reasoning round is about to ask the model. Once per round.
    ReasoningStarted { round: u32 },

    /// A tool call is about to execute.
    ToolCallStarted {
        id: String,
        name: String,
        input: Value,
    },

    /// A tool call finished. `summary` is bounded: a handful of top-level
    /// keys, never the full payload. Correlated to its start by `id`.
    ToolCallCompleted {
        id: String,
        name: String,
        summary: Value,
        is_error: bool,
    },

    /// Answer text is about to stream. Once per run.
    AnswerStarted,

    /// An incremental answer fragment, in arrival order.
    AnswerChunk { text: String },

    /// The run finished; carries the full settled answer.
    AnswerComplete {
        text: String,
        citations: Vec<Citation>,
    },

    /// Terminal failure. Carries a user-facing message, recovery hints,
    /// and whatever technical detail is available.
    Error {
        message: String,
        suggestions: Vec<String>,
        detail: Option<String>,
    },
}

/// Best-effort sender for progress events.
///
/// Cloned freely; every emit that fails (receiver dropped, channel
/// closed) is logged at debug level and otherwise ignored.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: tokio::sync::mpsc::Sender<ProgressEvent>,
}

impl ProgressSender {
    #[must_use]
    pub fn new(tx: tokio::sync::mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }

    /// Create a sender/receiver pair with a reasonable buffer.
    #[must_use]
    pub fn channel() -> (Self, tokio::sync::mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        (Self::new(tx), rx)
    }

    /// Push an event. Never fails from the engine's point of view.
    pub async fn emit(&self, event: ProgressEvent) {
        if let Err(err) = self.tx.send(event).await {
            tracing::debug!("progress event dropped: {err}");
        }
    }
}

/// Optional sink wrapper used by the engine so an absent sink costs one
/// branch instead of a channel allocation.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    sender: Option<ProgressSender>,
}

impl ProgressSink {
    #[must_use]
    pub fn attached(sender: ProgressSender) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub async fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.sender {
            sender.emit(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_delivers_in_order() {
        let (sender, mut rx) = ProgressSender::channel();
        sender.emit(ProgressEvent::ReasoningStarted { round: 1 }).await;
        sender.emit(ProgressEvent::AnswerStarted).await;

        assert!(matches!(
            rx.recv().await,
            Some(ProgressEvent::ReasoningStarted { round: 1 })
        ));
        assert!(matches!(rx.recv().await, Some(ProgressEvent::AnswerStarted)));
    }

    #[tokio::test]
    async fn emit_survives_dropped_receiver() {
        let (sender, rx) = ProgressSender::channel();
        drop(rx);
        // Must not panic or error.
        sender
            .emit(ProgressEvent::AnswerChunk {
                text: "ignored".to_string(),
            })
            .await;
    }

    #[tokio::test]
    async fn disabled_sink_is_a_no_op() {
        let sink = ProgressSink::disabled();
        sink.emit(ProgressEvent::AnswerStarted).await;
    }
}
