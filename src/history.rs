//! Conversation history: a bounded, append-only list of prior turns keyed
//! by session id. In-memory only; persistence across restarts is out of
//! scope.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::models::Message;

/// One completed user/assistant exchange.
#[derive(Debug, Clone)]
pub struct Turn {
    pub user_text: String,
    pub answer_text: String,
    pub at: DateTime<Utc>,
}

/// Read/append contract the engine uses to seed and record transcripts.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Prior turns for a session, oldest first, as transcript messages.
    async fn prior_turns(&self, session_id: &str) -> Vec<Message>;

    /// Record one finished turn. Append-only.
    async fn record_turn(&self, session_id: &str, turn: Turn);
}

/// Default in-memory store, bounded per session: the oldest turn is
/// evicted once the capacity is reached.
pub struct MemoryHistory {
    capacity: usize,
    sessions: Mutex<HashMap<String, VecDeque<Turn>>>,
}

impl MemoryHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new(20)
    }
}

#[async_trait::async_trait]
impl HistoryStore for MemoryHistory {
    async fn prior_turns(&self, session_id: &str) -> Vec<Message> {
        let sessions = self.sessions.lock().await;
        let Some(turns) = sessions.get(session_id) else {
            return Vec::new();
        };
        let mut messages = Vec::with_capacity(turns.len() * 2);
        for turn in turns {
            messages.push(Message::user_text(turn.user_text.clone()));
            messages.push(Message::assistant_text(turn.answer_text.clone()));
        }
        messages
    }

    async fn record_turn(&self, session_id: &str, turn: Turn) {
        let mut sessions = self.sessions.lock().await;
        let turns = sessions.entry(session_id.to_string()).or_default();
        if turns.len() >= self.capacity {
            turns.pop_front();
        }
        turns.push_back(turn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(n: usize) -> Turn {
        Turn {
            user_text: format!("question {n}"),
            answer_text: format!("answer {n}"),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn turns_come_back_as_paired_messages_oldest_first() {
        let store = MemoryHistory::new(10);
        store.record_turn("s1", turn(1)).await;
        store.record_turn("s1", turn(2)).await;

        let messages = store.prior_turns("s1").await;
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[0], Message::user_text("question 1"));
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let store = MemoryHistory::new(2);
        for n in 1..=3 {
            store.record_turn("s1", turn(n)).await;
        }
        let messages = store.prior_turns("s1").await;
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], Message::user_text("question 2"));
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let store = MemoryHistory::default();
        store.record_turn("a", turn(1)).await;
        assert!(store.prior_turns("b").await.is_empty());
    }
}
