//! Conversation tracking.
//!
//! Every dispatched message, delivered or not, is archived into the thread
//! named by its conversation id. Threads live for the lifetime of the hub.
//! A flat archive index keeps global dispatch order so pairwise history can
//! be answered without scanning every thread.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message::{monotonic_ms, AgentRole, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Active,
    Closed,
}

/// Ordered archive of messages sharing a conversation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationThread {
    pub id: String,
    /// Participants in first-seen order
    pub participants: Vec<AgentRole>,
    /// Messages in dispatch order
    pub messages: Vec<Message>,
    pub created_at_ms: i64,
    pub status: ThreadStatus,
}

impl ConversationThread {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            participants: Vec::new(),
            messages: Vec::new(),
            created_at_ms: monotonic_ms(),
            status: ThreadStatus::Active,
        }
    }

    pub fn add_participant(&mut self, role: AgentRole) {
        if !self.participants.contains(&role) {
            self.participants.push(role);
        }
    }

    pub fn add_message(&mut self, message: Message) {
        self.add_participant(message.sender);
        self.add_participant(message.recipient);
        self.messages.push(message);
    }

    /// Most recent `limit` messages, oldest first.
    pub fn get_context(&self, limit: usize) -> Vec<Message> {
        let start = self.messages.len().saturating_sub(limit);
        self.messages[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_active(&self) -> bool {
        self.status == ThreadStatus::Active
    }
}

/// All conversation threads of one hub.
#[derive(Debug, Default)]
pub struct ConversationTracker {
    threads: HashMap<String, ConversationThread>,
    // (conversation id, index within thread) in archive order
    archive: Vec<(String, usize)>,
}

impl ConversationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `message` to its thread, creating the thread on first sight.
    pub fn archive(&mut self, message: Message) {
        let conversation_id = message.conversation_id.clone();
        let thread = self
            .threads
            .entry(conversation_id.clone())
            .or_insert_with(|| ConversationThread::new(conversation_id.clone()));
        let index = thread.messages.len();
        thread.add_message(message);
        self.archive.push((conversation_id, index));
    }

    pub fn get_context(&self, conversation_id: &str, limit: usize) -> Vec<Message> {
        self.threads
            .get(conversation_id)
            .map(|t| t.get_context(limit))
            .unwrap_or_default()
    }

    /// Last `limit` messages exchanged between `a` and `b`, in archive order.
    pub fn history_between(&self, a: AgentRole, b: AgentRole, limit: usize) -> Vec<Message> {
        let mut out: Vec<Message> = self
            .archive
            .iter()
            .rev()
            .filter_map(|(id, idx)| self.threads.get(id).and_then(|t| t.messages.get(*idx)))
            .filter(|m| {
                (m.sender == a && m.recipient == b) || (m.sender == b && m.recipient == a)
            })
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    pub fn thread(&self, conversation_id: &str) -> Option<ConversationThread> {
        self.threads.get(conversation_id).cloned()
    }

    /// Marks a thread closed. An unseen id gets an empty closed thread so
    /// later traffic joins a thread that is already closed.
    pub fn close(&mut self, conversation_id: &str) {
        self.threads
            .entry(conversation_id.to_string())
            .or_insert_with(|| ConversationThread::new(conversation_id))
            .status = ThreadStatus::Closed;
    }

    pub fn active_count(&self) -> usize {
        self.threads.values().filter(|t| t.is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn total_archived(&self) -> usize {
        self.archive.len()
    }
}
