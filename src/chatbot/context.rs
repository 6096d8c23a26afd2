//! Short-term conversation context, one buffer per chat.
//!
//! Buffers are bounded by message count; prompts are assembled newest-first
//! under a token budget and emitted in chronological order. Nothing is
//! persisted.

use std::collections::HashMap;

use tracing::debug;

use crate::chatbot::message::ChatMessage;

/// Rough token estimate: whitespace-separated words.
pub fn estimate_token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Recent messages of a single chat.
pub struct ContextBuffer {
    messages: Vec<ChatMessage>,
    index: HashMap<i64, usize>,
    max_messages: usize,
}

impl ContextBuffer {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            index: HashMap::new(),
            max_messages: max_messages.max(1),
        }
    }

    /// Add a message, dropping the oldest ones past the cap.
    pub fn add_message(&mut self, msg: ChatMessage) {
        let idx = self.messages.len();
        self.index.insert(msg.message_id, idx);
        self.messages.push(msg);

        if self.messages.len() > self.max_messages {
            let excess = self.messages.len() - self.max_messages;
            self.messages.drain(..excess);
            self.rebuild_index();
        }
    }

    /// Edit a message by ID.
    pub fn edit_message(&mut self, message_id: i64, new_text: &str) -> bool {
        if let Some(&idx) = self.index.get(&message_id)
            && idx < self.messages.len()
        {
            self.messages[idx].text = new_text.to_string();
            return true;
        }
        false
    }

    /// Get a message by ID.
    pub fn get_message(&self, message_id: i64) -> Option<&ChatMessage> {
        self.index
            .get(&message_id)
            .and_then(|&idx| self.messages.get(idx))
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Most recent messages that fit in `token_limit`, oldest first.
    pub fn assemble(&self, token_limit: usize) -> String {
        let mut lines = Vec::new();
        let mut total = 0;

        for msg in self.messages.iter().rev() {
            let line = msg.format();
            let tokens = estimate_token_count(&line);
            if total + tokens > token_limit {
                break;
            }
            total += tokens;
            lines.push(line);
        }

        lines.reverse();
        debug!("Assembled {} line(s), ~{} tokens", lines.len(), total);
        lines.join("\n")
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (idx, msg) in self.messages.iter().enumerate() {
            self.index.insert(msg.message_id, idx);
        }
    }
}

/// Context buffers for every chat the bot has seen.
pub struct ConversationStore {
    chats: HashMap<i64, ContextBuffer>,
    max_messages: usize,
}

impl ConversationStore {
    pub fn new(max_messages: usize) -> Self {
        Self {
            chats: HashMap::new(),
            max_messages,
        }
    }

    pub fn add_message(&mut self, msg: ChatMessage) {
        let max = self.max_messages;
        self.chats
            .entry(msg.chat_id)
            .or_insert_with(|| ContextBuffer::new(max))
            .add_message(msg);
    }

    pub fn edit_message(&mut self, chat_id: i64, message_id: i64, new_text: &str) -> bool {
        self.chats
            .get_mut(&chat_id)
            .is_some_and(|buf| buf.edit_message(message_id, new_text))
    }

    pub fn chat(&self, chat_id: i64) -> Option<&ContextBuffer> {
        self.chats.get(&chat_id)
    }

    pub fn assemble(&self, chat_id: i64, token_limit: usize) -> String {
        self.chats
            .get(&chat_id)
            .map(|buf| buf.assemble(token_limit))
            .unwrap_or_default()
    }
}
