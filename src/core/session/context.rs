//! Rolling conversation context and history reinjection.

use std::collections::VecDeque;

use super::model::ConversationMessage;

pub const DEFAULT_CONTEXT_WINDOW: usize = 10;

/// The last few messages of the conversation.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    limit: usize,
    messages: VecDeque<ConversationMessage>,
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_WINDOW)
    }
}

impl ConversationContext {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            messages: VecDeque::new(),
        }
    }

    /// Window over the tail of `messages`.
    pub fn from_messages(limit: usize, messages: &[ConversationMessage]) -> Self {
        let mut context = Self::new(limit);
        for message in messages {
            context.push(message.clone());
        }
        context
    }

    pub fn push(&mut self, message: ConversationMessage) {
        self.messages.push_back(message);
        while self.messages.len() > self.limit {
            self.messages.pop_front();
        }
    }

    pub fn messages(&self) -> impl Iterator<Item = &ConversationMessage> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// `Role: content` lines, oldest first.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.role.label(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Base instructions extended with the conversation so far.
    ///
    /// The realtime protocol does not reliably treat replayed items as
    /// history, so prior turns travel inside the instructions instead.
    pub fn augmented_instructions(&self, base: &str) -> String {
        if self.messages.is_empty() {
            return base.to_string();
        }
        let mut out = String::with_capacity(base.len() + 256);
        if !base.trim().is_empty() {
            out.push_str(base.trim_end());
            out.push_str("\n\n");
        }
        out.push_str("## Conversation so far\n");
        out.push_str(
            "The connection was refreshed. Continue the conversation naturally from where it \
             left off without greeting the user again.\n\n",
        );
        out.push_str(&self.transcript());
        out
    }
}
