use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::token::EphemeralToken;
use crate::core::connection::ConnectionState;
use crate::utils::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn label(&self) -> &'static str {
        match self {
            MessageRole::User => "User",
            MessageRole::Assistant => "Assistant",
            MessageRole::System => "System",
        }
    }
}

/// One turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub role: MessageRole,
    pub content: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            role,
            content: content.into(),
            timestamp: now_ms(),
        }
    }

    /// Message keyed by the protocol item id, when there is one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Conversation turn-taking state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    #[default]
    Idle,
    Listening,
    Processing,
    Speaking,
    Interrupted,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Idle => "idle",
            ConversationState::Listening => "listening",
            ConversationState::Processing => "processing",
            ConversationState::Speaking => "speaking",
            ConversationState::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub token: String,
    /// Milliseconds since the Unix epoch
    pub token_expires_at: u64,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub connection_state: ConnectionState,
    #[serde(default)]
    pub conversation_state: ConversationState,
    #[serde(default)]
    pub reconnect_count: u32,
    pub created_at: u64,
    pub last_activity: u64,
    #[serde(default)]
    pub ended: bool,
}

impl Session {
    pub fn new(session_id: impl Into<String>, token: impl Into<String>, expires_at: u64) -> Self {
        let now = now_ms();
        Self {
            session_id: session_id.into(),
            token: token.into(),
            token_expires_at: expires_at,
            messages: Vec::new(),
            connection_state: ConnectionState::Disconnected,
            conversation_state: ConversationState::Idle,
            reconnect_count: 0,
            created_at: now,
            last_activity: now,
            ended: false,
        }
    }

    pub fn ephemeral_token(&self) -> EphemeralToken {
        EphemeralToken::new(&self.token, self.token_expires_at, &self.session_id)
    }

    pub fn touch(&mut self) {
        self.last_activity = now_ms();
    }

    pub fn age_ms(&self) -> u64 {
        now_ms().saturating_sub(self.created_at)
    }
}
