//! Session identity, persistence and conversation context.

pub mod context;
pub mod model;
pub mod store;
pub mod token;

pub use context::{ConversationContext, DEFAULT_CONTEXT_WINDOW};
pub use model::{ConversationMessage, ConversationState, MessageRole, Session};
pub use store::{
    DEFAULT_MAX_SESSION_AGE, FileSessionStore, InMemorySessionStore, RestoreResult, SessionStore,
};
pub use token::{EphemeralToken, HttpTokenProvider, TokenProvider};
