//! Realtime protocol message types exchanged over the data channel.

pub mod events;
pub mod items;
pub mod session;

pub use events::{
    ApiError, ClientEvent, RateLimit, RateLimits, ResponseInfo, ServerEvent, SessionInfo,
};
pub use items::{ContentPart, ConversationItem, ItemContent};
pub use session::{
    InputAudioTranscription, ResponseConfig, SessionConfig, ToolDef, TurnDetection,
};
