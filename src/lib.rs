//! Resilient realtime voice session client.
//!
//! A [`VoiceSessionOrchestrator`] drives one speech-to-speech session over a
//! WebRTC peer connection: it mints tokens, connects, streams microphone audio,
//! interprets the remote event protocol, persists the conversation, and keeps
//! the session alive through network loss, token expiry and the service's
//! maximum session duration.
//!
//! The media plane (peer connection, audio devices) is reached through the
//! traits in [`core::connection`] and [`core::audio`] so the client can run on
//! any WebRTC stack.

pub mod config;
pub mod core;
pub mod errors;
pub mod utils;

// Re-export commonly used items for convenience
pub use config::ClientConfig;
pub use core::*;
pub use errors::{ClassifiedError, ErrorKind, VoiceError, VoiceResult};
