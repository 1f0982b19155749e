use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::utils::time::now_ms;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while running a voice session.
#[derive(Debug, Clone, Error)]
pub enum VoiceError {
    /// Peer connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// SDP offer/answer exchange was rejected
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Transport-level network failure
    #[error("Network error: {0}")]
    Network(String),

    /// A token was expired before use
    #[error("Token expired: {0}")]
    TokenExpired(String),

    /// Token endpoint failure
    #[error("Token request failed: {0}")]
    TokenRequest(String),

    /// Data channel failure
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// Data channel closed while in use
    #[error("Data channel closed")]
    DataChannelClosed,

    /// Error reported by the remote service over the event protocol
    #[error("API error: {0}")]
    Api(String),

    /// Microphone access was refused
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// Audio device missing or busy
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    /// Audio processing is unavailable on this platform
    #[error("Audio not supported: {0}")]
    AudioNotSupported(String),

    /// Playback failed
    #[error("Audio playback error: {0}")]
    Playback(String),

    /// Session store failure
    #[error("Session persistence error: {0}")]
    Persistence(String),

    /// Tool call collaborator failure
    #[error("Tool call failed: {0}")]
    ToolCall(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Session state error
    #[error("Session error: {0}")]
    Session(String),
}

/// Result type for voice session operations.
pub type VoiceResult<T> = Result<T, VoiceError>;

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VoiceError::Timeout(err.to_string())
        } else {
            VoiceError::Network(err.to_string())
        }
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Failure taxonomy used for recovery strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionFailed,
    NetworkError,
    TokenExpired,
    MicrophonePermissionDenied,
    AudioNotSupported,
    AudioDeviceError,
    AudioPlaybackError,
    DataChannelError,
    DataChannelClosed,
    ApiError,
    SessionPauseFailed,
    SessionResumeFailed,
    SessionEndFailed,
}

impl ErrorKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::TokenExpired => "token_expired",
            ErrorKind::MicrophonePermissionDenied => "microphone_permission_denied",
            ErrorKind::AudioNotSupported => "audio_not_supported",
            ErrorKind::AudioDeviceError => "audio_device_error",
            ErrorKind::AudioPlaybackError => "audio_playback_error",
            ErrorKind::DataChannelError => "data_channel_error",
            ErrorKind::DataChannelClosed => "data_channel_closed",
            ErrorKind::ApiError => "api_error",
            ErrorKind::SessionPauseFailed => "session_pause_failed",
            ErrorKind::SessionResumeFailed => "session_resume_failed",
            ErrorKind::SessionEndFailed => "session_end_failed",
        }
    }

    /// Whether errors of this kind are recoverable unless flagged otherwise.
    pub fn default_recoverable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::MicrophonePermissionDenied | ErrorKind::ApiError
        )
    }

    /// Connection-class failures (transport is down or unusable).
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionFailed
                | ErrorKind::DataChannelError
                | ErrorKind::DataChannelClosed
        )
    }

    /// Audio-class failures (capture or device).
    pub fn is_audio(&self) -> bool {
        matches!(
            self,
            ErrorKind::MicrophonePermissionDenied
                | ErrorKind::AudioDeviceError
                | ErrorKind::AudioNotSupported
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized error shape emitted to subscribers and fed to recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// Taxonomy entry
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
    /// Whether automatic recovery may be attempted
    pub recoverable: bool,
    /// Free-form diagnostic payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl ClassifiedError {
    /// Create a classified error using the kind's default recoverability.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            recoverable: kind.default_recoverable(),
            details: None,
            timestamp: now_ms(),
        }
    }

    /// Override the recoverable flag.
    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Attach diagnostic details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl VoiceError {
    /// Map this error onto the recovery taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VoiceError::ConnectionFailed(_)
            | VoiceError::HandshakeFailed(_)
            | VoiceError::NotConnected
            | VoiceError::TokenRequest(_) => ErrorKind::ConnectionFailed,
            VoiceError::Network(_) | VoiceError::Timeout(_) => ErrorKind::NetworkError,
            VoiceError::TokenExpired(_) => ErrorKind::TokenExpired,
            VoiceError::DataChannel(_) => ErrorKind::DataChannelError,
            VoiceError::DataChannelClosed => ErrorKind::DataChannelClosed,
            VoiceError::Api(_)
            | VoiceError::ToolCall(_)
            | VoiceError::Serialization(_)
            | VoiceError::InvalidConfiguration(_)
            | VoiceError::Persistence(_)
            | VoiceError::Session(_) => ErrorKind::ApiError,
            VoiceError::PermissionDenied(_) => ErrorKind::MicrophonePermissionDenied,
            VoiceError::AudioDevice(_) => ErrorKind::AudioDeviceError,
            VoiceError::AudioNotSupported(_) => ErrorKind::AudioNotSupported,
            VoiceError::Playback(_) => ErrorKind::AudioPlaybackError,
        }
    }

    /// Build the normalized error shape.
    pub fn classify(&self) -> ClassifiedError {
        ClassifiedError::new(self.kind(), self.to_string())
    }
}
