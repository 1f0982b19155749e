use thiserror::Error;

use crate::errors::{ClassifiedError, ErrorKind, VoiceError};

/// Failures raised by the audio platform.
#[derive(Debug, Clone, Error)]
pub enum AudioError {
    /// The user or platform refused microphone access (`NotAllowedError`)
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No capture device available (`NotFoundError`)
    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    /// Device exists but cannot be opened (`NotReadableError`)
    #[error("Audio device busy: {0}")]
    DeviceBusy(String),

    /// Requested constraints cannot be satisfied
    #[error("Audio constraints not satisfiable: {0}")]
    Overconstrained(String),

    /// The platform has no audio processing support
    #[error("Audio not supported: {0}")]
    NotSupported(String),

    /// The audio context is closed
    #[error("Audio context closed")]
    ContextClosed,

    /// No microphone stream acquired yet
    #[error("Microphone not initialized")]
    NotInitialized,

    #[error("Playback failed: {0}")]
    Playback(String),
}

impl AudioError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AudioError::PermissionDenied(_) => ErrorKind::MicrophonePermissionDenied,
            AudioError::NotSupported(_) => ErrorKind::AudioNotSupported,
            AudioError::Playback(_) => ErrorKind::AudioPlaybackError,
            AudioError::DeviceNotFound(_)
            | AudioError::DeviceBusy(_)
            | AudioError::Overconstrained(_)
            | AudioError::ContextClosed
            | AudioError::NotInitialized => ErrorKind::AudioDeviceError,
        }
    }

    /// Permission denial is terminal; every other audio failure is recoverable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, AudioError::PermissionDenied(_))
    }

    pub fn classify(&self) -> ClassifiedError {
        ClassifiedError::new(self.kind(), self.to_string()).with_recoverable(self.is_recoverable())
    }
}

impl From<AudioError> for VoiceError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::PermissionDenied(m) => VoiceError::PermissionDenied(m),
            AudioError::NotSupported(m) => VoiceError::AudioNotSupported(m),
            AudioError::Playback(m) => VoiceError::Playback(m),
            other => VoiceError::AudioDevice(other.to_string()),
        }
    }
}
