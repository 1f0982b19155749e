use crate::core::audio::AudioQualityReport;
use crate::core::connection::ConnectionState;
use crate::core::media::MediaStream;
use crate::core::network::NetworkQuality;
use crate::core::session::ConversationState;
use crate::errors::ClassifiedError;

/// Everything the orchestrator reports to its consumers.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    ConnectionStateChanged(ConnectionState),
    ConversationStateChanged(ConversationState),

    /// Session restored from persistence
    SessionResumed {
        session_id: String,
        message_count: usize,
    },
    SessionTimeoutWarning {
        remaining_minutes: u32,
    },
    /// Proactive reconnect before the duration limit started
    SessionReconnecting,
    SessionReconnected,
    Reconnecting {
        attempt: u32,
    },

    UserTranscript {
        text: String,
        is_final: bool,
    },
    AssistantTranscript {
        text: String,
        is_final: bool,
    },
    AssistantText {
        text: String,
        is_final: bool,
    },

    RecordingStarted,
    RecordingStopped,
    VoiceActivity {
        active: bool,
    },
    AudioQuality(AudioQualityReport),
    /// Assistant audio started playing
    PlaybackStarted,
    PlaybackStopped,
    RemoteAudio(MediaStream),

    FunctionCallStarted {
        call_id: String,
        name: String,
    },
    FunctionCallCompleted {
        call_id: String,
        name: String,
    },

    NetworkQualityChanged(NetworkQuality),
    RateLimits {
        remaining_tokens: Option<u64>,
    },

    FallbackModeActivated,
    Error(ClassifiedError),
}
