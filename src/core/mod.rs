pub mod audio;
pub mod connection;
pub mod media;
pub mod network;
pub mod orchestrator;
pub mod protocol;
pub mod recovery;
pub mod session;
pub mod timeout;
pub mod tools;

// Re-export commonly used types for convenience
pub use audio::{AudioBackend, AudioConfig, AudioError, AudioEvent, AudioPipeline};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionManagerConfig, ConnectionState,
    PeerConnectionFactory, SdpSignaler,
};
pub use media::{MediaStream, MediaStreamTrack};
pub use network::{NetworkEvent, NetworkMonitor, NetworkMonitorConfig, NetworkQuality, QualityCategory};
pub use orchestrator::{
    OrchestratorConfig, OrchestratorDeps, OrchestratorEvent, VoiceSessionOrchestrator,
};
pub use protocol::{ClientEvent, ServerEvent, SessionConfig};
pub use recovery::{ErrorRecoveryCoordinator, RecoveryConfig, RecoveryEvent, RecoveryStrategy};
pub use session::{
    ConversationMessage, ConversationState, EphemeralToken, FileSessionStore,
    InMemorySessionStore, Session, SessionStore, TokenProvider,
};
pub use timeout::{SessionTimeoutConfig, SessionTimeoutCoordinator, TimeoutEvent};
pub use tools::{ToolExecutor, ToolRegistry, WebSearchTool};
