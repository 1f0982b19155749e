use std::sync::Arc;
use std::time::Duration;

use crate::core::audio::{AudioBackend, AudioConfig};
use crate::core::connection::{ConnectionManagerConfig, PeerConnectionFactory, SdpSignaler};
use crate::core::network::{NetworkInformationSource, NetworkMonitorConfig};
use crate::core::protocol::SessionConfig;
use crate::core::recovery::RecoveryConfig;
use crate::core::session::{DEFAULT_CONTEXT_WINDOW, SessionStore, TokenProvider};
use crate::core::timeout::SessionTimeoutConfig;
use crate::core::tools::ToolRegistry;

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Sent as `session.update` when the data channel opens
    pub session: SessionConfig,
    pub connection: ConnectionManagerConfig,
    pub audio: AudioConfig,
    pub network: NetworkMonitorConfig,
    pub recovery: RecoveryConfig,
    pub timeout: SessionTimeoutConfig,
    /// Messages kept for history reinjection and tool context
    pub context_window: usize,
    /// Refresh the token this long before it expires
    pub token_refresh_margin: Duration,
    /// How long to wait for the peer to report `connected`
    pub connect_timeout: Duration,
    /// Longest wait for an in-flight response before speaking anyway
    pub spoken_wait_timeout: Duration,
    pub timeout_warning_instructions: String,
    pub reconnected_instructions: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::minimal_default(),
            connection: ConnectionManagerConfig::default(),
            audio: AudioConfig::default(),
            network: NetworkMonitorConfig::default(),
            recovery: RecoveryConfig::default(),
            timeout: SessionTimeoutConfig::default(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            token_refresh_margin: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(15),
            spoken_wait_timeout: Duration::from_secs(20),
            timeout_warning_instructions: "Briefly tell the user you need a moment to refresh \
                                           the connection and will be right back."
                .to_string(),
            reconnected_instructions: "Briefly tell the user you're back and ready to continue \
                                       where you left off."
                .to_string(),
        }
    }
}

/// Collaborators injected into the orchestrator.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub token_provider: Arc<dyn TokenProvider>,
    pub session_store: Arc<dyn SessionStore>,
    pub peer_factory: Arc<dyn PeerConnectionFactory>,
    pub signaler: Arc<dyn SdpSignaler>,
    pub audio_backend: Arc<dyn AudioBackend>,
    pub network_info: Option<Arc<dyn NetworkInformationSource>>,
    pub tools: ToolRegistry,
}
