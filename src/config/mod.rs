//! Configuration module for the voice session client
//!
//! This module loads client configuration from various sources: .env files,
//! environment variables and YAML files.
//! Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `env`: `WAAV_*` environment variable overrides
//! - `yaml`: YAML configuration file loading
//!
//! # Example
//! ```rust,no_run
//! use waav_voice_session::config::ClientConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ClientConfig::from_env()?;
//!
//! // Load from YAML file with environment variable base
//! let config_path = PathBuf::from("voice.yaml");
//! let config = ClientConfig::from_file(&config_path)?;
//!
//! println!("Minting tokens at {}", config.token_url);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

mod env;
mod yaml;

pub use yaml::YamlConfig;

use crate::core::audio::AudioConfig;
use crate::core::connection::ConnectionManagerConfig;
use crate::core::network::NetworkMonitorConfig;
use crate::core::orchestrator::OrchestratorConfig;
use crate::core::protocol::SessionConfig;
use crate::core::recovery::RecoveryConfig;
use crate::core::session::DEFAULT_CONTEXT_WINDOW;
use crate::core::timeout::SessionTimeoutConfig;
use crate::utils::validate_endpoint_url;

pub const DEFAULT_TOKEN_URL: &str = "http://localhost:3000/api/session";
pub const DEFAULT_REALTIME_URL: &str = "https://api.openai.com/v1/realtime";
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";

/// Client configuration
///
/// Contains everything needed to run a voice session:
/// - Collaborator endpoints (token minting, SDP handshake, web search)
/// - The session configuration sent to the remote service
/// - Per-component settings (connection, audio, network, recovery, timeout)
/// - Session persistence and context settings
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    // Endpoints
    pub token_url: String,
    pub realtime_url: String,
    pub web_search_url: Option<String>,
    pub model: Option<String>,
    /// Timeout for collaborator HTTP requests
    pub request_timeout_seconds: u64,

    /// Default `tracing` filter when `RUST_LOG` is unset
    pub log_level: String,

    /// Sent as `session.update` when the data channel opens
    pub protocol: SessionConfig,

    pub connection: ConnectionManagerConfig,
    /// How long to wait for the peer to report `connected`
    pub connect_timeout_seconds: u64,
    pub audio: AudioConfig,
    pub network: NetworkMonitorConfig,
    pub recovery: RecoveryConfig,
    pub session_timeout: SessionTimeoutConfig,

    // Session
    pub context_window: usize,
    pub token_refresh_margin_seconds: u64,
    pub spoken_wait_timeout_seconds: u64,
    /// JSON file for session persistence; in-memory when unset
    pub session_store_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token_url: DEFAULT_TOKEN_URL.to_string(),
            realtime_url: DEFAULT_REALTIME_URL.to_string(),
            web_search_url: None,
            model: Some(DEFAULT_MODEL.to_string()),
            request_timeout_seconds: 10,
            log_level: "info".to_string(),
            protocol: SessionConfig::minimal_default(),
            connection: ConnectionManagerConfig::default(),
            connect_timeout_seconds: 15,
            audio: AudioConfig::default(),
            network: NetworkMonitorConfig::default(),
            recovery: RecoveryConfig::default(),
            session_timeout: SessionTimeoutConfig::default(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            token_refresh_margin_seconds: 60,
            spoken_wait_timeout_seconds: 20,
            session_store_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from .env and environment variables
    ///
    /// Priority order (highest to lowest):
    /// 1. Environment variables (actual ENV vars override .env values)
    /// 2. .env file values
    /// 3. Default values
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        env::apply_env(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Loads .env file (if present), then applies environment variables on top
    /// of the defaults, and finally applies YAML overrides.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let yaml_config = YamlConfig::from_file(path)?;

        let mut config = Self::default();
        env::apply_env(&mut config)?;
        yaml_config.apply(&mut config);

        config.validate()?;
        Ok(config)
    }

    /// Check endpoints and component settings.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        validate_endpoint_url(&self.token_url).map_err(|e| format!("token_url: {e}"))?;
        validate_endpoint_url(&self.realtime_url).map_err(|e| format!("realtime_url: {e}"))?;
        if let Some(url) = &self.web_search_url {
            validate_endpoint_url(url).map_err(|e| format!("web_search_url: {e}"))?;
        }
        self.audio.validate()?;
        self.connection.reconnection.validate()?;

        if self.context_window == 0 {
            return Err("context_window must be greater than 0".into());
        }
        if self.session_timeout.max_session_duration_ms == 0 {
            return Err("max_session_duration_ms must be greater than 0".into());
        }
        if self.session_timeout.reconnect_buffer_ms >= self.session_timeout.max_session_duration_ms
        {
            return Err("reconnect_buffer_ms must be shorter than the maximum session".into());
        }
        if self.network.baseline_window == 0 {
            return Err("network baseline_window must be greater than 0".into());
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Orchestrator settings derived from this configuration.
    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            session: self.protocol.clone(),
            connection: self.connection.clone(),
            audio: self.audio.clone(),
            network: self.network.clone(),
            recovery: self.recovery.clone(),
            timeout: self.session_timeout.clone(),
            context_window: self.context_window,
            token_refresh_margin: Duration::from_secs(self.token_refresh_margin_seconds),
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            spoken_wait_timeout: Duration::from_secs(self.spoken_wait_timeout_seconds),
            ..OrchestratorConfig::default()
        }
    }
}
