use serde::Deserialize;
use std::path::PathBuf;

use crate::core::audio::{AudioConfig, CompressorConfig, VadConfig};
use crate::core::connection::{IceServer, ReconnectionConfig};
use crate::core::network::NetworkMonitorConfig;
use crate::core::protocol::{InputAudioTranscription, TurnDetection};
use crate::core::recovery::RecoveryConfig;
use crate::core::timeout::SessionTimeoutConfig;

use super::ClientConfig;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present in
/// the file override environment variables and defaults.
///
/// # Example YAML structure
/// ```yaml
/// endpoints:
///   token_url: "https://voice.example.com/api/session"
///   realtime_url: "https://api.openai.com/v1/realtime"
///   web_search_url: "https://voice.example.com/api/search"
///   model: "gpt-4o-realtime-preview"
///   request_timeout_seconds: 10
///
/// logging:
///   level: "debug"
///
/// protocol:
///   voice: "alloy"
///   instructions: "You are a helpful voice assistant."
///   transcription_model: "whisper-1"
///   turn_detection:
///     type: server_vad
///     silence_duration_ms: 600
///
/// connection:
///   connect_timeout_seconds: 15
///   ice_servers:
///     - urls: ["stun:stun.l.google.com:19302"]
///   reconnection:
///     max_attempts: 5
///     initial_delay_ms: 1000
///
/// audio:
///   input_gain: 1.2
///   vad:
///     threshold: 0.02
///
/// network:
///   sample_interval_ms: 2000
///
/// recovery:
///   failure_threshold: 3
///   cooldown_ms: 60000
///
/// session_timeout:
///   max_session_duration_ms: 1800000
///   warning_minutes: [5, 3, 1]
///
/// session:
///   context_window: 10
///   token_refresh_margin_seconds: 60
///   store_path: "/var/lib/waav/session.json"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub endpoints: Option<EndpointsYaml>,
    pub logging: Option<LoggingYaml>,
    pub protocol: Option<ProtocolYaml>,
    pub connection: Option<ConnectionYaml>,
    pub audio: Option<AudioYaml>,
    pub network: Option<NetworkMonitorConfig>,
    pub recovery: Option<RecoveryConfig>,
    pub session_timeout: Option<SessionTimeoutConfig>,
    pub session: Option<SessionYaml>,
}

/// Collaborator endpoints from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EndpointsYaml {
    pub token_url: Option<String>,
    pub realtime_url: Option<String>,
    pub web_search_url: Option<String>,
    pub model: Option<String>,
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingYaml {
    pub level: Option<String>,
}

/// Session configuration sent to the remote service
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProtocolYaml {
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub modalities: Option<Vec<String>>,
    pub transcription_model: Option<String>,
    pub turn_detection: Option<TurnDetection>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ConnectionYaml {
    pub connect_timeout_seconds: Option<u64>,
    pub ice_servers: Option<Vec<IceServer>>,
    pub data_channel_label: Option<String>,
    pub reconnection: Option<ReconnectionConfig>,
}

/// Audio pipeline settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AudioYaml {
    pub sample_rate: Option<u32>,
    pub frame_size: Option<usize>,
    pub input_gain: Option<f32>,
    pub output_gain: Option<f32>,
    pub highpass_cutoff_hz: Option<f32>,
    pub compressor: Option<CompressorConfig>,
    pub vad: Option<VadConfig>,
    pub quality_report_interval_ms: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub context_window: Option<usize>,
    pub token_refresh_margin_seconds: Option<u64>,
    pub store_path: Option<String>,
    pub spoken_wait_timeout_seconds: Option<u64>,
}

impl YamlConfig {
    /// Load YAML configuration from a file
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }

    /// Overlay every value present in the file onto `config`.
    pub fn apply(self, config: &mut ClientConfig) {
        if let Some(endpoints) = self.endpoints {
            set(&mut config.token_url, endpoints.token_url);
            set(&mut config.realtime_url, endpoints.realtime_url);
            set_opt(&mut config.web_search_url, endpoints.web_search_url);
            set_opt(&mut config.model, endpoints.model);
            set(
                &mut config.request_timeout_seconds,
                endpoints.request_timeout_seconds,
            );
        }

        if let Some(logging) = self.logging {
            set(&mut config.log_level, logging.level);
        }

        if let Some(protocol) = self.protocol {
            let session = &mut config.protocol;
            set_opt(&mut session.voice, protocol.voice);
            set_opt(&mut session.instructions, protocol.instructions);
            set_opt(&mut session.modalities, protocol.modalities);
            set_opt(&mut session.turn_detection, protocol.turn_detection);
            set_opt(&mut session.temperature, protocol.temperature);
            if let Some(model) = protocol.transcription_model {
                session.input_audio_transcription = Some(InputAudioTranscription { model });
            }
        }

        if let Some(connection) = self.connection {
            set(
                &mut config.connect_timeout_seconds,
                connection.connect_timeout_seconds,
            );
            set(&mut config.connection.ice_servers, connection.ice_servers);
            set(
                &mut config.connection.data_channel_label,
                connection.data_channel_label,
            );
            set(&mut config.connection.reconnection, connection.reconnection);
        }

        if let Some(audio) = self.audio {
            apply_audio(&mut config.audio, audio);
        }

        set(&mut config.network, self.network);
        set(&mut config.recovery, self.recovery);
        set(&mut config.session_timeout, self.session_timeout);

        if let Some(session) = self.session {
            set(&mut config.context_window, session.context_window);
            set(
                &mut config.token_refresh_margin_seconds,
                session.token_refresh_margin_seconds,
            );
            set_opt(
                &mut config.session_store_path,
                session.store_path.map(PathBuf::from),
            );
            set(
                &mut config.spoken_wait_timeout_seconds,
                session.spoken_wait_timeout_seconds,
            );
        }
    }
}

fn apply_audio(audio: &mut AudioConfig, yaml: AudioYaml) {
    set(&mut audio.sample_rate, yaml.sample_rate);
    set(&mut audio.frame_size, yaml.frame_size);
    set(&mut audio.input_gain, yaml.input_gain);
    set(&mut audio.output_gain, yaml.output_gain);
    set(&mut audio.highpass_cutoff_hz, yaml.highpass_cutoff_hz);
    set(&mut audio.compressor, yaml.compressor);
    set(&mut audio.vad, yaml.vad);
    set(
        &mut audio.quality_report_interval_ms,
        yaml.quality_report_interval_ms,
    );
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn set_opt<T>(target: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *target = value;
    }
}
