//! Environment variable overrides.
//!
//! Every variable is `WAAV_`-prefixed. Unset or empty variables leave the
//! current value alone; malformed numbers are reported as errors.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::core::protocol::InputAudioTranscription;

use super::ClientConfig;

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid value for {name}: {e}").into()),
        None => Ok(None),
    }
}

fn parse_bool(name: &str) -> Result<Option<bool>, Box<dyn std::error::Error>> {
    match var(name).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(Some(true)),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(Some(false)),
        Some(v) => Err(format!("Invalid value for {name}: {v}").into()),
        None => Ok(None),
    }
}

/// Apply `WAAV_*` environment variables on top of `config`.
pub fn apply_env(config: &mut ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Endpoints
    if let Some(url) = var("WAAV_TOKEN_URL") {
        config.token_url = url;
    }
    if let Some(url) = var("WAAV_REALTIME_URL") {
        config.realtime_url = url;
    }
    if let Some(url) = var("WAAV_WEB_SEARCH_URL") {
        config.web_search_url = Some(url);
    }
    if let Some(model) = var("WAAV_MODEL") {
        config.model = Some(model);
    }
    if let Some(timeout) = parse_var("WAAV_REQUEST_TIMEOUT_SECONDS")? {
        config.request_timeout_seconds = timeout;
    }
    if let Some(level) = var("WAAV_LOG_LEVEL") {
        config.log_level = level;
    }

    // Protocol
    if let Some(voice) = var("WAAV_VOICE") {
        config.protocol.voice = Some(voice);
    }
    if let Some(instructions) = var("WAAV_INSTRUCTIONS") {
        config.protocol.instructions = Some(instructions);
    }
    if let Some(model) = var("WAAV_TRANSCRIPTION_MODEL") {
        config.protocol.input_audio_transcription = Some(InputAudioTranscription { model });
    }
    if let Some(temperature) = parse_var("WAAV_TEMPERATURE")? {
        config.protocol.temperature = Some(temperature);
    }

    // Connection
    if let Some(timeout) = parse_var("WAAV_CONNECT_TIMEOUT_SECONDS")? {
        config.connect_timeout_seconds = timeout;
    }
    if let Some(enabled) = parse_bool("WAAV_RECONNECT_ENABLED")? {
        config.connection.reconnection.enabled = enabled;
    }
    if let Some(attempts) = parse_var("WAAV_RECONNECT_MAX_ATTEMPTS")? {
        config.connection.reconnection.max_attempts = attempts;
    }

    // Session
    if let Some(minutes) = parse_var::<u64>("WAAV_MAX_SESSION_MINUTES")? {
        config.session_timeout.max_session_duration_ms = minutes * 60 * 1000;
    }
    if let Some(window) = parse_var("WAAV_CONTEXT_WINDOW")? {
        config.context_window = window;
    }
    if let Some(margin) = parse_var("WAAV_TOKEN_REFRESH_MARGIN_SECONDS")? {
        config.token_refresh_margin_seconds = margin;
    }
    if let Some(path) = var("WAAV_SESSION_STORE_PATH") {
        config.session_store_path = Some(PathBuf::from(path));
    }

    Ok(())
}
