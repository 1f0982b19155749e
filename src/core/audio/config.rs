//! Audio pipeline configuration types

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::backend::AudioConstraints;

/// Dynamic range compressor settings (broadcast style by default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorConfig {
    pub threshold_db: f32,
    pub knee_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            threshold_db: -24.0,
            knee_db: 30.0,
            ratio: 12.0,
            attack_ms: 3.0,
            release_ms: 250.0,
        }
    }
}

/// Energy VAD settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub enabled: bool,

    /// RMS level above which the trailing window counts as speech
    pub threshold: f32,

    /// Continuous time below threshold before activity turns off (ms)
    pub silence_duration_ms: u32,

    /// Length of the trailing RMS window (ms)
    pub window_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.01,
            silence_duration_ms: 500,
            window_ms: 100,
        }
    }
}

/// Configuration for the capture and playback pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Context sample rate (Hz); the remote service speaks PCM16 at 24kHz
    pub sample_rate: u32,

    /// Samples per processing frame
    pub frame_size: usize,

    pub input_gain: f32,
    pub output_gain: f32,

    /// High-pass cutoff removing low-frequency rumble (Hz)
    pub highpass_cutoff_hz: f32,
    pub highpass_q: f32,

    pub compressor: CompressorConfig,
    pub vad: VadConfig,

    /// Audio time between quality reports (ms)
    pub quality_report_interval_ms: u32,

    /// Microphone constraints requested on initialization
    pub constraints: AudioConstraints,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            frame_size: 480, // 20ms at 24kHz
            input_gain: 1.0,
            output_gain: 1.0,
            highpass_cutoff_hz: 80.0,
            highpass_q: 0.707,
            compressor: CompressorConfig::default(),
            vad: VadConfig::default(),
            quality_report_interval_ms: 1000,
            constraints: AudioConstraints::default(),
        }
    }
}

impl AudioConfig {
    /// Duration of one frame in milliseconds
    pub fn frame_duration_ms(&self) -> f32 {
        (self.frame_size as f32 / self.sample_rate as f32) * 1000.0
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            anyhow::bail!("audio sample_rate must be greater than 0");
        }
        if self.frame_size == 0 {
            anyhow::bail!("audio frame_size must be greater than 0");
        }
        if self.input_gain < 0.0 || self.output_gain < 0.0 {
            anyhow::bail!("audio gains must not be negative");
        }
        if self.highpass_cutoff_hz <= 0.0 || self.highpass_cutoff_hz >= self.sample_rate as f32 / 2.0 {
            anyhow::bail!("high-pass cutoff must be between 0 and Nyquist");
        }
        if self.compressor.ratio < 1.0 {
            anyhow::bail!("compressor ratio must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.vad.threshold) {
            anyhow::bail!("VAD threshold must be between 0.0 and 1.0");
        }
        if self.vad.window_ms == 0 {
            anyhow::bail!("VAD window_ms must be greater than 0");
        }
        Ok(())
    }
}
