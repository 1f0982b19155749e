//! Audio platform seam: device capture, audio contexts and playback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::AudioError;
use crate::core::media::MediaStream;

/// Microphone acquisition constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: Option<u32>,
    pub channel_count: u16,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: Some(24000),
            channel_count: 1,
        }
    }
}

impl AudioConstraints {
    /// Least demanding constraints, used when a device rejects the defaults.
    pub fn fallback() -> Self {
        Self {
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
            sample_rate: None,
            channel_count: 1,
        }
    }
}

/// Audio context lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioContextState {
    Running,
    Suspended,
    Closed,
}

/// Decoded mono audio ready for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// An audio rendering context.
#[async_trait]
pub trait AudioContext: Send + Sync {
    fn state(&self) -> AudioContextState;

    fn sample_rate(&self) -> u32;

    async fn resume(&self) -> Result<(), AudioError>;

    async fn suspend(&self) -> Result<(), AudioError>;

    async fn close(&self);

    /// Schedule a buffer on a fresh source node; resolves when it finishes.
    async fn play(&self, buffer: AudioBuffer) -> Result<(), AudioError>;
}

/// Device access and context creation.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    async fn get_user_media(&self, constraints: &AudioConstraints)
    -> Result<MediaStream, AudioError>;

    async fn create_context(&self, sample_rate: u32) -> Result<Arc<dyn AudioContext>, AudioError>;

    /// Start delivering raw capture frames of `frame_size` samples from `stream`.
    async fn open_capture(
        &self,
        stream: &MediaStream,
        frame_size: usize,
    ) -> Result<mpsc::Receiver<Vec<f32>>, AudioError>;
}
