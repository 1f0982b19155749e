//! Energy-based voice activity detection with release hysteresis.
//!
//! Activity turns on as soon as the trailing-window RMS exceeds the
//! threshold and turns off only after the level has stayed below the
//! threshold for the configured silence duration without interruption.
//! Time is measured in processed audio, not wall clock.

use std::collections::VecDeque;

use tracing::{debug, trace};

use super::config::VadConfig;

/// Result of VAD processing for a single audio frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VadResult {
    /// Whether activity is currently on
    pub is_speech: bool,
    /// Trailing-window RMS
    pub energy: f32,
    /// Activity turned on with this frame
    pub speech_start: bool,
    /// Activity turned off with this frame
    pub speech_end: bool,
    /// Continuous time below threshold (ms)
    pub silence_duration_ms: f64,
}

pub struct EnergyVad {
    config: VadConfig,
    sample_rate: u32,
    window_samples: usize,
    /// (sum of squares, sample count) per frame in the window
    window: VecDeque<(f64, usize)>,
    window_sum: f64,
    window_len: usize,
    active: bool,
    silence_ms: f64,
}

impl EnergyVad {
    pub fn new(config: VadConfig, sample_rate: u32) -> Self {
        let window_samples =
            ((config.window_ms as u64 * sample_rate as u64) / 1000).max(1) as usize;
        Self {
            config,
            sample_rate,
            window_samples,
            window: VecDeque::new(),
            window_sum: 0.0,
            window_len: 0,
            active: false,
            silence_ms: 0.0,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.active
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.window_sum = 0.0;
        self.window_len = 0;
        self.active = false;
        self.silence_ms = 0.0;
    }

    fn push(&mut self, sum: f64, samples: usize) -> f32 {
        self.window.push_back((sum, samples));
        self.window_sum += sum;
        self.window_len += samples;

        // Keep at least the newest frame.
        while self.window.len() > 1 && self.window_len > self.window_samples {
            if let Some((old_sum, old_len)) = self.window.pop_front() {
                self.window_sum -= old_sum;
                self.window_len -= old_len;
            }
        }

        if self.window_len == 0 {
            0.0
        } else {
            (self.window_sum.max(0.0) / self.window_len as f64).sqrt() as f32
        }
    }

    /// Feed one processed frame.
    pub fn process_frame(&mut self, frame: &[f32]) -> VadResult {
        let sum: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
        self.process_energy(sum, frame.len())
    }

    /// Feed a frame already measured by the analysis tap.
    pub fn process_rms(&mut self, rms: f32, samples: usize) -> VadResult {
        let sum = (rms as f64) * (rms as f64) * samples as f64;
        self.process_energy(sum, samples)
    }

    fn process_energy(&mut self, sum: f64, samples: usize) -> VadResult {
        let energy = self.push(sum, samples);
        let frame_ms = samples as f64 * 1000.0 / self.sample_rate as f64;

        if !self.config.enabled {
            return VadResult {
                energy,
                ..Default::default()
            };
        }

        let mut speech_start = false;
        let mut speech_end = false;

        if energy > self.config.threshold {
            self.silence_ms = 0.0;
            if !self.active {
                self.active = true;
                speech_start = true;
                debug!(energy, "Voice activity started");
            }
        } else {
            self.silence_ms += frame_ms;
            if self.active && self.silence_ms >= self.config.silence_duration_ms as f64 {
                self.active = false;
                speech_end = true;
                debug!(silence_ms = self.silence_ms, "Voice activity ended");
            }
        }

        trace!(energy, active = self.active, "VAD frame");

        VadResult {
            is_speech: self.active,
            energy,
            speech_start,
            speech_end,
            silence_duration_ms: self.silence_ms,
        }
    }
}
