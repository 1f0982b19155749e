//! Capture processing graph.
//!
//! Frames flow through a fixed chain:
//!
//! ```text
//! input gain -> high-pass -> compressor -> [custom processor] -> analysis tap -> output gain
//! ```
//!
//! Analysis runs after filtering and compression so voice activity and
//! quality metrics describe the cleaned signal.

use std::f32::consts::PI;

use super::config::{AudioConfig, CompressorConfig};

/// Samples at or above this magnitude count as clipped.
const CLIP_LEVEL: f32 = 0.99;

/// Custom per-frame processor inserted after the compressor.
pub trait FrameProcessor: Send {
    fn process(&mut self, frame: &mut [f32]);

    fn name(&self) -> &str {
        "custom"
    }
}

/// Second-order high-pass filter (RBJ cookbook, transposed direct form II).
#[derive(Debug, Clone)]
pub struct HighPassFilter {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl HighPassFilter {
    pub fn new(cutoff_hz: f32, q: f32, sample_rate: u32) -> Self {
        let w0 = 2.0 * PI * cutoff_hz / sample_rate as f32;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / (2.0 * q);
        let a0 = 1.0 + alpha;

        Self {
            b0: ((1.0 + cos_w0) / 2.0) / a0,
            b1: (-(1.0 + cos_w0)) / a0,
            b2: ((1.0 + cos_w0) / 2.0) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    pub fn process(&mut self, frame: &mut [f32]) {
        for sample in frame.iter_mut() {
            let x = *sample;
            let y = self.b0 * x + self.z1;
            self.z1 = self.b1 * x - self.a1 * y + self.z2;
            self.z2 = self.b2 * x - self.a2 * y;
            *sample = y;
        }
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// Soft-knee downward compressor with attack/release smoothing.
#[derive(Debug, Clone)]
pub struct Compressor {
    threshold_db: f32,
    knee_db: f32,
    ratio: f32,
    attack_coeff: f32,
    release_coeff: f32,
    /// Current gain reduction in dB (<= 0)
    envelope_db: f32,
}

impl Compressor {
    pub fn new(config: &CompressorConfig, sample_rate: u32) -> Self {
        let coeff = |ms: f32| {
            let samples = (ms / 1000.0) * sample_rate as f32;
            if samples <= 0.0 {
                0.0
            } else {
                (-1.0 / samples).exp()
            }
        };
        Self {
            threshold_db: config.threshold_db,
            knee_db: config.knee_db.max(0.0),
            ratio: config.ratio.max(1.0),
            attack_coeff: coeff(config.attack_ms),
            release_coeff: coeff(config.release_ms),
            envelope_db: 0.0,
        }
    }

    /// Static gain curve: target gain change in dB for an input level.
    pub fn gain_for_level(&self, level_db: f32) -> f32 {
        let over = level_db - self.threshold_db;
        let slope = 1.0 / self.ratio - 1.0;
        if 2.0 * over < -self.knee_db {
            0.0
        } else if self.knee_db > 0.0 && 2.0 * over.abs() <= self.knee_db {
            slope * (over + self.knee_db / 2.0).powi(2) / (2.0 * self.knee_db)
        } else {
            slope * over
        }
    }

    pub fn process(&mut self, frame: &mut [f32]) {
        for sample in frame.iter_mut() {
            let level_db = 20.0 * (sample.abs() + 1e-9).log10();
            let target = self.gain_for_level(level_db);
            let coeff = if target < self.envelope_db {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.envelope_db = coeff * self.envelope_db + (1.0 - coeff) * target;
            *sample *= 10f32.powf(self.envelope_db / 20.0);
        }
    }

    /// Current gain reduction in dB.
    pub fn reduction_db(&self) -> f32 {
        self.envelope_db
    }

    pub fn reset(&mut self) {
        self.envelope_db = 0.0;
    }
}

/// Per-frame measurements from the analysis tap.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameAnalysis {
    pub rms: f32,
    pub peak: f32,
    pub clipped_samples: usize,
    pub samples: usize,
}

pub fn analyse(frame: &[f32]) -> FrameAnalysis {
    if frame.is_empty() {
        return FrameAnalysis::default();
    }
    let mut sum_sq = 0.0f64;
    let mut peak = 0.0f32;
    let mut clipped = 0;
    for &s in frame {
        let a = s.abs();
        sum_sq += (s as f64) * (s as f64);
        peak = peak.max(a);
        if a >= CLIP_LEVEL {
            clipped += 1;
        }
    }
    FrameAnalysis {
        rms: (sum_sq / frame.len() as f64).sqrt() as f32,
        peak,
        clipped_samples: clipped,
        samples: frame.len(),
    }
}

/// The full capture chain.
pub struct ProcessingGraph {
    input_gain: f32,
    output_gain: f32,
    muted: bool,
    highpass: HighPassFilter,
    compressor: Compressor,
    custom: Option<Box<dyn FrameProcessor>>,
}

impl ProcessingGraph {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            input_gain: config.input_gain,
            output_gain: config.output_gain,
            muted: false,
            highpass: HighPassFilter::new(
                config.highpass_cutoff_hz,
                config.highpass_q,
                config.sample_rate,
            ),
            compressor: Compressor::new(&config.compressor, config.sample_rate),
            custom: None,
        }
    }

    /// Build a fresh graph for `config`, carrying over gains, mute and the
    /// custom processor.
    pub fn rebuild(&mut self, config: &AudioConfig) {
        let custom = self.custom.take();
        let (input_gain, output_gain, muted) = (self.input_gain, self.output_gain, self.muted);
        *self = Self::new(config);
        self.input_gain = input_gain;
        self.output_gain = output_gain;
        self.muted = muted;
        self.custom = custom;
    }

    pub fn set_input_gain(&mut self, gain: f32) {
        self.input_gain = gain.max(0.0);
    }

    pub fn set_output_gain(&mut self, gain: f32) {
        self.output_gain = gain.max(0.0);
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_custom_processor(&mut self, processor: Option<Box<dyn FrameProcessor>>) {
        self.custom = processor;
    }

    pub fn has_custom_processor(&self) -> bool {
        self.custom.is_some()
    }

    pub fn compressor_reduction_db(&self) -> f32 {
        self.compressor.reduction_db()
    }

    /// Run one frame in place and return the analysis tap.
    pub fn process(&mut self, frame: &mut [f32]) -> FrameAnalysis {
        if self.muted {
            frame.fill(0.0);
            return analyse(frame);
        }

        if self.input_gain != 1.0 {
            frame.iter_mut().for_each(|s| *s *= self.input_gain);
        }
        self.highpass.process(frame);
        self.compressor.process(frame);
        if let Some(custom) = self.custom.as_mut() {
            custom.process(frame);
        }

        let analysis = analyse(frame);

        if self.output_gain != 1.0 {
            frame.iter_mut().for_each(|s| *s *= self.output_gain);
        }
        analysis
    }
}
