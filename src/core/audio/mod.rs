//! Audio capture, processing and playback.

pub mod backend;
pub mod config;
pub mod dsp;
pub mod error;
pub mod pcm;
pub mod pipeline;
pub mod vad;

pub use backend::{AudioBackend, AudioBuffer, AudioConstraints, AudioContext, AudioContextState};
pub use config::{AudioConfig, CompressorConfig, VadConfig};
pub use dsp::{Compressor, FrameAnalysis, FrameProcessor, HighPassFilter, ProcessingGraph};
pub use error::AudioError;
pub use pcm::{convert_to_pcm16, pcm16_from_le_bytes, pcm16_to_f32, pcm16_to_le_bytes};
pub use pipeline::{AudioAdaptation, AudioEvent, AudioPipeline, AudioQualityReport};
pub use vad::{EnergyVad, VadResult};
