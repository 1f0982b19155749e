//! Microphone capture, processing and playback.
//!
//! The pipeline knows nothing about the network or the protocol. It owns the
//! microphone stream, the audio context, the processing graph and the VAD, and
//! publishes [`AudioEvent`]s.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{AudioBackend, AudioBuffer, AudioConstraints, AudioContext, AudioContextState};
use super::config::AudioConfig;
use super::dsp::{FrameAnalysis, FrameProcessor, ProcessingGraph};
use super::error::AudioError;
use super::pcm::{convert_to_pcm16, pcm16_from_le_bytes, pcm16_to_f32};
use super::vad::EnergyVad;
use crate::core::media::MediaStream;
use crate::errors::ClassifiedError;
use crate::utils::EventEmitter;

/// Aggregated capture quality over one report interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AudioQualityReport {
    pub rms: f32,
    pub peak: f32,
    /// Fraction of samples at or above the clip level
    pub clipping_ratio: f32,
    /// Compressor gain reduction at the end of the interval (dB)
    pub compressor_reduction_db: f32,
    pub frames: u32,
}

/// Events published by the audio pipeline.
#[derive(Debug, Clone)]
pub enum AudioEvent {
    VoiceActivity { active: bool, energy: f32 },
    QualityReport(AudioQualityReport),
    RecordingStarted,
    RecordingStopped,
    PlaybackStarted { id: u64 },
    PlaybackFinished { id: u64 },
    PlaybackInterrupted,
    ContextRecreated,
    /// Background failure (capture or playback)
    Error(ClassifiedError),
}

/// Adaptive audio parameters applied on the next microphone acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioAdaptation {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

#[derive(Default)]
struct QualityAccumulator {
    sum_sq: f64,
    peak: f32,
    clipped: usize,
    samples: usize,
    frames: u32,
}

impl QualityAccumulator {
    fn add(&mut self, analysis: &FrameAnalysis) {
        self.sum_sq += (analysis.rms as f64).powi(2) * analysis.samples as f64;
        self.peak = self.peak.max(analysis.peak);
        self.clipped += analysis.clipped_samples;
        self.samples += analysis.samples;
        self.frames += 1;
    }

    fn take_report(&mut self, compressor_reduction_db: f32) -> AudioQualityReport {
        let report = if self.samples == 0 {
            AudioQualityReport::default()
        } else {
            AudioQualityReport {
                rms: (self.sum_sq / self.samples as f64).sqrt() as f32,
                peak: self.peak,
                clipping_ratio: self.clipped as f32 / self.samples as f32,
                compressor_reduction_db,
                frames: self.frames,
            }
        };
        *self = Self::default();
        report
    }
}

struct Inner {
    backend: Arc<dyn AudioBackend>,
    config: RwLock<AudioConfig>,
    context: RwLock<Option<Arc<dyn AudioContext>>>,
    stream: RwLock<Option<MediaStream>>,
    graph: Mutex<ProcessingGraph>,
    vad: Mutex<EnergyVad>,
    quality: Mutex<QualityAccumulator>,
    capture_task: Mutex<Option<JoinHandle<()>>>,
    output_sink: Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>,
    recording: AtomicBool,
    voice_active: AtomicBool,
    playback_counter: AtomicU64,
    events: EventEmitter<AudioEvent>,
}

/// Capture and playback pipeline.
#[derive(Clone)]
pub struct AudioPipeline {
    inner: Arc<Inner>,
}

impl AudioPipeline {
    pub fn new(backend: Arc<dyn AudioBackend>, config: AudioConfig) -> Self {
        let graph = ProcessingGraph::new(&config);
        let vad = EnergyVad::new(config.vad.clone(), config.sample_rate);
        Self {
            inner: Arc::new(Inner {
                backend,
                config: RwLock::new(config),
                context: RwLock::new(None),
                stream: RwLock::new(None),
                graph: Mutex::new(graph),
                vad: Mutex::new(vad),
                quality: Mutex::new(QualityAccumulator::default()),
                capture_task: Mutex::new(None),
                output_sink: Mutex::new(None),
                recording: AtomicBool::new(false),
                voice_active: AtomicBool::new(false),
                playback_counter: AtomicU64::new(0),
                events: EventEmitter::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AudioEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> AudioConfig {
        self.inner.config.read().clone()
    }

    /// Acquire the microphone and prepare the processing graph.
    ///
    /// Any previously acquired stream is released first. Errors are returned
    /// to the caller, not published.
    pub async fn initialize_microphone(
        &self,
        constraints: Option<AudioConstraints>,
    ) -> Result<MediaStream, AudioError> {
        let config = self.config();
        let constraints = constraints.unwrap_or_else(|| config.constraints.clone());

        if let Some(previous) = self.inner.stream.write().take() {
            previous.stop_all();
        }

        let stream = self.inner.backend.get_user_media(&constraints).await?;
        info!(
            stream_id = %stream.id,
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            "Microphone acquired"
        );

        self.inner.graph.lock().rebuild(&config);
        *self.inner.vad.lock() = EnergyVad::new(config.vad.clone(), config.sample_rate);
        *self.inner.stream.write() = Some(stream.clone());

        let muted = self.inner.graph.lock().is_muted();
        if let Some(track) = stream.first_audio_track() {
            track.set_enabled(!muted);
        }

        if self.inner.context.read().is_none() {
            let context = self.inner.backend.create_context(config.sample_rate).await?;
            *self.inner.context.write() = Some(context);
        }

        Ok(stream)
    }

    /// Current microphone stream.
    pub fn stream(&self) -> Option<MediaStream> {
        self.inner.stream.read().clone()
    }

    /// Receive processed capture frames (the graph's destination).
    pub fn set_output_sink(&self, sink: Option<mpsc::UnboundedSender<Vec<f32>>>) {
        *self.inner.output_sink.lock() = sink;
    }

    /// Insert or remove the custom frame processor.
    pub fn set_frame_processor(&self, processor: Option<Box<dyn FrameProcessor>>) {
        self.inner.graph.lock().set_custom_processor(processor);
    }

    /// Start processing capture frames.
    pub async fn start_recording(&self) -> Result<(), AudioError> {
        if self.inner.recording.load(Ordering::SeqCst) {
            return Ok(());
        }
        let stream = self.stream().ok_or(AudioError::NotInitialized)?;
        let frame_size = self.inner.config.read().frame_size;
        let mut frames = self.inner.backend.open_capture(&stream, frame_size).await?;

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            while let Some(mut frame) = frames.recv().await {
                inner.process_capture_frame(&mut frame);
            }
            debug!("Capture stream ended");
        });

        if let Some(previous) = self.inner.capture_task.lock().replace(handle) {
            previous.abort();
        }
        self.inner.recording.store(true, Ordering::SeqCst);
        info!("Recording started");
        self.inner.events.emit(AudioEvent::RecordingStarted);
        Ok(())
    }

    pub fn stop_recording(&self) {
        if let Some(task) = self.inner.capture_task.lock().take() {
            task.abort();
        }
        if self.inner.recording.swap(false, Ordering::SeqCst) {
            self.inner.vad.lock().reset();
            if self.inner.voice_active.swap(false, Ordering::SeqCst) {
                self.inner.events.emit(AudioEvent::VoiceActivity {
                    active: false,
                    energy: 0.0,
                });
            }
            info!("Recording stopped");
            self.inner.events.emit(AudioEvent::RecordingStopped);
        }
    }

    pub fn is_recording(&self) -> bool {
        self.inner.recording.load(Ordering::SeqCst)
    }

    pub fn is_voice_active(&self) -> bool {
        self.inner.voice_active.load(Ordering::SeqCst)
    }

    /// Run one capture frame through the graph. Exposed for platforms that
    /// drive processing from their own render callback.
    pub fn process_frame(&self, frame: &mut [f32]) {
        self.inner.process_capture_frame(frame);
    }

    /// Play little-endian PCM16 audio. Returns the playback id; start and
    /// finish are published as events.
    pub fn play_audio(&self, pcm: Bytes) -> Result<u64, AudioError> {
        let context = self
            .inner
            .context
            .read()
            .clone()
            .filter(|ctx| ctx.state() != AudioContextState::Closed)
            .ok_or(AudioError::ContextClosed)?;

        let samples = pcm16_to_f32(&pcm16_from_le_bytes(&pcm));
        let buffer = AudioBuffer {
            sample_rate: context.sample_rate(),
            samples,
        };
        let id = self.inner.playback_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let events = self.inner.clone();

        tokio::spawn(async move {
            events.events.emit(AudioEvent::PlaybackStarted { id });
            match context.play(buffer).await {
                Ok(()) => events.events.emit(AudioEvent::PlaybackFinished { id }),
                Err(e) => {
                    warn!(id, error = %e, "Playback failed");
                    events.events.emit(AudioEvent::Error(e.classify()));
                }
            }
        });
        Ok(id)
    }

    /// Hard-stop playback by suspending and immediately resuming the context.
    pub async fn interrupt_playback(&self) -> Result<(), AudioError> {
        let Some(context) = self.inner.context.read().clone() else {
            return Ok(());
        };
        if context.state() == AudioContextState::Closed {
            return Ok(());
        }
        context.suspend().await?;
        context.resume().await?;
        debug!("Playback interrupted");
        self.inner.events.emit(AudioEvent::PlaybackInterrupted);
        Ok(())
    }

    /// Float to PCM16 conversion for outbound audio.
    pub fn convert_to_pcm16(samples: &[f32]) -> Vec<i16> {
        convert_to_pcm16(samples)
    }

    pub fn set_input_gain(&self, gain: f32) {
        self.inner.graph.lock().set_input_gain(gain);
        self.inner.config.write().input_gain = gain.max(0.0);
    }

    pub fn set_output_gain(&self, gain: f32) {
        self.inner.graph.lock().set_output_gain(gain);
        self.inner.config.write().output_gain = gain.max(0.0);
    }

    /// Mute capture; the outgoing track transmits silence.
    pub fn set_muted(&self, muted: bool) {
        self.inner.graph.lock().set_muted(muted);
        if let Some(stream) = self.inner.stream.read().as_ref() {
            for track in stream.audio_tracks() {
                track.set_enabled(!muted);
            }
        }
        debug!(muted, "Capture mute changed");
    }

    pub fn is_muted(&self) -> bool {
        self.inner.graph.lock().is_muted()
    }

    /// Make sure a usable audio context exists.
    ///
    /// A closed (or missing) context is recreated and the graph rebuilt. A
    /// suspended context is resumed only after user interaction. Returns
    /// whether the context is running afterwards.
    pub async fn ensure_audio_context(&self, has_user_interaction: bool) -> Result<bool, AudioError> {
        let current = self.inner.context.read().clone();
        let context = match current {
            Some(ctx) if ctx.state() != AudioContextState::Closed => ctx,
            _ => {
                let config = self.config();
                let ctx = self.inner.backend.create_context(config.sample_rate).await?;
                *self.inner.context.write() = Some(ctx.clone());
                self.inner.graph.lock().rebuild(&config);
                *self.inner.vad.lock() = EnergyVad::new(config.vad.clone(), config.sample_rate);
                info!("Audio context recreated");
                self.inner.events.emit(AudioEvent::ContextRecreated);
                ctx
            }
        };

        match context.state() {
            AudioContextState::Running => Ok(true),
            AudioContextState::Suspended if has_user_interaction => {
                context.resume().await?;
                Ok(context.state() == AudioContextState::Running)
            }
            AudioContextState::Suspended => {
                debug!("Audio context suspended, waiting for user interaction");
                Ok(false)
            }
            AudioContextState::Closed => Err(AudioError::ContextClosed),
        }
    }

    pub fn context_state(&self) -> Option<AudioContextState> {
        self.inner.context.read().as_ref().map(|ctx| ctx.state())
    }

    /// Reacquire the microphone, resuming recording if it was active.
    pub async fn restart(
        &self,
        constraints: Option<AudioConstraints>,
    ) -> Result<MediaStream, AudioError> {
        let was_recording = self.is_recording();
        self.stop_recording();
        let stream = self.initialize_microphone(constraints).await?;
        if was_recording {
            self.start_recording().await?;
        }
        Ok(stream)
    }

    /// Store network-driven parameters for the next acquisition.
    pub fn apply_adaptation(&self, adaptation: AudioAdaptation) {
        let mut config = self.inner.config.write();
        config.sample_rate = adaptation.sample_rate;
        config.frame_size = adaptation.frame_size;
        config.constraints.sample_rate = Some(adaptation.sample_rate);
        config.constraints.echo_cancellation = adaptation.echo_cancellation;
        config.constraints.noise_suppression = adaptation.noise_suppression;
        config.constraints.auto_gain_control = adaptation.auto_gain_control;
        info!(
            sample_rate = adaptation.sample_rate,
            frame_size = adaptation.frame_size,
            "Audio adaptation stored"
        );
    }

    /// Stop recording, release the microphone and close the context.
    pub async fn cleanup(&self) {
        self.stop_recording();
        if let Some(stream) = self.inner.stream.write().take() {
            stream.stop_all();
        }
        let context = self.inner.context.write().take();
        if let Some(context) = context {
            context.close().await;
        }
        self.inner.output_sink.lock().take();
        debug!("Audio pipeline cleaned up");
    }
}

impl Inner {
    fn process_capture_frame(&self, frame: &mut [f32]) {
        let (analysis, reduction_db) = {
            let mut graph = self.graph.lock();
            let analysis = graph.process(frame);
            (analysis, graph.compressor_reduction_db())
        };

        let vad = self.vad.lock().process_rms(analysis.rms, analysis.samples);
        if vad.speech_start || vad.speech_end {
            self.voice_active.store(vad.is_speech, Ordering::SeqCst);
            self.events.emit(AudioEvent::VoiceActivity {
                active: vad.is_speech,
                energy: vad.energy,
            });
        }

        let report = {
            let (interval_ms, sample_rate) = {
                let config = self.config.read();
                (config.quality_report_interval_ms, config.sample_rate)
            };
            let interval_samples = (interval_ms as u64 * sample_rate as u64 / 1000) as usize;
            let mut quality = self.quality.lock();
            quality.add(&analysis);
            (quality.samples >= interval_samples.max(1)).then(|| quality.take_report(reduction_db))
        };
        if let Some(report) = report {
            if report.clipping_ratio > 0.01 {
                warn!(clipping_ratio = report.clipping_ratio, "Capture is clipping");
            }
            self.events.emit(AudioEvent::QualityReport(report));
        }

        let sink = self.output_sink.lock().clone();
        if let Some(sink) = sink {
            if sink.send(frame.to_vec()).is_err() {
                error!("Processed audio sink closed");
                self.output_sink.lock().take();
            }
        }
    }
}
