//! Audio pipeline against the fake audio backend.

mod mock_platform;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mock_platform::{FakeAudioBackend, MicrophoneBehavior, wait_for_event};
use tokio::sync::mpsc;
use waav_voice_session::core::audio::{
    AudioAdaptation, AudioConfig, AudioContext, AudioContextState, AudioError, AudioEvent,
    AudioPipeline, pcm16_to_le_bytes,
};
use waav_voice_session::errors::ErrorKind;

const WAIT: Duration = Duration::from_secs(2);

/// 20ms at 24kHz
const FRAME: usize = 480;

fn speech_frame() -> Vec<f32> {
    (0..FRAME)
        .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / 24_000.0).sin() * 0.5)
        .collect()
}

fn silent_frame() -> Vec<f32> {
    vec![0.0; FRAME]
}

fn pipeline(backend: &Arc<FakeAudioBackend>) -> AudioPipeline {
    AudioPipeline::new(backend.clone(), AudioConfig::default())
}

fn feed(pipeline: &AudioPipeline, frame: fn() -> Vec<f32>, count: usize) {
    for _ in 0..count {
        let mut samples = frame();
        pipeline.process_frame(&mut samples);
    }
}

#[tokio::test]
async fn test_initialize_acquires_microphone_and_context() {
    let backend = Arc::new(FakeAudioBackend::new());
    let pipeline = pipeline(&backend);

    let stream = pipeline.initialize_microphone(None).await.unwrap();

    assert!(stream.first_audio_track().is_some());
    assert_eq!(backend.requests(), vec![AudioConfig::default().constraints]);
    assert_eq!(backend.contexts_created(), 1);
    assert_eq!(pipeline.context_state(), Some(AudioContextState::Running));

    // A second acquisition releases the first stream and keeps the context
    let second = pipeline.initialize_microphone(None).await.unwrap();
    assert!(stream.first_audio_track().unwrap().is_ended());
    assert!(!second.first_audio_track().unwrap().is_ended());
    assert_eq!(backend.contexts_created(), 1);
}

#[tokio::test]
async fn test_permission_denied_is_not_recoverable() {
    let backend = Arc::new(FakeAudioBackend::with_behavior(
        MicrophoneBehavior::PermissionDenied,
    ));
    let pipeline = pipeline(&backend);

    let err = pipeline.initialize_microphone(None).await.unwrap_err();
    let classified = err.classify();

    assert_eq!(classified.kind, ErrorKind::MicrophonePermissionDenied);
    assert!(!classified.recoverable);
    assert!(pipeline.stream().is_none());
}

#[tokio::test]
async fn test_missing_device_is_recoverable() {
    let backend = Arc::new(FakeAudioBackend::with_behavior(MicrophoneBehavior::Missing));
    let pipeline = pipeline(&backend);

    let classified = pipeline
        .initialize_microphone(None)
        .await
        .unwrap_err()
        .classify();

    assert_eq!(classified.kind, ErrorKind::AudioDeviceError);
    assert!(classified.recoverable);
}

#[tokio::test]
async fn test_start_recording_requires_microphone() {
    let backend = Arc::new(FakeAudioBackend::new());
    let pipeline = pipeline(&backend);

    let err = pipeline.start_recording().await.unwrap_err();
    assert!(matches!(err, AudioError::NotInitialized));
    assert!(!pipeline.is_recording());
}

#[tokio::test]
async fn test_capture_frames_reach_sink_and_vad() {
    let backend = Arc::new(FakeAudioBackend::new());
    let pipeline = pipeline(&backend);
    let mut events = pipeline.subscribe();
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
    pipeline.set_output_sink(Some(sink_tx));

    pipeline.initialize_microphone(None).await.unwrap();
    pipeline.start_recording().await.unwrap();
    pipeline.start_recording().await.unwrap();
    assert!(pipeline.is_recording());

    let started = wait_for_event(&mut events, WAIT, |e| {
        matches!(e, AudioEvent::RecordingStarted)
    })
    .await;
    assert!(started.is_some());

    assert!(backend.push_frame(speech_frame()).await);
    let activity = wait_for_event(&mut events, WAIT, |e| {
        matches!(e, AudioEvent::VoiceActivity { .. })
    })
    .await;
    match activity {
        Some(AudioEvent::VoiceActivity { active, energy }) => {
            assert!(active);
            assert!(energy > AudioConfig::default().vad.threshold);
        }
        other => panic!("expected voice activity, got {other:?}"),
    }

    let processed = tokio::time::timeout(WAIT, sink_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(processed.len(), FRAME);
    assert!(pipeline.is_voice_active());

    pipeline.stop_recording();
    assert!(!pipeline.is_recording());
    assert!(!pipeline.is_voice_active());
    let stopped = wait_for_event(&mut events, WAIT, |e| {
        matches!(e, AudioEvent::RecordingStopped)
    })
    .await;
    assert!(stopped.is_some());
}

#[tokio::test]
async fn test_voice_activity_holds_through_short_pauses() {
    let backend = Arc::new(FakeAudioBackend::new());
    let pipeline = pipeline(&backend);
    pipeline.initialize_microphone(None).await.unwrap();

    feed(&pipeline, speech_frame, 10);
    assert!(pipeline.is_voice_active());

    // 300ms of silence is under the 500ms release time
    feed(&pipeline, silent_frame, 15);
    assert!(pipeline.is_voice_active());

    feed(&pipeline, speech_frame, 5);
    feed(&pipeline, silent_frame, 15);
    assert!(pipeline.is_voice_active());

    feed(&pipeline, silent_frame, 40);
    assert!(!pipeline.is_voice_active());
}

#[tokio::test]
async fn test_quality_report_covers_one_interval() {
    let backend = Arc::new(FakeAudioBackend::new());
    let pipeline = pipeline(&backend);
    let mut events = pipeline.subscribe();
    pipeline.initialize_microphone(None).await.unwrap();

    // 1s at 20ms per frame
    feed(&pipeline, speech_frame, 50);

    let report = wait_for_event(&mut events, WAIT, |e| {
        matches!(e, AudioEvent::QualityReport(_))
    })
    .await;
    match report {
        Some(AudioEvent::QualityReport(report)) => {
            assert_eq!(report.frames, 50);
            assert!(report.rms > 0.0);
            assert!(report.peak <= 1.0);
        }
        other => panic!("expected quality report, got {other:?}"),
    }
}

#[tokio::test]
async fn test_mute_silences_capture_and_disables_track() {
    let backend = Arc::new(FakeAudioBackend::new());
    let pipeline = pipeline(&backend);
    let stream = pipeline.initialize_microphone(None).await.unwrap();

    pipeline.set_muted(true);
    assert!(pipeline.is_muted());
    assert!(!stream.first_audio_track().unwrap().is_enabled());

    let mut frame = speech_frame();
    pipeline.process_frame(&mut frame);
    assert!(frame.iter().all(|&s| s == 0.0));
    assert!(!pipeline.is_voice_active());

    pipeline.set_muted(false);
    assert!(stream.first_audio_track().unwrap().is_enabled());
}

#[tokio::test]
async fn test_play_audio_reports_lifecycle() {
    let backend = Arc::new(FakeAudioBackend::new());
    let pipeline = pipeline(&backend);
    let mut events = pipeline.subscribe();

    let pcm: Bytes = pcm16_to_le_bytes(&AudioPipeline::convert_to_pcm16(&speech_frame()));
    assert!(matches!(
        pipeline.play_audio(pcm.clone()),
        Err(AudioError::ContextClosed)
    ));

    pipeline.initialize_microphone(None).await.unwrap();
    let id = pipeline.play_audio(pcm).unwrap();
    assert_eq!(id, 1);

    let started = wait_for_event(&mut events, WAIT, |e| {
        matches!(e, AudioEvent::PlaybackStarted { .. })
    })
    .await;
    assert!(matches!(started, Some(AudioEvent::PlaybackStarted { id: 1 })));
    let finished = wait_for_event(&mut events, WAIT, |e| {
        matches!(e, AudioEvent::PlaybackFinished { .. })
    })
    .await;
    assert!(matches!(finished, Some(AudioEvent::PlaybackFinished { id: 1 })));
    assert_eq!(backend.last_context().unwrap().played(), 1);
}

#[tokio::test]
async fn test_interrupt_playback_leaves_context_running() {
    let backend = Arc::new(FakeAudioBackend::new());
    let pipeline = pipeline(&backend);
    let mut events = pipeline.subscribe();

    // Nothing to interrupt yet
    pipeline.interrupt_playback().await.unwrap();

    pipeline.initialize_microphone(None).await.unwrap();
    pipeline.interrupt_playback().await.unwrap();

    let interrupted = wait_for_event(&mut events, WAIT, |e| {
        matches!(e, AudioEvent::PlaybackInterrupted)
    })
    .await;
    assert!(interrupted.is_some());
    assert_eq!(pipeline.context_state(), Some(AudioContextState::Running));
}

#[tokio::test]
async fn test_suspended_context_resumes_only_after_interaction() {
    let backend = Arc::new(FakeAudioBackend::new());
    backend.set_initial_context_state(AudioContextState::Suspended);
    let pipeline = pipeline(&backend);
    pipeline.initialize_microphone(None).await.unwrap();

    assert!(!pipeline.ensure_audio_context(false).await.unwrap());
    assert_eq!(pipeline.context_state(), Some(AudioContextState::Suspended));

    assert!(pipeline.ensure_audio_context(true).await.unwrap());
    assert_eq!(pipeline.context_state(), Some(AudioContextState::Running));
    assert_eq!(backend.contexts_created(), 1);
}

#[tokio::test]
async fn test_closed_context_is_recreated() {
    let backend = Arc::new(FakeAudioBackend::new());
    let pipeline = pipeline(&backend);
    let mut events = pipeline.subscribe();
    pipeline.initialize_microphone(None).await.unwrap();

    backend.last_context().unwrap().close().await;
    assert_eq!(pipeline.context_state(), Some(AudioContextState::Closed));

    assert!(pipeline.ensure_audio_context(false).await.unwrap());
    assert_eq!(backend.contexts_created(), 2);
    let recreated = wait_for_event(&mut events, WAIT, |e| {
        matches!(e, AudioEvent::ContextRecreated)
    })
    .await;
    assert!(recreated.is_some());
}

#[tokio::test]
async fn test_adaptation_applies_to_next_acquisition() {
    let backend = Arc::new(FakeAudioBackend::new());
    let pipeline = pipeline(&backend);

    pipeline.apply_adaptation(AudioAdaptation {
        sample_rate: 16_000,
        frame_size: 640,
        echo_cancellation: false,
        noise_suppression: false,
        auto_gain_control: true,
    });
    pipeline.initialize_microphone(None).await.unwrap();

    let request = backend.requests().pop().unwrap();
    assert_eq!(request.sample_rate, Some(16_000));
    assert!(!request.echo_cancellation);
    assert!(!request.noise_suppression);
    assert!(request.auto_gain_control);
    assert_eq!(pipeline.config().frame_size, 640);
    assert_eq!(backend.last_context().unwrap().sample_rate(), 16_000);
}

#[tokio::test]
async fn test_cleanup_releases_everything() {
    let backend = Arc::new(FakeAudioBackend::new());
    let pipeline = pipeline(&backend);
    let stream = pipeline.initialize_microphone(None).await.unwrap();
    pipeline.start_recording().await.unwrap();

    pipeline.cleanup().await;

    assert!(!pipeline.is_recording());
    assert!(pipeline.stream().is_none());
    assert!(pipeline.context_state().is_none());
    assert!(stream.first_audio_track().unwrap().is_ended());
    assert_eq!(
        backend.last_context().unwrap().state(),
        AudioContextState::Closed
    );

    // Safe to repeat
    pipeline.cleanup().await;
}
