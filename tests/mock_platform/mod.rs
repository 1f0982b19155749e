//! In-memory platform fakes
//!
//! Stand-ins for the WebRTC and audio platform objects and the HTTP
//! collaborators, with knobs for failure injection and inspection:
//! - Peer connection / data channel / factory / SDP signaler
//! - Audio backend and audio context
//! - Token provider
//!
//! Peers never connect on their own: tests drive native transitions with
//! [`FakePeerConnection::connect`] and friends.

// Shared by several test binaries; not every helper is used by each.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use waav_voice_session::core::audio::{
    AudioBackend, AudioBuffer, AudioConstraints, AudioContext, AudioContextState, AudioError,
};
use waav_voice_session::core::connection::{
    DataChannel, DataChannelState, OfferOptions, PeerConfiguration, PeerConnection,
    PeerConnectionFactory, PeerConnectionState, PeerEvent, RtcStatsReport, SdpSignaler,
    SessionDescription, TransceiverDirection,
};
use waav_voice_session::core::media::{MediaStream, MediaStreamTrack, TrackKind};
use waav_voice_session::core::orchestrator::{OrchestratorConfig, OrchestratorDeps};
use waav_voice_session::core::session::{
    EphemeralToken, InMemorySessionStore, SessionStore, TokenProvider,
};
use waav_voice_session::core::tools::ToolRegistry;
use waav_voice_session::errors::{VoiceError, VoiceResult};
use waav_voice_session::utils::now_ms;

// =============================================================================
// Data channel
// =============================================================================

pub struct FakeDataChannel {
    label: String,
    state: Mutex<DataChannelState>,
    sent: Mutex<Vec<String>>,
}

impl FakeDataChannel {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            state: Mutex::new(DataChannelState::Connecting),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_state(&self, state: DataChannelState) {
        *self.state.lock() = state;
    }

    /// Every frame sent, decoded.
    pub fn sent(&self) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect()
    }

    /// The `type` of every frame sent, in order.
    pub fn sent_types(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    pub fn sent_of_type(&self, event_type: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|v| v.get("type").and_then(Value::as_str) == Some(event_type))
            .collect()
    }
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> DataChannelState {
        *self.state.lock()
    }

    fn send_text(&self, text: &str) -> VoiceResult<()> {
        if *self.state.lock() != DataChannelState::Open {
            return Err(VoiceError::DataChannelClosed);
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        *self.state.lock() = DataChannelState::Closed;
    }
}

// =============================================================================
// Peer connection
// =============================================================================

pub struct FakePeerConnection {
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<PeerConnectionState>,
    channel: Mutex<Option<Arc<FakeDataChannel>>>,
    tracks: Mutex<Vec<MediaStreamTrack>>,
    transceivers: AtomicUsize,
    remote_description: Mutex<Option<SessionDescription>>,
    stats: Mutex<RtcStatsReport>,
    closed: AtomicBool,
}

impl FakePeerConnection {
    fn new(events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            events,
            state: Mutex::new(PeerConnectionState::New),
            channel: Mutex::new(None),
            tracks: Mutex::new(Vec::new()),
            transceivers: AtomicUsize::new(0),
            remote_description: Mutex::new(None),
            stats: Mutex::new(RtcStatsReport::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn data_channel(&self) -> Option<Arc<FakeDataChannel>> {
        self.channel.lock().clone()
    }

    /// Open the data channel, then report `connected`.
    pub fn connect(&self) {
        if let Some(channel) = self.data_channel() {
            channel.set_state(DataChannelState::Open);
        }
        let _ = self.events.send(PeerEvent::DataChannelOpen);
        self.set_peer_state(PeerConnectionState::Connected);
    }

    /// Report `connected` without opening the data channel.
    pub fn connect_without_channel(&self) {
        self.set_peer_state(PeerConnectionState::Connected);
    }

    /// Simulate transport loss.
    pub fn fail(&self) {
        if let Some(channel) = self.data_channel() {
            channel.set_state(DataChannelState::Closed);
        }
        self.set_peer_state(PeerConnectionState::Failed);
    }

    pub fn set_peer_state(&self, state: PeerConnectionState) {
        *self.state.lock() = state;
        let _ = self.events.send(PeerEvent::ConnectionStateChanged(state));
    }

    /// Deliver a protocol event over the data channel.
    pub fn receive(&self, event: Value) {
        let _ = self
            .events
            .send(PeerEvent::DataChannelMessage(event.to_string()));
    }

    pub fn set_stats(&self, stats: RtcStatsReport) {
        *self.stats.lock() = stats;
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn create_data_channel(
        &self,
        label: &str,
        _ordered: bool,
    ) -> VoiceResult<Arc<dyn DataChannel>> {
        let channel = Arc::new(FakeDataChannel::new(label));
        *self.channel.lock() = Some(channel.clone());
        Ok(channel)
    }

    async fn add_track(&self, track: MediaStreamTrack, _stream: &MediaStream) -> VoiceResult<()> {
        if track.kind == TrackKind::Audio {
            self.transceivers.fetch_add(1, Ordering::SeqCst);
        }
        self.tracks.lock().push(track);
        Ok(())
    }

    async fn replace_audio_track(&self, track: MediaStreamTrack) -> VoiceResult<()> {
        let mut tracks = self.tracks.lock();
        tracks.retain(|t| t.kind != TrackKind::Audio);
        tracks.push(track);
        Ok(())
    }

    async fn add_transceiver(
        &self,
        kind: TrackKind,
        _direction: TransceiverDirection,
    ) -> VoiceResult<()> {
        if kind == TrackKind::Audio {
            self.transceivers.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn audio_transceiver_count(&self) -> usize {
        self.transceivers.load(Ordering::SeqCst)
    }

    async fn create_offer(&self, _options: OfferOptions) -> VoiceResult<SessionDescription> {
        Ok(SessionDescription::offer("v=0\r\no=- fake offer\r\n"))
    }

    async fn set_local_description(&self, _description: SessionDescription) -> VoiceResult<()> {
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> VoiceResult<()> {
        *self.remote_description.lock() = Some(description);
        let mut state = self.state.lock();
        if *state == PeerConnectionState::New {
            *state = PeerConnectionState::Connecting;
        }
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        *self.state.lock()
    }

    async fn get_stats(&self) -> VoiceResult<RtcStatsReport> {
        Ok(self.stats.lock().clone())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.state.lock() = PeerConnectionState::Closed;
        if let Some(channel) = self.data_channel() {
            channel.set_state(DataChannelState::Closed);
        }
    }
}

/// Builds [`FakePeerConnection`]s and keeps every one it built.
#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeerConnection>>>,
    /// Connect each peer as soon as its remote description is set
    auto_connect: AtomicBool,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_connecting() -> Self {
        let factory = Self::default();
        factory.auto_connect.store(true, Ordering::SeqCst);
        factory
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn last_peer(&self) -> Option<Arc<FakePeerConnection>> {
        self.peers.lock().last().cloned()
    }

    pub fn set_auto_connect(&self, enabled: bool) {
        self.auto_connect.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        _config: PeerConfiguration,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> VoiceResult<Arc<dyn PeerConnection>> {
        let peer = Arc::new(FakePeerConnection::new(events));
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

/// Answers every offer; optionally connects the latest peer afterwards.
pub struct FakeSignaler {
    factory: Arc<FakePeerFactory>,
    exchanges: AtomicU32,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl FakeSignaler {
    pub fn new(factory: Arc<FakePeerFactory>) -> Self {
        Self {
            factory,
            exchanges: AtomicU32::new(0),
            fail: AtomicBool::new(false),
            delay: Mutex::new(None),
        }
    }

    pub fn exchanges(&self) -> u32 {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }
}

#[async_trait]
impl SdpSignaler for FakeSignaler {
    async fn exchange(&self, _offer_sdp: &str, _token: &str) -> VoiceResult<String> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(VoiceError::HandshakeFailed("503: unavailable".to_string()));
        }
        if self.factory.auto_connect.load(Ordering::SeqCst) {
            if let Some(peer) = self.factory.last_peer() {
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    peer.connect();
                });
            }
        }
        Ok("v=0\r\no=- fake answer\r\n".to_string())
    }
}

// =============================================================================
// Audio
// =============================================================================

pub struct FakeAudioContext {
    state: Mutex<AudioContextState>,
    sample_rate: u32,
    played: AtomicUsize,
}

impl FakeAudioContext {
    pub fn new(sample_rate: u32, state: AudioContextState) -> Self {
        Self {
            state: Mutex::new(state),
            sample_rate,
            played: AtomicUsize::new(0),
        }
    }

    pub fn played(&self) -> usize {
        self.played.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioContext for FakeAudioContext {
    fn state(&self) -> AudioContextState {
        *self.state.lock()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn resume(&self) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        if *state == AudioContextState::Closed {
            return Err(AudioError::ContextClosed);
        }
        *state = AudioContextState::Running;
        Ok(())
    }

    async fn suspend(&self) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        if *state == AudioContextState::Closed {
            return Err(AudioError::ContextClosed);
        }
        *state = AudioContextState::Suspended;
        Ok(())
    }

    async fn close(&self) {
        *self.state.lock() = AudioContextState::Closed;
    }

    async fn play(&self, _buffer: AudioBuffer) -> Result<(), AudioError> {
        self.played.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// How [`FakeAudioBackend::get_user_media`] behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrophoneBehavior {
    Available,
    PermissionDenied,
    /// Rejects constraints requesting processing; fallback constraints work
    RejectsProcessing,
    Missing,
}

pub struct FakeAudioBackend {
    behavior: Mutex<MicrophoneBehavior>,
    requests: Mutex<Vec<AudioConstraints>>,
    contexts: Mutex<Vec<Arc<FakeAudioContext>>>,
    capture: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
    initial_context_state: Mutex<AudioContextState>,
}

impl Default for FakeAudioBackend {
    fn default() -> Self {
        Self {
            behavior: Mutex::new(MicrophoneBehavior::Available),
            requests: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
            capture: Mutex::new(None),
            initial_context_state: Mutex::new(AudioContextState::Running),
        }
    }
}

impl FakeAudioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MicrophoneBehavior) -> Self {
        let backend = Self::default();
        *backend.behavior.lock() = behavior;
        backend
    }

    pub fn set_behavior(&self, behavior: MicrophoneBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn set_initial_context_state(&self, state: AudioContextState) {
        *self.initial_context_state.lock() = state;
    }

    pub fn requests(&self) -> Vec<AudioConstraints> {
        self.requests.lock().clone()
    }

    pub fn last_context(&self) -> Option<Arc<FakeAudioContext>> {
        self.contexts.lock().last().cloned()
    }

    pub fn contexts_created(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Push one capture frame into the running capture stream.
    pub async fn push_frame(&self, frame: Vec<f32>) -> bool {
        let sender = self.capture.lock().clone();
        match sender {
            Some(sender) => sender.send(frame).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl AudioBackend for FakeAudioBackend {
    async fn get_user_media(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<MediaStream, AudioError> {
        self.requests.lock().push(constraints.clone());
        let behavior = *self.behavior.lock();
        match behavior {
            MicrophoneBehavior::Available => {}
            MicrophoneBehavior::PermissionDenied => {
                return Err(AudioError::PermissionDenied("NotAllowedError".to_string()));
            }
            MicrophoneBehavior::RejectsProcessing if constraints.echo_cancellation => {
                return Err(AudioError::Overconstrained("echoCancellation".to_string()));
            }
            MicrophoneBehavior::RejectsProcessing => {}
            MicrophoneBehavior::Missing => {
                return Err(AudioError::DeviceNotFound("NotFoundError".to_string()));
            }
        }
        Ok(MediaStream::new(vec![MediaStreamTrack::audio("fake mic")]))
    }

    async fn create_context(&self, sample_rate: u32) -> Result<Arc<dyn AudioContext>, AudioError> {
        let state = *self.initial_context_state.lock();
        let context = Arc::new(FakeAudioContext::new(sample_rate, state));
        self.contexts.lock().push(context.clone());
        Ok(context)
    }

    async fn open_capture(
        &self,
        _stream: &MediaStream,
        _frame_size: usize,
    ) -> Result<mpsc::Receiver<Vec<f32>>, AudioError> {
        let (tx, rx) = mpsc::channel(64);
        *self.capture.lock() = Some(tx);
        Ok(rx)
    }
}

// =============================================================================
// Token provider
// =============================================================================

pub struct FakeTokenProvider {
    issued: AtomicU32,
    lifetime: Duration,
    fail: AtomicBool,
    requests: Mutex<Vec<Option<String>>>,
}

impl FakeTokenProvider {
    pub fn new() -> Self {
        Self::with_lifetime(Duration::from_secs(3600))
    }

    pub fn with_lifetime(lifetime: Duration) -> Self {
        Self {
            issued: AtomicU32::new(0),
            lifetime,
            fail: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::SeqCst)
    }

    /// Session ids requested, in order (`None` for a fresh session).
    pub fn requests(&self) -> Vec<Option<String>> {
        self.requests.lock().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TokenProvider for FakeTokenProvider {
    async fn fetch_token(&self, session_id: Option<&str>) -> VoiceResult<EphemeralToken> {
        self.requests.lock().push(session_id.map(str::to_string));
        if self.fail.load(Ordering::SeqCst) {
            return Err(VoiceError::TokenRequest("500: token service down".to_string()));
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(EphemeralToken::new(
            format!("ek_test_{n}"),
            now_ms() + self.lifetime.as_millis() as u64,
            session_id.unwrap_or("sess_fake"),
        ))
    }
}

// =============================================================================
// Assembly
// =============================================================================

/// Every fake behind one orchestrator.
pub struct Platform {
    pub factory: Arc<FakePeerFactory>,
    pub signaler: Arc<FakeSignaler>,
    pub audio: Arc<FakeAudioBackend>,
    pub tokens: Arc<FakeTokenProvider>,
    pub store: Arc<InMemorySessionStore>,
}

impl Platform {
    pub fn new() -> Self {
        Self::with_store(InMemorySessionStore::default())
    }

    pub fn with_store(store: InMemorySessionStore) -> Self {
        let factory = Arc::new(FakePeerFactory::auto_connecting());
        Self {
            signaler: Arc::new(FakeSignaler::new(factory.clone())),
            factory,
            audio: Arc::new(FakeAudioBackend::new()),
            tokens: Arc::new(FakeTokenProvider::new()),
            store: Arc::new(store),
        }
    }

    pub fn deps(&self) -> OrchestratorDeps {
        self.deps_with_tools(ToolRegistry::new())
    }

    pub fn deps_with_tools(&self, tools: ToolRegistry) -> OrchestratorDeps {
        let store: Arc<dyn SessionStore> = self.store.clone();
        OrchestratorDeps {
            token_provider: self.tokens.clone(),
            session_store: store,
            peer_factory: self.factory.clone(),
            signaler: self.signaler.clone(),
            audio_backend: self.audio.clone(),
            network_info: None,
            tools,
        }
    }

    pub fn peer(&self) -> Arc<FakePeerConnection> {
        self.factory.last_peer().expect("no peer created")
    }

    pub fn channel(&self) -> Arc<FakeDataChannel> {
        self.peer().data_channel().expect("no data channel")
    }
}

/// Orchestrator settings with short waits for tests.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        connect_timeout: Duration::from_secs(2),
        spoken_wait_timeout: Duration::from_secs(2),
        ..OrchestratorConfig::default()
    }
}

/// Receive events until one matches, or fail after `timeout`.
pub async fn wait_for_event<E, F>(
    rx: &mut mpsc::UnboundedReceiver<E>,
    timeout: Duration,
    mut predicate: F,
) -> Option<E>
where
    F: FnMut(&E) -> bool,
{
    tokio::time::timeout(timeout, async {
        while let Some(event) = rx.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
