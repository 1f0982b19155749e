//! WebRTC connection manager.
//!
//! Owns the peer connection and its single ordered data channel, performs the
//! SDP handshake with an ephemeral token and reports connection lifecycle and
//! inbound protocol events through [`ConnectionEvent`].
//!
//! # Completion
//!
//! A successful SDP exchange only moves the manager to `Connecting`. The state
//! becomes `Connected` when the peer connection itself reports connected,
//! which happens asynchronously afterwards.
//!
//! # Reconnection
//!
//! A peer `disconnected`/`failed` transition that was not caused by
//! [`ConnectionManager::disconnect`] starts a bounded reconnection loop with
//! exponential backoff. When the attempts are exhausted the manager emits
//! [`ConnectionEvent::MaxReconnectAttemptsReached`] and moves to `Failed`.
//!
//! An explicit `connect` or `disconnect` ends any running loop: the loop
//! carries the epoch it started in and stops as soon as the epoch moves.
//! Transport builds (explicit or from the loop) are serialized, so at most one
//! peer connection is live at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

use super::base::{
    ConnectionState, DataChannel, DataChannelState, IceServer, OfferOptions, PeerConfiguration,
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, SdpSignaler,
    SessionDescription, TransceiverDirection,
};
use super::reconnect::ReconnectionConfig;
use crate::core::media::{MediaStream, TrackKind};
use crate::core::protocol::{ClientEvent, ServerEvent, SessionConfig};
use crate::core::session::EphemeralToken;
use crate::errors::{ClassifiedError, ErrorKind, VoiceError, VoiceResult};
use crate::utils::EventEmitter;

/// Label of the control-plane data channel.
pub const DATA_CHANNEL_LABEL: &str = "oai-events";

/// Connection manager settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionManagerConfig {
    pub ice_servers: Vec<IceServer>,
    pub reconnection: ReconnectionConfig,
    pub data_channel_label: String,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            reconnection: ReconnectionConfig::default(),
            data_channel_label: DATA_CHANNEL_LABEL.to_string(),
        }
    }
}

/// Events published by the connection manager.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// Inbound remote audio
    RemoteStream(MediaStream),
    DataChannelOpen,
    DataChannelClosed,
    /// Decoded protocol event, in arrival order
    Message(ServerEvent),
    Error(ClassifiedError),
    ReconnectAttempt { attempt: u32, delay_ms: u64 },
    MaxReconnectAttemptsReached { attempts: u32 },
}

/// Everything needed to rebuild the connection.
#[derive(Debug, Clone)]
struct ConnectParams {
    token: EphemeralToken,
    local_stream: Option<MediaStream>,
    session_config: Option<SessionConfig>,
}

struct Inner {
    factory: Arc<dyn PeerConnectionFactory>,
    signaler: Arc<dyn SdpSignaler>,
    config: ConnectionManagerConfig,

    state_tx: watch::Sender<ConnectionState>,
    peer: RwLock<Option<Arc<dyn PeerConnection>>>,
    data_channel: RwLock<Option<Arc<dyn DataChannel>>>,
    remote_stream: RwLock<Option<MediaStream>>,
    params: RwLock<Option<ConnectParams>>,

    connecting: AtomicBool,
    reconnecting: AtomicBool,
    intentional_disconnect: AtomicBool,
    reconnect_attempts: AtomicU32,
    /// Bumped whenever the transport is replaced; stale peer events are ignored
    generation: AtomicU64,
    /// Bumped by explicit connect/disconnect; a reconnect loop from an older
    /// epoch stops
    loop_epoch: AtomicU64,
    /// Held while a transport is being built
    establish_lock: Mutex<()>,

    sent_events: AtomicU64,
    dropped_events: AtomicU64,

    events: EventEmitter<ConnectionEvent>,
}

/// Clears the in-progress flag when a connect attempt ends, however it ends.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the peer connection and data channel of one session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        signaler: Arc<dyn SdpSignaler>,
        config: ConnectionManagerConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                factory,
                signaler,
                config,
                state_tx,
                peer: RwLock::new(None),
                data_channel: RwLock::new(None),
                remote_stream: RwLock::new(None),
                params: RwLock::new(None),
                connecting: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                intentional_disconnect: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                loop_epoch: AtomicU64::new(0),
                establish_lock: Mutex::new(()),
                sent_events: AtomicU64::new(0),
                dropped_events: AtomicU64::new(0),
                events: EventEmitter::new(),
            }),
        }
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Watch the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Wait until the state equals `target` or the timeout elapses.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.inner.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Build a new connection.
    ///
    /// A call made while another connect is in progress is a no-op. Any
    /// existing connection is torn down first. The returned future resolves
    /// once the SDP handshake completed; the `Connected` state follows when
    /// the peer reports it.
    pub async fn connect(
        &self,
        token: EphemeralToken,
        local_stream: Option<MediaStream>,
        session_config: Option<SessionConfig>,
    ) -> VoiceResult<()> {
        let inner = &self.inner;
        if inner
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Connect already in progress, ignoring");
            return Ok(());
        }
        let _guard = ConnectingGuard(&inner.connecting);

        if token.is_expired() {
            warn!(session_id = %token.session_id, "Refusing to connect with an expired token");
            return Err(VoiceError::TokenExpired(
                "ephemeral token expired before connect".to_string(),
            ));
        }

        inner.intentional_disconnect.store(false, Ordering::SeqCst);
        inner.cancel_reconnect_loop();

        let _building = inner.establish_lock.lock().await;
        inner.teardown_transport().await;
        inner.remote_stream.write().take();
        inner.set_state(ConnectionState::Connecting);

        let params = ConnectParams {
            token,
            local_stream,
            session_config,
        };
        *inner.params.write() = Some(params.clone());

        let generation = inner.next_generation();
        match inner.clone().establish(params, generation).await {
            Ok(()) => Ok(()),
            Err(e) if inner.is_superseded(generation) => {
                debug!(error = %e, "Connection attempt superseded");
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "Connection attempt failed");
                inner.teardown_transport().await;
                inner.set_state(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    /// Serialize and send a protocol event.
    ///
    /// Returns `false` and drops the event when the data channel is not open.
    pub fn send_event(&self, event: &ClientEvent) -> bool {
        self.inner.send_event(event)
    }

    /// Close the data channel and the peer connection.
    ///
    /// Idempotent; safe on a never-connected instance.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.intentional_disconnect.store(true, Ordering::SeqCst);
        inner.cancel_reconnect_loop();
        inner.teardown_transport().await;
        inner.remote_stream.write().take();
        inner.set_state(ConnectionState::Disconnected);
    }

    /// Replace the token used for future reconnects.
    pub fn update_token(&self, token: EphemeralToken) {
        if let Some(params) = self.inner.params.write().as_mut() {
            params.token = token;
        }
    }

    /// Replace the session configuration sent when the data channel opens.
    pub fn update_session_config(&self, config: SessionConfig) {
        if let Some(params) = self.inner.params.write().as_mut() {
            params.session_config = Some(config);
        }
    }

    /// Swap the microphone stream on the live connection and for reconnects.
    pub async fn replace_local_stream(&self, stream: MediaStream) -> VoiceResult<()> {
        if let Some(params) = self.inner.params.write().as_mut() {
            params.local_stream = Some(stream.clone());
        }
        let peer = self.inner.peer.read().clone();
        if let (Some(peer), Some(track)) = (peer, stream.first_audio_track()) {
            peer.replace_audio_track(track.clone()).await?;
        }
        Ok(())
    }

    /// Last inbound remote stream.
    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.inner.remote_stream.read().clone()
    }

    /// Live peer connection, used for stats sampling.
    pub fn peer_connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.inner.peer.read().clone()
    }

    pub fn is_data_channel_open(&self) -> bool {
        self.inner
            .data_channel
            .read()
            .as_ref()
            .is_some_and(|dc| dc.ready_state() == DataChannelState::Open)
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.connecting.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn sent_events(&self) -> u64 {
        self.inner.sent_events.load(Ordering::Relaxed)
    }

    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped_events.load(Ordering::Relaxed)
    }
}

impl Inner {
    fn set_state(&self, new_state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == new_state {
                false
            } else {
                *state = new_state;
                true
            }
        });
        if changed {
            info!(state = %new_state, "Connection state changed");
            self.events.emit(ConnectionEvent::StateChanged(new_state));
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_superseded(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    /// Stop any reconnect loop started before this call.
    fn cancel_reconnect_loop(&self) {
        self.loop_epoch.fetch_add(1, Ordering::SeqCst);
        self.reconnecting.store(false, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
    }

    fn loop_cancelled(&self, epoch: u64) -> bool {
        self.intentional_disconnect.load(Ordering::SeqCst)
            || self.loop_epoch.load(Ordering::SeqCst) != epoch
    }

    fn send_event(&self, event: &ClientEvent) -> bool {
        let channel = self.data_channel.read().clone();
        let Some(channel) = channel.filter(|dc| dc.ready_state() == DataChannelState::Open) else {
            warn!(
                event_type = event.event_type(),
                "Data channel not open, dropping event"
            );
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let payload = match event.to_wire() {
            Ok(payload) => payload,
            Err(e) => {
                error!(event_type = event.event_type(), error = %e, "Failed to serialize event");
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        match channel.send_text(&payload) {
            Ok(()) => {
                debug!(event_type = event.event_type(), "Sent event");
                self.sent_events.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(event_type = event.event_type(), error = %e, "Data channel send failed");
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Close and forget the current transport. The remote stream is kept so
    /// it survives an internal reconnect.
    async fn teardown_transport(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let channel = self.data_channel.write().take();
        let peer = self.peer.write().take();

        if let Some(channel) = channel {
            channel.close().await;
        }
        if let Some(peer) = peer {
            peer.close().await;
        }
    }

    /// Build the peer connection and run the SDP handshake for `generation`.
    ///
    /// Fails with a superseded error when the transport is torn down
    /// underneath it; the half-built peer is closed and nothing else touched.
    async fn establish(self: Arc<Self>, params: ConnectParams, generation: u64) -> VoiceResult<()> {
        let superseded =
            || VoiceError::ConnectionFailed("connection superseded during handshake".to_string());
        let (tx, rx) = mpsc::unbounded_channel();

        let peer = self
            .factory
            .create(
                PeerConfiguration {
                    ice_servers: self.config.ice_servers.clone(),
                },
                tx,
            )
            .await
            .map_err(|e| VoiceError::ConnectionFailed(format!("peer connection: {e}")))?;
        // Checked under the slot lock so a concurrent teardown either sees
        // this peer or this build sees the new generation.
        let stored = {
            let mut slot = self.peer.write();
            let current = !self.is_superseded(generation);
            if current {
                *slot = Some(peer.clone());
            }
            current
        };
        if !stored {
            peer.close().await;
            return Err(superseded());
        }

        tokio::spawn(self.clone().run_peer_events(generation, rx));

        let channel = peer
            .create_data_channel(&self.config.data_channel_label, true)
            .await?;
        let stored = {
            let mut slot = self.data_channel.write();
            let current = !self.is_superseded(generation);
            if current {
                *slot = Some(channel.clone());
            }
            current
        };
        if !stored {
            channel.close().await;
            return Err(superseded());
        }

        // Local track must be attached before the offer is created.
        if let Some(stream) = params.local_stream.as_ref() {
            for track in stream.audio_tracks() {
                peer.add_track(track.clone(), stream).await?;
            }
        }
        if peer.audio_transceiver_count() == 0 {
            peer.add_transceiver(TrackKind::Audio, TransceiverDirection::RecvOnly)
                .await?;
        }

        let offer = peer.create_offer(OfferOptions::audio_only()).await?;
        peer.set_local_description(offer.clone()).await?;

        let answer = self
            .signaler
            .exchange(&offer.sdp, &params.token.token)
            .await?;

        if self.is_superseded(generation) {
            return Err(superseded());
        }
        peer.set_remote_description(SessionDescription::answer(answer))
            .await?;

        debug!(session_id = %params.token.session_id, "SDP handshake complete, awaiting peer");
        Ok(())
    }

    async fn run_peer_events(
        self: Arc<Self>,
        generation: u64,
        mut rx: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!("Ignoring event from replaced peer connection");
                break;
            }
            self.handle_peer_event(event);
        }
    }

    fn handle_peer_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::ConnectionStateChanged(PeerConnectionState::Connected) => {
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.reconnecting.store(false, Ordering::SeqCst);
                self.set_state(ConnectionState::Connected);
            }
            PeerEvent::ConnectionStateChanged(
                state @ (PeerConnectionState::Disconnected | PeerConnectionState::Failed),
            ) => {
                if self.intentional_disconnect.load(Ordering::SeqCst) {
                    return;
                }
                warn!(peer_state = ?state, "Peer connection lost");
                tokio::spawn(self.clone().reconnect_loop());
            }
            PeerEvent::ConnectionStateChanged(state) => {
                debug!(peer_state = ?state, "Peer connection state");
            }
            PeerEvent::DataChannelOpen => {
                let config = self
                    .params
                    .read()
                    .as_ref()
                    .and_then(|p| p.session_config.clone())
                    .unwrap_or_else(SessionConfig::minimal_default);
                info!("Data channel open, sending session configuration");
                self.events.emit(ConnectionEvent::DataChannelOpen);
                self.send_event(&ClientEvent::session_update(config));
            }
            PeerEvent::DataChannelClosed => {
                if !self.intentional_disconnect.load(Ordering::SeqCst) {
                    warn!("Data channel closed");
                    self.events.emit(ConnectionEvent::DataChannelClosed);
                }
            }
            PeerEvent::DataChannelError(message) => {
                error!(error = %message, "Data channel error");
                self.events.emit(ConnectionEvent::Error(ClassifiedError::new(
                    ErrorKind::DataChannelError,
                    message,
                )));
            }
            PeerEvent::DataChannelMessage(text) => match ServerEvent::parse(&text) {
                Ok(event) => self.events.emit(ConnectionEvent::Message(event)),
                Err(e) => warn!(error = %e, "Discarding undecodable data channel message"),
            },
            PeerEvent::Track(stream) => {
                info!(stream_id = %stream.id, "Remote track received");
                *self.remote_stream.write() = Some(stream.clone());
                self.events.emit(ConnectionEvent::RemoteStream(stream));
            }
        }
    }

    /// Bounded reconnection with exponential backoff.
    fn reconnect_loop(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if self.reconnecting.swap(true, Ordering::SeqCst) {
                return;
            }
            let epoch = self.loop_epoch.load(Ordering::SeqCst);
            self.set_state(ConnectionState::Reconnecting);
            let policy = self.config.reconnection.clone();

            loop {
                if self.loop_cancelled(epoch) {
                    debug!("Reconnection loop superseded");
                    return;
                }

                let attempts_made = self.reconnect_attempts.load(Ordering::SeqCst);
                if !policy.should_retry(attempts_made) {
                    let _building = self.establish_lock.lock().await;
                    if self.loop_cancelled(epoch) {
                        return;
                    }
                    error!(attempts = attempts_made, "Max reconnection attempts reached");
                    self.teardown_transport().await;
                    self.set_state(ConnectionState::Failed);
                    self.events.emit(ConnectionEvent::MaxReconnectAttemptsReached {
                        attempts: attempts_made,
                    });
                    break;
                }

                let attempt = attempts_made + 1;
                self.reconnect_attempts.store(attempt, Ordering::SeqCst);
                let delay_ms = policy.calculate_delay(attempt);
                info!(attempt, max_attempts = policy.max_attempts, delay_ms, "Scheduling reconnection");
                self.events
                    .emit(ConnectionEvent::ReconnectAttempt { attempt, delay_ms });
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                let _building = self.establish_lock.lock().await;
                if self.loop_cancelled(epoch) {
                    info!("Reconnection cancelled during backoff");
                    return;
                }

                let Some(params) = self.params.read().clone() else {
                    break;
                };
                if params.token.is_expired() {
                    warn!("Token expired, handing reconnection to recovery");
                    self.teardown_transport().await;
                    self.set_state(ConnectionState::Failed);
                    self.events.emit(ConnectionEvent::Error(ClassifiedError::new(
                        ErrorKind::TokenExpired,
                        "ephemeral token expired during reconnection",
                    )));
                    break;
                }

                self.teardown_transport().await;
                let generation = self.next_generation();
                match self.clone().establish(params, generation).await {
                    Ok(()) => {
                        info!(attempt, "Reconnection handshake complete");
                        break;
                    }
                    Err(_) if self.loop_cancelled(epoch) => return,
                    Err(e) => {
                        warn!(attempt, error = %e, "Reconnection attempt failed");
                        if self.current_state() != ConnectionState::Reconnecting {
                            self.set_state(ConnectionState::Reconnecting);
                        }
                    }
                }
            }

            if !self.loop_cancelled(epoch) {
                self.reconnecting.store(false, Ordering::SeqCst);
            }
        })
    }
}
