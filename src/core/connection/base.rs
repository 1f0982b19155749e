//! Connection state and the WebRTC platform seam.
//!
//! The peer connection, its data channel and the SDP signaling endpoint are
//! platform objects. They are modelled as traits so the
//! [`ConnectionManager`](super::ConnectionManager) can drive any WebRTC stack
//! and can be tested against in-memory fakes.
//!
//! Native peer events (state transitions, data-channel lifecycle, inbound
//! messages and tracks) are reported through the `UnboundedSender<PeerEvent>`
//! handed to [`PeerConnectionFactory::create`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::media::{MediaStream, MediaStreamTrack, TrackKind};
use crate::errors::VoiceResult;

// =============================================================================
// Connection State
// =============================================================================

/// Connection state owned by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Peer reported connected
    Connected,
    /// Reconnecting after connection loss
    Reconnecting,
    /// Connection failed
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Connecting or reconnecting.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Native peer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Native data channel ready state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

// =============================================================================
// Negotiation Types
// =============================================================================

/// ICE server entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Peer connection construction parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerConfiguration {
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
}

impl OfferOptions {
    pub fn audio_only() -> Self {
        Self {
            offer_to_receive_audio: true,
            offer_to_receive_video: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

// =============================================================================
// Transport Statistics
// =============================================================================

/// Inbound RTP statistics for the remote audio track.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundRtpStats {
    pub packets_received: u64,
    pub packets_lost: i64,
    /// Seconds
    pub jitter: f64,
    pub bytes_received: u64,
}

/// Outbound RTP statistics for the local audio track.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundRtpStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
}

/// Nominated ICE candidate pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidatePairStats {
    /// Seconds
    pub current_round_trip_time: Option<f64>,
    /// Bits per second
    pub available_outgoing_bitrate: Option<f64>,
}

/// Subset of `getStats()` used for quality monitoring.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RtcStatsReport {
    pub inbound_audio: Option<InboundRtpStats>,
    pub outbound_audio: Option<OutboundRtpStats>,
    pub candidate_pair: Option<CandidatePairStats>,
}

// =============================================================================
// Platform Traits
// =============================================================================

/// Native events reported by a peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    ConnectionStateChanged(PeerConnectionState),
    DataChannelOpen,
    DataChannelClosed,
    DataChannelMessage(String),
    DataChannelError(String),
    Track(MediaStream),
}

/// Ordered, reliable control-plane channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn ready_state(&self) -> DataChannelState;

    /// Queue a text frame. Frames are delivered in call order.
    fn send_text(&self, text: &str) -> VoiceResult<()>;

    async fn close(&self);
}

/// A WebRTC peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> VoiceResult<Arc<dyn DataChannel>>;

    async fn add_track(&self, track: MediaStreamTrack, stream: &MediaStream) -> VoiceResult<()>;

    /// Swap the outgoing audio track without renegotiation.
    async fn replace_audio_track(&self, track: MediaStreamTrack) -> VoiceResult<()>;

    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> VoiceResult<()>;

    /// Number of transceivers able to carry audio.
    fn audio_transceiver_count(&self) -> usize;

    async fn create_offer(&self, options: OfferOptions) -> VoiceResult<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> VoiceResult<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> VoiceResult<()>;

    fn connection_state(&self) -> PeerConnectionState;

    async fn get_stats(&self) -> VoiceResult<RtcStatsReport>;

    async fn close(&self);
}

/// Builds peer connections.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: PeerConfiguration,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> VoiceResult<Arc<dyn PeerConnection>>;
}

/// SDP offer/answer exchange with the remote service.
#[async_trait]
pub trait SdpSignaler: Send + Sync {
    /// Post the offer and return the answer SDP.
    async fn exchange(&self, offer_sdp: &str, token: &str) -> VoiceResult<String>;
}
