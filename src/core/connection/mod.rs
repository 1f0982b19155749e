pub mod base;
pub mod manager;
pub mod reconnect;
pub mod signaling;

pub use base::{
    CandidatePairStats, ConnectionState, DataChannel, DataChannelState, IceServer,
    InboundRtpStats, OfferOptions, OutboundRtpStats, PeerConfiguration, PeerConnection,
    PeerConnectionFactory, PeerConnectionState, PeerEvent, RtcStatsReport, SdpSignaler, SdpType,
    SessionDescription, TransceiverDirection,
};
pub use manager::{ConnectionEvent, ConnectionManager, ConnectionManagerConfig, DATA_CHANNEL_LABEL};
pub use reconnect::ReconnectionConfig;
pub use signaling::HttpSdpSignaler;
