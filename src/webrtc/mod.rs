//! WebRTC playback side of the relay
//!
//! ```text
//! HTTP offer ──▶ SessionManager ──▶ SignalingSession ──▶ PeerTransport
//!                                        │
//!                                        └─ TrackWriter ◀── PlaybackCursor ◀── PacketBus
//! ```
//!
//! Each browser gets one [`SignalingSession`]. `addVideo` looks up a
//! channel, adds outbound tracks to the session's transport, renegotiates,
//! then starts one [`TrackWriter`] per track at the channel's write head.

pub mod manager;
pub mod session;
pub mod signaling;
pub mod track;
pub mod transport;

pub use manager::SessionManager;
pub use session::{SessionInfo, SignalingSession, TrackStatus};
pub use signaling::{ConnectionState, NegotiationState, SdpType, SessionDescription};
pub use track::{CloseReason, Converter, Pacer, TrackClosed, TrackWriter};
pub use transport::{
    GatheringComplete, MediaSink, OutboundTrack, PeerTransport, RtcTransport, RtcTransportFactory,
    TrackSpec, TransportFactory,
};
