//! Peer transport seam
//!
//! [`PeerTransport`] is everything the signaling controller needs from a
//! peer connection. [`RtcTransport`] implements it on top of webrtc-rs;
//! tests plug in an in-process fake.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use super::signaling::{ConnectionState, SessionDescription};
use crate::config::WebRtcSettings;
use crate::error::{AppError, Result};
use crate::stream::{MediaCodec, PayloadFormat, TrackKind};

/// Resolves once ICE gathering has finished for the current local description
pub type GatheringComplete = BoxFuture<'static, ()>;

const H264_FMTP_DEFAULT: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";
const OPUS_FMTP: &str = "minptime=10;useinbandfec=1";

/// Description of one outbound track to add to a peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSpec {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    pub codec: MediaCodec,
    /// `Rtp` tracks accept whole RTP packets, `Flv` tracks accept samples
    pub format: PayloadFormat,
    pub clock_rate: u32,
    /// H.264 `profile-level-id`, when known from the stream header
    pub profile_level_id: Option<String>,
}

impl TrackSpec {
    pub fn mime_type(&self) -> &'static str {
        match self.codec {
            MediaCodec::H264 => "video/H264",
            MediaCodec::Opus => "audio/opus",
            MediaCodec::Aac => "audio/aac",
            MediaCodec::Other => "application/octet-stream",
        }
    }

    pub fn codec_capability(&self) -> RTCRtpCodecCapability {
        let (channels, sdp_fmtp_line) = match self.codec {
            MediaCodec::H264 => {
                let fmtp = match &self.profile_level_id {
                    Some(id) => format!(
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id={}",
                        id
                    ),
                    None => H264_FMTP_DEFAULT.to_string(),
                };
                (0, fmtp)
            }
            MediaCodec::Opus => (2, OPUS_FMTP.to_string()),
            _ => (0, String::new()),
        };

        RTCRtpCodecCapability {
            mime_type: self.mime_type().to_string(),
            clock_rate: self.clock_rate,
            channels,
            sdp_fmtp_line,
            rtcp_feedback: vec![],
        }
    }
}

/// Destination of a track writer
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Write one payload. Errors are terminal for the track.
    async fn write(&self, payload: Bytes, duration: Duration) -> Result<()>;
}

/// A track that was added to a transport
#[derive(Clone)]
pub struct OutboundTrack {
    pub id: String,
    pub kind: TrackKind,
    pub sink: Arc<dyn MediaSink>,
}

/// What the signaling controller drives
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Apply a remote offer. Malformed SDP is reported as `InvalidOffer`.
    async fn set_remote_offer(&self, offer: &SessionDescription) -> Result<()>;

    /// Create an answer and set it as the local description, which starts
    /// ICE gathering.
    async fn apply_answer(&self) -> Result<GatheringComplete>;

    /// Current local description, candidates included once gathering ended
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn add_track(&self, spec: &TrackSpec) -> Result<OutboundTrack>;

    async fn remove_track(&self, track_id: &str) -> Result<()>;

    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    async fn close(&self) -> Result<()>;
}

/// Creates one transport per signaling session
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, session_id: &str) -> Result<Arc<dyn PeerTransport>>;
}

/// Writes whole RTP packets; SSRC and payload type are rewritten per binding
struct RtpSink {
    track: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl MediaSink for RtpSink {
    async fn write(&self, payload: Bytes, _duration: Duration) -> Result<()> {
        self.track
            .write(&payload)
            .await
            .map(|_| ())
            .map_err(|e| AppError::WriteFailure(e.to_string()))
    }
}

/// Writes encoded samples; the track packetizes them
struct SampleSink {
    track: Arc<TrackLocalStaticSample>,
}

#[async_trait]
impl MediaSink for SampleSink {
    async fn write(&self, payload: Bytes, duration: Duration) -> Result<()> {
        let sample = Sample {
            data: payload,
            duration,
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| AppError::WriteFailure(e.to_string()))
    }
}

/// webrtc-rs peer connection
pub struct RtcTransport {
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
    state_rx: watch::Receiver<ConnectionState>,
    /// Stops RTCP readers on close
    cancel: CancellationToken,
}

impl RtcTransport {
    pub async fn new(settings: &WebRtcSettings, session_id: &str) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = api
            .new_peer_connection(rtc_configuration(settings))
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to create peer connection: {}", e)))?;
        let pc = Arc::new(pc);

        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let state_tx = Arc::new(state_tx);
        let id = session_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state_tx = state_tx.clone();
            let id = id.clone();

            Box::pin(async move {
                let new_state = match s {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => return,
                };

                info!(session_id = %id, "Peer connection state: {}", new_state);
                let _ = state_tx.send(new_state);
            })
        }));

        Ok(Self {
            session_id: session_id.to_string(),
            pc,
            senders: Mutex::new(HashMap::new()),
            state_rx,
            cancel: CancellationToken::new(),
        })
    }

    /// Drain RTCP for one sender so interceptors (NACK, reports) keep running.
    ///
    /// Ends when the sender is removed or the transport closes.
    fn spawn_rtcp_reader(&self, track_id: String, sender: Arc<RTCRtpSender>) {
        let cancel = self.cancel.child_token();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = sender.read(&mut buf) => {
                        if result.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(session_id = %session_id, track_id = %track_id, "RTCP reader stopped");
        });
    }
}

fn rtc_configuration(settings: &WebRtcSettings) -> RTCConfiguration {
    let mut ice_servers = vec![];

    for stun_url in &settings.stun_servers {
        ice_servers.push(RTCIceServer {
            urls: vec![stun_url.clone()],
            ..Default::default()
        });
    }

    for turn in &settings.turn_servers {
        ice_servers.push(RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }

    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn set_remote_offer(&self, offer: &SessionDescription) -> Result<()> {
        let desc = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| AppError::InvalidOffer(e.to_string()))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| AppError::InvalidOffer(e.to_string()))
    }

    async fn apply_answer(&self) -> Result<GatheringComplete> {
        let answer = self.pc.create_answer(None).await?;

        // Must be taken before the local description starts gathering
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(answer).await?;

        Ok(Box::pin(async move {
            let _ = gathered.recv().await;
        }))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .map(|desc| SessionDescription::answer(desc.sdp))
    }

    async fn add_track(&self, spec: &TrackSpec) -> Result<OutboundTrack> {
        let capability = spec.codec_capability();
        let (local, sink): (Arc<dyn TrackLocal + Send + Sync>, Arc<dyn MediaSink>) =
            match spec.format {
                PayloadFormat::Rtp => {
                    let track = Arc::new(TrackLocalStaticRTP::new(
                        capability,
                        spec.id.clone(),
                        spec.stream_id.clone(),
                    ));
                    (track.clone(), Arc::new(RtpSink { track }))
                }
                PayloadFormat::Flv => {
                    let track = Arc::new(TrackLocalStaticSample::new(
                        capability,
                        spec.id.clone(),
                        spec.stream_id.clone(),
                    ));
                    (track.clone(), Arc::new(SampleSink { track }))
                }
            };

        let sender = self
            .pc
            .add_track(local)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to add {} track: {}", spec.kind, e)))?;

        self.senders.lock().insert(spec.id.clone(), sender.clone());
        self.spawn_rtcp_reader(spec.id.clone(), sender);

        Ok(OutboundTrack {
            id: spec.id.clone(),
            kind: spec.kind,
            sink,
        })
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        let sender = self.senders.lock().remove(track_id);
        match sender {
            Some(sender) => {
                self.pc.remove_track(&sender).await?;
                Ok(())
            }
            None => Err(AppError::Internal(format!("Unknown track: {}", track_id))),
        }
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.senders.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to close peer connection: {}", e)))
    }
}

/// Builds [`RtcTransport`]s from the `[webrtc]` settings
pub struct RtcTransportFactory {
    settings: WebRtcSettings,
}

impl RtcTransportFactory {
    pub fn new(settings: WebRtcSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self, session_id: &str) -> Result<Arc<dyn PeerTransport>> {
        Ok(Arc::new(RtcTransport::new(&self.settings, session_id).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(codec: MediaCodec, profile_level_id: Option<&str>) -> TrackSpec {
        TrackSpec {
            id: "video-1".to_string(),
            stream_id: "relay-1".to_string(),
            kind: TrackKind::Video,
            codec,
            format: PayloadFormat::Rtp,
            clock_rate: 90000,
            profile_level_id: profile_level_id.map(str::to_string),
        }
    }

    #[test]
    fn test_h264_capability() {
        let cap = spec(MediaCodec::H264, None).codec_capability();
        assert_eq!(cap.mime_type, "video/H264");
        assert_eq!(cap.clock_rate, 90000);
        assert_eq!(cap.sdp_fmtp_line, H264_FMTP_DEFAULT);

        let cap = spec(MediaCodec::H264, Some("640028")).codec_capability();
        assert!(cap.sdp_fmtp_line.ends_with("profile-level-id=640028"));
    }

    #[test]
    fn test_opus_capability() {
        let mut opus = spec(MediaCodec::Opus, None);
        opus.kind = TrackKind::Audio;
        opus.clock_rate = 48000;
        let cap = opus.codec_capability();
        assert_eq!(cap.mime_type, "audio/opus");
        assert_eq!(cap.channels, 2);
        assert_eq!(cap.sdp_fmtp_line, OPUS_FMTP);
    }

    #[test]
    fn test_ice_servers_from_settings() {
        let settings = WebRtcSettings {
            stun_servers: vec!["stun:stun.example.com:3478".to_string()],
            turn_servers: vec![crate::config::TurnServer {
                urls: vec!["turn:turn.example.com:3478".to_string()],
                username: "user".to_string(),
                credential: "pass".to_string(),
            }],
            ..Default::default()
        };
        let config = rtc_configuration(&settings);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].username, "user");
    }

    #[tokio::test]
    async fn test_rtc_transport_creates_and_closes() {
        let transport = RtcTransport::new(&WebRtcSettings::default(), "test")
            .await
            .unwrap();
        assert_eq!(*transport.connection_state().borrow(), ConnectionState::New);
        assert!(transport.local_description().await.is_none());
        assert!(matches!(
            transport
                .set_remote_offer(&SessionDescription::offer("not sdp"))
                .await,
            Err(AppError::InvalidOffer(_))
        ));
        transport.close().await.unwrap();
    }
}
