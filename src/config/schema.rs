use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP signaling server
    pub web: WebConfig,
    /// Per-channel packet bus limits
    pub bus: BusConfig,
    /// RTMP and RTP/UDP ingest
    pub ingest: IngestConfig,
    /// Peer connection and session settings
    pub webrtc: WebRtcSettings,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.web.http_port == 0 {
            return Err(AppError::Config("web.http_port must be non-zero".into()));
        }
        if self.bus.capacity == 0 {
            return Err(AppError::Config("bus.capacity must be non-zero".into()));
        }
        if self.bus.retain >= self.bus.capacity {
            return Err(AppError::Config(
                "bus.retain must be smaller than bus.capacity".into(),
            ));
        }

        let rtmp = &self.ingest.rtmp;
        if rtmp.enabled {
            if rtmp.port == 0 {
                return Err(AppError::Config("ingest.rtmp.port must be non-zero".into()));
            }
            if let ChannelKeying::Fixed(name) = &rtmp.keying {
                if name.trim().is_empty() {
                    return Err(AppError::Config(
                        "ingest.rtmp.keying fixed name must not be empty".into(),
                    ));
                }
            }
        }

        let rtp = &self.ingest.rtp;
        if rtp.enabled {
            if rtp.video_port == 0 || rtp.audio_port == 0 {
                return Err(AppError::Config("ingest.rtp ports must be non-zero".into()));
            }
            if rtp.video_port == rtp.audio_port {
                return Err(AppError::Config(
                    "ingest.rtp video_port and audio_port must differ".into(),
                ));
            }
            if rtp.channel.trim().is_empty() {
                return Err(AppError::Config("ingest.rtp.channel must not be empty".into()));
            }
            if rtp.idle_timeout_ms == 0 {
                return Err(AppError::Config(
                    "ingest.rtp.idle_timeout_ms must be non-zero".into(),
                ));
            }
        }

        if self.webrtc.gathering_timeout_ms == 0 {
            return Err(AppError::Config(
                "webrtc.gathering_timeout_ms must be non-zero".into(),
            ));
        }
        if self.webrtc.max_sessions == 0 {
            return Err(AppError::Config("webrtc.max_sessions must be non-zero".into()));
        }

        Ok(())
    }
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

/// Packet bus configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Hard cap on buffered packets; lagging cursors get a gap past this
    pub capacity: usize,
    /// Packets kept behind the slowest cursor for oldest-mode readers
    pub retain: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            retain: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub rtmp: RtmpIngestConfig,
    pub rtp: RtpIngestConfig,
}

/// How an ingest connection is mapped to a channel key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKeying {
    /// Use the publish path (`app/stream_key`)
    #[default]
    Path,
    /// Every publish lands on one fixed key
    Fixed(String),
}

impl ChannelKeying {
    /// Resolve the channel key for an RTMP `app` + stream key pair.
    pub fn resolve(&self, app_name: &str, stream_key: &str) -> String {
        match self {
            ChannelKeying::Fixed(name) => name.clone(),
            ChannelKeying::Path => {
                let app = app_name.trim_matches('/');
                let key = stream_key.trim_matches('/');
                match (app.is_empty(), key.is_empty()) {
                    (true, _) => key.to_string(),
                    (false, true) => app.to_string(),
                    (false, false) => format!("{}/{}", app, key),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtmpIngestConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
    pub keying: ChannelKeying,
    /// Allow RTMP clients to `play` live channels
    pub allow_play: bool,
}

impl Default for RtmpIngestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0".to_string(),
            port: 1935,
            keying: ChannelKeying::Path,
            allow_play: true,
        }
    }
}

/// Codec carried on the RTP video port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtpVideoCodec {
    H264,
}

/// Codec carried on the RTP audio port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtpAudioCodec {
    Opus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtpIngestConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub video_port: u16,
    pub audio_port: u16,
    /// Fixed channel key for the single RTP stream
    pub channel: String,
    pub idle_timeout_ms: u64,
    pub video_codec: RtpVideoCodec,
    pub audio_codec: RtpAudioCodec,
}

impl Default for RtpIngestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            video_port: 5004,
            audio_port: 5005,
            channel: "live".to_string(),
            idle_timeout_ms: 5000,
            video_codec: RtpVideoCodec::H264,
            audio_codec: RtpAudioCodec::Opus,
        }
    }
}

/// TURN server entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcSettings {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
    pub gathering_timeout_ms: u64,
    pub max_sessions: usize,
    /// Channel used by `/addVideo` without `?channel=`
    pub default_channel: String,
    pub enable_audio: bool,
}

impl Default for WebRtcSettings {
    fn default() -> Self {
        Self {
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            gathering_timeout_ms: 5000,
            max_sessions: 8,
            default_channel: "live".to_string(),
            enable_audio: true,
        }
    }
}
