//! Media packets and stream headers

use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;

/// Which track of a stream a packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// How packet payloads of a track are framed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// Complete RTP packets, forwarded as-is
    Rtp,
    /// FLV tag bodies as carried in RTMP audio/video messages
    Flv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaCodec {
    H264,
    Opus,
    Aac,
    /// Anything the relay forwards to RTMP players but cannot send over WebRTC
    Other,
}

impl MediaCodec {
    /// Codecs that have a WebRTC counterpart
    pub fn is_webrtc_compatible(&self) -> bool {
        matches!(self, MediaCodec::H264 | MediaCodec::Opus)
    }
}

/// Codec parameters of one track
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackInfo {
    pub codec: MediaCodec,
    pub format: PayloadFormat,
    pub clock_rate: u32,
    /// Decoder configuration, as the full FLV sequence-header tag body
    #[serde(skip)]
    pub config: Option<Bytes>,
}

impl TrackInfo {
    pub fn rtp(codec: MediaCodec, clock_rate: u32) -> Self {
        Self {
            codec,
            format: PayloadFormat::Rtp,
            clock_rate,
            config: None,
        }
    }

    pub fn flv(codec: MediaCodec, clock_rate: u32, config: Option<Bytes>) -> Self {
        Self {
            codec,
            format: PayloadFormat::Flv,
            clock_rate,
            config,
        }
    }
}

/// Immutable codec description of a channel, written once per publish
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamHeader {
    pub video: Option<TrackInfo>,
    pub audio: Option<TrackInfo>,
}

impl StreamHeader {
    pub fn track(&self, kind: TrackKind) -> Option<&TrackInfo> {
        match kind {
            TrackKind::Video => self.video.as_ref(),
            TrackKind::Audio => self.audio.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }
}

/// One encoded media unit, immutable once appended to a bus
#[derive(Debug, Clone)]
pub struct Packet {
    pub track: TrackKind,
    /// Presentation time relative to the start of the publish
    pub timestamp: Duration,
    /// Zero when the producer does not know it
    pub duration: Duration,
    pub is_keyframe: bool,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(track: TrackKind, timestamp: Duration, payload: Bytes) -> Self {
        Self {
            track,
            timestamp,
            duration: Duration::ZERO,
            is_keyframe: false,
            payload,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn keyframe(mut self, is_keyframe: bool) -> Self {
        self.is_keyframe = is_keyframe;
        self
    }
}
