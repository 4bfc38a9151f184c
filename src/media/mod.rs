//! Media framing helpers
//!
//! Just enough FLV, H.264 and RTP parsing to classify packets, capture
//! decoder configuration, and convert RTMP video into WebRTC samples.

pub mod flv;
pub mod h264;
pub mod rtp;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("FLV tag too short ({0} bytes)")]
    ShortTag(usize),
    #[error("invalid AVC decoder configuration record")]
    InvalidAvcConfig,
    #[error("truncated NAL unit")]
    TruncatedNalu,
}
