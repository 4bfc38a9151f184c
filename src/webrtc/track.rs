//! Track writers: cursor to outbound WebRTC track
//!
//! One [`TrackWriter`] task runs per attached outbound track. It reads its
//! channel through a latest-mode [`PlaybackCursor`], keeps only packets of
//! its own kind, converts them to what the sink expects, paces them to the
//! stream clock and writes them out. It stops on end-of-stream,
//! cancellation or the first write failure, and reports why.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::transport::{MediaSink, TrackSpec};
use crate::error::{AppError, Result};
use crate::media::flv::VideoTag;
use crate::media::h264::{flv_to_annexb, AvcConfig};
use crate::media::MediaError;
use crate::stream::{
    MediaCodec, Packet, PayloadFormat, PlaybackCursor, ReadError, StreamHeader, TrackKind,
};
use crate::utils::LogThrottler;
use crate::warn_throttled;

const DEFAULT_VIDEO_DURATION: Duration = Duration::from_millis(33);
const DEFAULT_AUDIO_DURATION: Duration = Duration::from_millis(20);

/// Timestamp jumps larger than this restart pacing instead of stalling
const MAX_PACING_GAP: Duration = Duration::from_secs(1);

/// Why a track writer stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    EndOfStream,
    Cancelled,
    WriteFailed(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::EndOfStream => write!(f, "end of stream"),
            CloseReason::Cancelled => write!(f, "cancelled"),
            CloseReason::WriteFailed(e) => write!(f, "write failed: {}", e),
        }
    }
}

/// Sent by a writer when it terminates
#[derive(Debug, Clone)]
pub struct TrackClosed {
    pub track_id: String,
    pub reason: CloseReason,
}

/// Payload conversion from bus packets to sink input
#[derive(Debug, Clone)]
pub enum Converter {
    /// RTP packets or Opus samples, written unchanged
    Passthrough,
    /// FLV AVC tags to Annex-B access units
    FlvH264(AvcConfig),
}

impl Converter {
    /// `Ok(None)` for packets the sink has no use for (sequence headers).
    pub fn convert(&self, packet: &Packet) -> std::result::Result<Option<Bytes>, MediaError> {
        match self {
            Converter::Passthrough => Ok(Some(packet.payload.clone())),
            Converter::FlvH264(config) => {
                let tag = VideoTag::parse(&packet.payload)?;
                if tag.codec != MediaCodec::H264 || tag.is_sequence_header() {
                    return Ok(None);
                }
                flv_to_annexb(&packet.payload, config).map(Some)
            }
        }
    }
}

/// One track to attach for a channel
#[derive(Debug, Clone)]
pub struct TrackPlan {
    pub spec: TrackSpec,
    pub converter: Converter,
}

/// Work out which outbound tracks a channel can feed.
///
/// Video is mandatory; audio is added when enabled and WebRTC-compatible.
/// A channel whose header is not yet written, or whose video cannot be
/// sent over WebRTC, is unavailable.
pub fn plan_tracks(
    channel: &str,
    header: Option<&StreamHeader>,
    prefix: &str,
    enable_audio: bool,
) -> Result<Vec<TrackPlan>> {
    let header = header.ok_or_else(|| {
        AppError::ServiceUnavailable(format!("Channel {} has not started streaming", channel))
    })?;

    let video = header
        .video
        .as_ref()
        .filter(|info| info.codec.is_webrtc_compatible())
        .ok_or_else(|| {
            AppError::ServiceUnavailable(format!(
                "Channel {} has no WebRTC-compatible video",
                channel
            ))
        })?;

    let (converter, profile_level_id) = match video.format {
        PayloadFormat::Rtp => (Converter::Passthrough, None),
        PayloadFormat::Flv => {
            let config = video
                .config
                .as_deref()
                .map(AvcConfig::from_sequence_header)
                .transpose()
                .map_err(|e| AppError::ServiceUnavailable(format!("Channel {}: {}", channel, e)))?
                .ok_or_else(|| {
                    AppError::ServiceUnavailable(format!(
                        "Channel {} has no AVC decoder configuration",
                        channel
                    ))
                })?;
            let profile_level_id = config.profile_level_id();
            (Converter::FlvH264(config), Some(profile_level_id))
        }
    };

    let mut plans = vec![TrackPlan {
        spec: TrackSpec {
            id: format!("{}-video", prefix),
            stream_id: prefix.to_string(),
            kind: TrackKind::Video,
            codec: video.codec,
            format: video.format,
            clock_rate: video.clock_rate,
            profile_level_id,
        },
        converter,
    }];

    if enable_audio {
        match header.audio.as_ref() {
            Some(audio) if audio.codec.is_webrtc_compatible() => plans.push(TrackPlan {
                spec: TrackSpec {
                    id: format!("{}-audio", prefix),
                    stream_id: prefix.to_string(),
                    kind: TrackKind::Audio,
                    codec: audio.codec,
                    format: audio.format,
                    clock_rate: audio.clock_rate,
                    profile_level_id: None,
                },
                converter: Converter::Passthrough,
            }),
            Some(audio) => {
                debug!(channel, codec = ?audio.codec, "Audio codec not relayable over WebRTC");
            }
            None => {}
        }
    }

    Ok(plans)
}

/// Maps stream timestamps to wall-clock deadlines
#[derive(Debug, Default)]
pub struct Pacer {
    anchor: Option<(Instant, Duration)>,
}

impl Pacer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.anchor = None;
    }

    /// Deadline for a packet stamped `timestamp`, or `None` to send now.
    ///
    /// Re-anchors on the first packet, on timestamps going backwards and on
    /// forward jumps beyond [`MAX_PACING_GAP`].
    pub fn deadline(&mut self, timestamp: Duration, now: Instant) -> Option<Instant> {
        let Some((start, base)) = self.anchor else {
            self.anchor = Some((now, timestamp));
            return None;
        };

        let Some(offset) = timestamp.checked_sub(base) else {
            self.anchor = Some((now, timestamp));
            return None;
        };

        let due = start + offset;
        if due > now + MAX_PACING_GAP {
            self.anchor = Some((now, timestamp));
            return None;
        }
        (due > now).then_some(due)
    }
}

/// Worker that streams one track of a channel into one sink
pub struct TrackWriter {
    session_id: String,
    track_id: String,
    kind: TrackKind,
    cursor: PlaybackCursor,
    sink: Arc<dyn MediaSink>,
    converter: Converter,
    pacer: Pacer,
    closed_tx: mpsc::UnboundedSender<TrackClosed>,
    throttler: LogThrottler,
}

impl TrackWriter {
    pub fn new(
        session_id: impl Into<String>,
        track_id: impl Into<String>,
        kind: TrackKind,
        cursor: PlaybackCursor,
        sink: Arc<dyn MediaSink>,
        converter: Converter,
        closed_tx: mpsc::UnboundedSender<TrackClosed>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            track_id: track_id.into(),
            kind,
            cursor,
            sink,
            converter,
            pacer: Pacer::new(),
            closed_tx,
            throttler: LogThrottler::with_secs(5),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(
            session_id = %self.session_id,
            track_id = %self.track_id,
            channel = %self.cursor.bus().name(),
            "Track writer started"
        );

        let reason = self.stream().await;

        match &reason {
            CloseReason::WriteFailed(e) => {
                warn!(session_id = %self.session_id, track_id = %self.track_id, "Track write failed: {}", e)
            }
            reason => {
                info!(session_id = %self.session_id, track_id = %self.track_id, "Track writer stopped: {}", reason)
            }
        }

        let Self {
            track_id,
            cursor,
            closed_tx,
            ..
        } = self;
        // Release the cursor before reporting
        drop(cursor);
        let _ = closed_tx.send(TrackClosed { track_id, reason });
    }

    async fn stream(&mut self) -> CloseReason {
        let default_duration = match self.kind {
            TrackKind::Video => DEFAULT_VIDEO_DURATION,
            TrackKind::Audio => DEFAULT_AUDIO_DURATION,
        };
        let cancel = self.cursor.cancel_token();
        let mut awaiting_keyframe = self.kind == TrackKind::Video;

        loop {
            let packet = match self.cursor.read_next().await {
                Ok(packet) => packet,
                Err(ReadError::EndOfStream) => return CloseReason::EndOfStream,
                Err(ReadError::Cancelled) => return CloseReason::Cancelled,
                Err(ReadError::Lagged(skipped)) => {
                    warn_throttled!(
                        self.throttler,
                        "lagged",
                        session_id = %self.session_id,
                        track_id = %self.track_id,
                        "Track writer fell behind, skipped {} packets",
                        skipped
                    );
                    awaiting_keyframe = self.kind == TrackKind::Video;
                    self.pacer.reset();
                    continue;
                }
            };

            if packet.track != self.kind {
                continue;
            }
            if awaiting_keyframe {
                if !packet.is_keyframe {
                    continue;
                }
                awaiting_keyframe = false;
            }

            let payload = match self.converter.convert(&packet) {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    warn_throttled!(
                        self.throttler,
                        "convert",
                        track_id = %self.track_id,
                        "Dropping unconvertible packet: {}",
                        e
                    );
                    continue;
                }
            };

            if let Some(deadline) = self.pacer.deadline(packet.timestamp, Instant::now()) {
                tokio::select! {
                    _ = cancel.cancelled() => return CloseReason::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }

            let duration = if packet.duration.is_zero() {
                default_duration
            } else {
                packet.duration
            };

            trace!(track_id = %self.track_id, bytes = payload.len(), "Writing packet");
            if let Err(e) = self.sink.write(payload, duration).await {
                return CloseReason::WriteFailed(e.to_string());
            }
        }
    }
}
