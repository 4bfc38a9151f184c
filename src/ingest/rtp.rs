//! RTP over UDP ingest
//!
//! Two sockets, one per media kind, feed a single fixed channel. One task
//! reads both sockets so the channel has exactly one writer. The channel
//! is claimed on the first valid datagram and released after
//! `idle_timeout_ms` without traffic.
//!
//! Datagrams are forwarded untouched; the outbound RTP track rewrites
//! SSRC and payload type.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::util::Unmarshal;

use super::{socket_addr, IngestAdapter};
use crate::config::{RtpAudioCodec, RtpIngestConfig, RtpVideoCodec};
use crate::error::{AppError, Result};
use crate::events::IngestKind;
use crate::media::rtp::h264_payload_is_keyframe;
use crate::stream::{
    ChannelPublisher, ChannelRegistry, MediaCodec, Packet, StreamHeader, TrackInfo, TrackKind,
};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// UDP MTU-sized receive buffer
const RECV_BUFFER_SIZE: usize = 1600;

pub struct RtpIngest {
    config: RtpIngestConfig,
    registry: Arc<ChannelRegistry>,
    video: UdpSocket,
    audio: UdpSocket,
    throttler: LogThrottler,
}

impl RtpIngest {
    pub async fn bind(config: RtpIngestConfig, registry: Arc<ChannelRegistry>) -> Result<Self> {
        let video = UdpSocket::bind(socket_addr(&config.bind_address, config.video_port)?).await?;
        let audio = UdpSocket::bind(socket_addr(&config.bind_address, config.audio_port)?).await?;
        info!(
            channel = %config.channel,
            "RTP ingest listening on {} (video), {} (audio)",
            video.local_addr()?,
            audio.local_addr()?
        );

        Ok(Self {
            config,
            registry,
            video,
            audio,
            throttler: LogThrottler::with_secs(5),
        })
    }

    fn header(&self) -> StreamHeader {
        let video = match self.config.video_codec {
            RtpVideoCodec::H264 => TrackInfo::rtp(MediaCodec::H264, 90000),
        };
        let audio = match self.config.audio_codec {
            RtpAudioCodec::Opus => TrackInfo::rtp(MediaCodec::Opus, 48000),
        };
        StreamHeader {
            video: Some(video),
            audio: Some(audio),
        }
    }

    fn on_datagram(&self, kind: TrackKind, data: &[u8], state: &mut IngestState) {
        let rtp = match rtp::packet::Packet::unmarshal(&mut &data[..]) {
            Ok(rtp) => rtp,
            Err(e) => {
                warn_throttled!(self.throttler, "invalid_rtp", %kind, "Dropping invalid RTP datagram: {}", e);
                return;
            }
        };

        state.last_activity = Instant::now();

        if state.publisher.is_none() {
            match self.registry.publish(&self.config.channel, IngestKind::Rtp) {
                Ok(publisher) => {
                    publisher.set_header(self.header());
                    info!(channel = %self.config.channel, "RTP stream started");
                    state.publisher = Some(publisher);
                    state.origin = Instant::now();
                }
                Err(e) => {
                    warn_throttled!(self.throttler, "rtp_publish", channel = %self.config.channel, "RTP stream rejected: {}", e);
                    return;
                }
            }
        }

        let Some(publisher) = state.publisher.as_ref() else {
            return;
        };

        let keyframe = kind == TrackKind::Video && h264_payload_is_keyframe(&rtp.payload);
        let packet = Packet::new(kind, state.origin.elapsed(), Bytes::copy_from_slice(data))
            .keyframe(keyframe);
        if let Err(e) = publisher.append(packet) {
            warn!(channel = %self.config.channel, "RTP append failed: {}", e);
            state.close("append failed");
        }
    }
}

struct IngestState {
    publisher: Option<ChannelPublisher>,
    origin: Instant,
    last_activity: Instant,
}

impl IngestState {
    fn close(&mut self, reason: &str) {
        if let Some(publisher) = self.publisher.take() {
            info!(channel = %publisher.key(), reason, "RTP stream stopped");
            publisher.close();
        }
    }
}

#[async_trait]
impl IngestAdapter for RtpIngest {
    fn kind(&self) -> IngestKind {
        IngestKind::Rtp
    }

    fn local_addrs(&self) -> Vec<SocketAddr> {
        [self.video.local_addr(), self.audio.local_addr()]
            .into_iter()
            .filter_map(|addr| addr.ok())
            .collect()
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms);
        let mut idle_check = tokio::time::interval((idle_timeout / 4).max(Duration::from_millis(10)));
        idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut video_buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut audio_buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut state = IngestState {
            publisher: None,
            origin: Instant::now(),
            last_activity: Instant::now(),
        };

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                received = self.video.recv_from(&mut video_buf) => match received {
                    Ok((n, _peer)) => self.on_datagram(TrackKind::Video, &video_buf[..n], &mut state),
                    Err(e) => break Err(AppError::Io(e)),
                },
                received = self.audio.recv_from(&mut audio_buf) => match received {
                    Ok((n, _peer)) => self.on_datagram(TrackKind::Audio, &audio_buf[..n], &mut state),
                    Err(e) => break Err(AppError::Io(e)),
                },
                _ = idle_check.tick() => {
                    if state.publisher.is_some() && state.last_activity.elapsed() >= idle_timeout {
                        state.close("idle");
                    }
                }
            }
        };

        match &result {
            Ok(()) => {
                state.close("shutdown");
                debug!("RTP ingest stopped");
            }
            Err(e) => {
                state.close("socket error");
                warn!("RTP ingest failed: {}", e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::events::EventBus;
    use crate::stream::{PayloadFormat, StartPosition};
    use tokio::time::timeout;

    fn rtp_datagram(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x80, 96];
        out.extend_from_slice(&seq.to_be_bytes());
        out.extend_from_slice(&(seq as u32 * 3000).to_be_bytes());
        out.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    async fn start(idle_timeout_ms: u64) -> (Arc<ChannelRegistry>, Arc<RtpIngest>, CancellationToken) {
        let registry = ChannelRegistry::new(BusConfig::default(), Arc::new(EventBus::new()));
        let config = RtpIngestConfig {
            bind_address: "127.0.0.1".to_string(),
            video_port: 0,
            audio_port: 0,
            idle_timeout_ms,
            ..Default::default()
        };
        let ingest = Arc::new(RtpIngest::bind(config, Arc::clone(&registry)).await.unwrap());
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::clone(&ingest).run(shutdown.clone()));
        (registry, ingest, shutdown)
    }

    async fn wait_for_channel(registry: &ChannelRegistry, present: bool) {
        timeout(Duration::from_secs(2), async {
            while registry.lookup("live").is_ok() != present {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("channel state did not change");
    }

    #[tokio::test]
    async fn test_first_datagram_creates_channel() {
        let (registry, ingest, shutdown) = start(60_000).await;
        let addrs = ingest.local_addrs();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        assert!(registry.lookup("live").is_err());
        sender.send_to(&rtp_datagram(1, &[0x65, 0x88]), addrs[0]).await.unwrap();
        wait_for_channel(&registry, true).await;

        let channel = registry.lookup("live").unwrap();
        let header = channel.header().unwrap();
        assert_eq!(header.video.as_ref().unwrap().format, PayloadFormat::Rtp);
        assert_eq!(header.audio.as_ref().unwrap().codec, MediaCodec::Opus);

        let mut cursor = channel.open_cursor(StartPosition::Latest);
        let second = rtp_datagram(2, &[0x41, 0x9A]);
        sender.send_to(&second, addrs[0]).await.unwrap();

        // The two sockets are read concurrently; only order within one is kept
        let video = timeout(Duration::from_secs(1), cursor.read_next()).await.unwrap().unwrap();
        assert_eq!(video.track, TrackKind::Video);
        assert!(!video.is_keyframe);
        assert_eq!(video.payload.as_ref(), &second[..]);

        sender.send_to(&rtp_datagram(3, &[0xFC]), addrs[1]).await.unwrap();
        let audio = timeout(Duration::from_secs(1), cursor.read_next()).await.unwrap().unwrap();
        assert_eq!(audio.track, TrackKind::Audio);

        shutdown.cancel();
        wait_for_channel(&registry, false).await;
    }

    #[tokio::test]
    async fn test_invalid_datagram_is_ignored() {
        let (registry, ingest, shutdown) = start(60_000).await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&[0x00, 0x01], ingest.local_addrs()[0]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.lookup("live").is_err());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_idle_stream_is_removed() {
        let (registry, ingest, shutdown) = start(50).await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&rtp_datagram(1, &[0x65]), ingest.local_addrs()[0])
            .await
            .unwrap();

        wait_for_channel(&registry, true).await;
        wait_for_channel(&registry, false).await;

        // Traffic after teardown claims the channel again
        sender
            .send_to(&rtp_datagram(2, &[0x65]), ingest.local_addrs()[0])
            .await
            .unwrap();
        wait_for_channel(&registry, true).await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_busy_channel_is_not_replaced() {
        let (registry, ingest, shutdown) = start(60_000).await;
        let rtmp = registry.publish("live", IngestKind::Rtmp).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&rtp_datagram(1, &[0x65]), ingest.local_addrs()[0])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let channel = registry.lookup("live").unwrap();
        assert_eq!(channel.publisher_id(), rtmp.id());
        assert_eq!(channel.bus().stats().appended, 0);
        shutdown.cancel();
    }
}
