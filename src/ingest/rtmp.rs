//! RTMP ingest and playback
//!
//! Each TCP connection runs in its own task: handshake, then an
//! `rml_rtmp` server session driven by socket reads. A connection is
//! either idle, publishing one channel, or playing one channel.
//!
//! Publishing: sequence headers (AVC decoder configuration, AAC
//! AudioSpecificConfig) are collected until the first media message, at
//! which point the channel header is written exactly once. Media messages
//! are appended as FLV tag bodies.
//!
//! Playing: the player gets the channel's cached sequence headers, then
//! live packets from a latest-mode cursor, starting at a video keyframe.

use async_trait::async_trait;
use bytes::Bytes;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult,
};
use rml_rtmp::time::RtmpTimestamp;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{socket_addr, IngestAdapter};
use crate::config::RtmpIngestConfig;
use crate::error::{AppError, Result};
use crate::events::IngestKind;
use crate::media::flv::{aac_sample_rate, AudioTag, VideoTag};
use crate::media::h264::AvcConfig;
use crate::stream::{
    ChannelPublisher, ChannelRegistry, MediaCodec, Packet, PlaybackCursor, ReadError,
    StartPosition, StreamChannel, StreamHeader, TrackInfo, TrackKind,
};
use crate::utils::LogThrottler;
use crate::warn_throttled;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUFFER_SIZE: usize = 4096;
const H264_CLOCK_RATE: u32 = 90000;

/// RTMP listener
pub struct RtmpIngest {
    config: RtmpIngestConfig,
    registry: Arc<ChannelRegistry>,
    listener: TcpListener,
    next_connection_id: AtomicU64,
}

impl RtmpIngest {
    pub async fn bind(config: RtmpIngestConfig, registry: Arc<ChannelRegistry>) -> Result<Self> {
        let addr = socket_addr(&config.bind_address, config.port)?;
        let listener = TcpListener::bind(addr).await?;
        info!("RTMP ingest listening on {}", listener.local_addr()?);

        Ok(Self {
            config,
            registry,
            listener,
            next_connection_id: AtomicU64::new(1),
        })
    }

    async fn serve_connection(
        self: Arc<Self>,
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) {
        debug!(connection = id, %peer, "RTMP connection accepted");
        match self.run_connection(id, stream, shutdown).await {
            Ok(()) => debug!(connection = id, %peer, "RTMP connection closed"),
            Err(e) => info!(connection = id, %peer, "RTMP connection ended: {}", e),
        }
    }

    async fn run_connection(
        &self,
        id: u64,
        mut stream: TcpStream,
        shutdown: CancellationToken,
    ) -> Result<()> {
        stream.set_nodelay(true)?;

        let remaining = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut stream))
            .await
            .map_err(|_| AppError::BadRequest("RTMP handshake timed out".into()))??;

        let (session, initial) = ServerSession::new(ServerSessionConfig::new())
            .map_err(|e| AppError::Internal(format!("RTMP session setup failed: {:?}", e)))?;

        let (mut reader, writer) = stream.into_split();
        let mut conn = RtmpConnection {
            id,
            config: &self.config,
            registry: &self.registry,
            session,
            role: Role::Idle,
            writer,
            closing: false,
            shutdown: shutdown.clone(),
            throttler: LogThrottler::with_secs(5),
        };

        conn.process(initial).await?;
        if !remaining.is_empty() {
            let results = conn.handle_input(&remaining)?;
            conn.process(results).await?;
        }

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let result = loop {
            if conn.closing {
                break Ok(());
            }

            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => break Ok(()),
                        Ok(n) => n,
                        Err(e) => break Err(e.into()),
                    };
                    let results = match conn.handle_input(&buf[..n]) {
                        Ok(results) => results,
                        Err(e) => break Err(e),
                    };
                    if let Err(e) = conn.process(results).await {
                        break Err(e);
                    }
                }
                next = next_play_packet(&mut conn.role) => {
                    if let Err(e) = conn.forward_to_player(next).await {
                        break Err(e);
                    }
                }
            }
        };

        conn.finish();
        result
    }
}

#[async_trait]
impl IngestAdapter for RtmpIngest {
    fn kind(&self) -> IngestKind {
        IngestKind::Rtmp
    }

    fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listener.local_addr().into_iter().collect()
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("RTMP ingest stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                            let this = Arc::clone(&self);
                            tokio::spawn(this.serve_connection(id, stream, peer, shutdown.child_token()));
                        }
                        Err(e) => warn!("RTMP accept failed: {}", e),
                    }
                }
            }
        }
    }
}

/// Run the server side of the RTMP handshake. Returns bytes received past
/// the handshake.
async fn handshake(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut handshake = Handshake::new(PeerType::Server);
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(AppError::BadRequest(
                "connection closed during RTMP handshake".into(),
            ));
        }

        match handshake.process_bytes(&buf[..n]) {
            Ok(HandshakeProcessResult::InProgress { response_bytes }) => {
                stream.write_all(&response_bytes).await?;
            }
            Ok(HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            }) => {
                stream.write_all(&response_bytes).await?;
                return Ok(remaining_bytes);
            }
            Err(e) => {
                return Err(AppError::BadRequest(format!(
                    "RTMP handshake failed: {:?}",
                    e
                )))
            }
        }
    }
}

async fn next_play_packet(role: &mut Role) -> std::result::Result<Packet, ReadError> {
    match role {
        Role::Playing(play) => play.cursor.read_next().await,
        _ => std::future::pending().await,
    }
}

enum Role {
    Idle,
    Publishing(PublishState),
    Playing(PlayState),
}

struct RtmpConnection<'a> {
    id: u64,
    config: &'a RtmpIngestConfig,
    registry: &'a Arc<ChannelRegistry>,
    session: ServerSession,
    role: Role,
    writer: OwnedWriteHalf,
    /// Set after a rejected request; the connection closes once queued
    /// responses are flushed
    closing: bool,
    shutdown: CancellationToken,
    throttler: LogThrottler,
}

impl RtmpConnection<'_> {
    fn handle_input(&mut self, bytes: &[u8]) -> Result<Vec<ServerSessionResult>> {
        self.session
            .handle_input(bytes)
            .map_err(|e| AppError::BadRequest(format!("RTMP protocol error: {:?}", e)))
    }

    async fn process(&mut self, results: Vec<ServerSessionResult>) -> Result<()> {
        let mut queue: VecDeque<_> = results.into();
        while let Some(result) = queue.pop_front() {
            match result {
                ServerSessionResult::OutboundResponse(packet) => {
                    self.writer.write_all(&packet.bytes).await?;
                }
                ServerSessionResult::RaisedEvent(event) => {
                    queue.extend(self.handle_event(event)?);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: ServerSessionEvent) -> Result<Vec<ServerSessionResult>> {
        match event {
            ServerSessionEvent::ConnectionRequested {
                request_id,
                app_name,
            } => {
                debug!(connection = self.id, app = %app_name, "RTMP connect");
                self.accept(request_id)
            }

            ServerSessionEvent::PublishStreamRequested {
                request_id,
                app_name,
                stream_key,
                mode: _,
            } => self.on_publish_requested(request_id, &app_name, &stream_key),

            ServerSessionEvent::PublishStreamFinished { .. } => {
                if let Role::Publishing(state) = std::mem::replace(&mut self.role, Role::Idle) {
                    info!(
                        connection = self.id,
                        channel = %state.publisher.key(),
                        "RTMP publish finished"
                    );
                    state.publisher.close();
                }
                Ok(Vec::new())
            }

            ServerSessionEvent::PlayStreamRequested {
                request_id,
                app_name,
                stream_key,
                stream_id,
                ..
            } => self.on_play_requested(request_id, &app_name, &stream_key, stream_id),

            ServerSessionEvent::PlayStreamFinished { .. } => {
                if matches!(self.role, Role::Playing(_)) {
                    debug!(connection = self.id, "RTMP play finished");
                    self.role = Role::Idle;
                }
                Ok(Vec::new())
            }

            ServerSessionEvent::StreamMetadataChanged {
                stream_key,
                metadata,
                ..
            } => {
                debug!(connection = self.id, stream_key = %stream_key, ?metadata, "RTMP metadata");
                Ok(Vec::new())
            }

            ServerSessionEvent::VideoDataReceived {
                data, timestamp, ..
            } => {
                if let Role::Publishing(state) = &mut self.role {
                    state.on_media(TrackKind::Video, data, timestamp.value, &self.throttler)?;
                }
                Ok(Vec::new())
            }

            ServerSessionEvent::AudioDataReceived {
                data, timestamp, ..
            } => {
                if let Role::Publishing(state) = &mut self.role {
                    state.on_media(TrackKind::Audio, data, timestamp.value, &self.throttler)?;
                }
                Ok(Vec::new())
            }

            _ => Ok(Vec::new()),
        }
    }

    fn accept(&mut self, request_id: u32) -> Result<Vec<ServerSessionResult>> {
        self.session
            .accept_request(request_id)
            .map_err(|e| AppError::Internal(format!("RTMP accept failed: {:?}", e)))
    }

    fn reject(
        &mut self,
        request_id: u32,
        code: &str,
        description: &str,
    ) -> Result<Vec<ServerSessionResult>> {
        self.closing = true;
        self.session
            .reject_request(request_id, code, description)
            .map_err(|e| AppError::Internal(format!("RTMP reject failed: {:?}", e)))
    }

    fn on_publish_requested(
        &mut self,
        request_id: u32,
        app_name: &str,
        stream_key: &str,
    ) -> Result<Vec<ServerSessionResult>> {
        if !matches!(self.role, Role::Idle) {
            return self.reject(
                request_id,
                "NetStream.Publish.BadConnection",
                "Connection is already publishing or playing",
            );
        }

        let key = self.config.keying.resolve(app_name, stream_key);
        match self.registry.publish(&key, IngestKind::Rtmp) {
            Ok(publisher) => {
                info!(connection = self.id, channel = %key, "RTMP publish started");
                self.role = Role::Publishing(PublishState::new(publisher));
                self.accept(request_id)
            }
            Err(AppError::ChannelBusy(_)) => self.reject(
                request_id,
                "NetStream.Publish.BadName",
                "Stream is already being published",
            ),
            Err(e) => Err(e),
        }
    }

    fn on_play_requested(
        &mut self,
        request_id: u32,
        app_name: &str,
        stream_key: &str,
        stream_id: u32,
    ) -> Result<Vec<ServerSessionResult>> {
        if !self.config.allow_play {
            return self.reject(request_id, "NetStream.Play.Failed", "Playback is disabled");
        }
        if !matches!(self.role, Role::Idle) {
            return self.reject(
                request_id,
                "NetStream.Play.Failed",
                "Connection is already publishing or playing",
            );
        }

        let key = self.config.keying.resolve(app_name, stream_key);
        let channel = match self.registry.lookup(&key) {
            Ok(channel) => channel,
            Err(_) => {
                debug!(connection = self.id, channel = %key, "RTMP play for unknown channel");
                return self.reject(request_id, "NetStream.Play.StreamNotFound", "No such stream");
            }
        };

        if channel.ingest() != IngestKind::Rtmp {
            return self.reject(
                request_id,
                "NetStream.Play.Failed",
                "Stream cannot be played over RTMP",
            );
        }

        let results = self.accept(request_id)?;
        let cursor = channel
            .open_cursor(StartPosition::Latest)
            .with_cancel(self.shutdown.child_token());

        info!(connection = self.id, channel = %key, "RTMP play started");
        self.role = Role::Playing(PlayState {
            channel,
            cursor,
            stream_id,
            headers_sent: false,
            awaiting_keyframe: true,
        });
        Ok(results)
    }

    async fn forward_to_player(
        &mut self,
        next: std::result::Result<Packet, ReadError>,
    ) -> Result<()> {
        let Role::Playing(play) = &mut self.role else {
            return Ok(());
        };

        let packet = match next {
            Ok(packet) => packet,
            Err(ReadError::Lagged(skipped)) => {
                warn_throttled!(
                    self.throttler,
                    "play_lagged",
                    connection = self.id,
                    skipped,
                    "RTMP player lagging, waiting for next keyframe"
                );
                play.awaiting_keyframe = true;
                return Ok(());
            }
            Err(ReadError::EndOfStream) | Err(ReadError::Cancelled) => {
                debug!(connection = self.id, "RTMP play source ended");
                self.closing = true;
                return Ok(());
            }
        };

        let mut outbound = Vec::new();

        if !play.headers_sent {
            if let Some(header) = play.channel.header() {
                for (kind, info) in [
                    (TrackKind::Video, header.video.as_ref()),
                    (TrackKind::Audio, header.audio.as_ref()),
                ] {
                    if let Some(config) = info.and_then(|i| i.config.clone()) {
                        outbound.push(send_media(
                            &mut self.session,
                            play.stream_id,
                            kind,
                            config,
                            RtmpTimestamp::new(0),
                            false,
                        )?);
                    }
                }
                play.headers_sent = true;
            }
        }

        if play.awaiting_keyframe {
            let has_video = play
                .channel
                .header()
                .is_some_and(|h| h.video.is_some());
            let is_start = packet.track == TrackKind::Video && packet.is_keyframe;
            if has_video && !is_start {
                return self.write_packets(outbound).await;
            }
            play.awaiting_keyframe = false;
        }

        let timestamp = RtmpTimestamp::new(packet.timestamp.as_millis() as u32);
        let droppable = !packet.is_keyframe;
        outbound.push(send_media(
            &mut self.session,
            play.stream_id,
            packet.track,
            packet.payload,
            timestamp,
            droppable,
        )?);

        self.write_packets(outbound).await
    }

    async fn write_packets(&mut self, packets: Vec<rml_rtmp::chunk_io::Packet>) -> Result<()> {
        for packet in packets {
            self.writer.write_all(&packet.bytes).await?;
        }
        Ok(())
    }

    fn finish(&mut self) {
        match std::mem::replace(&mut self.role, Role::Idle) {
            Role::Publishing(state) => {
                info!(
                    connection = self.id,
                    channel = %state.publisher.key(),
                    "RTMP publisher disconnected"
                );
                state.publisher.close();
            }
            Role::Playing(play) => {
                debug!(connection = self.id, channel = %play.channel.key(), "RTMP player disconnected");
            }
            Role::Idle => {}
        }
    }
}

fn send_media(
    session: &mut ServerSession,
    stream_id: u32,
    kind: TrackKind,
    data: Bytes,
    timestamp: RtmpTimestamp,
    droppable: bool,
) -> Result<rml_rtmp::chunk_io::Packet> {
    let sent = match kind {
        TrackKind::Video => session.send_video_data(stream_id, data, timestamp, droppable),
        TrackKind::Audio => session.send_audio_data(stream_id, data, timestamp, droppable),
    };
    sent.map_err(|e| AppError::Internal(format!("RTMP send failed: {:?}", e)))
}

struct PlayState {
    channel: Arc<StreamChannel>,
    cursor: PlaybackCursor,
    stream_id: u32,
    headers_sent: bool,
    awaiting_keyframe: bool,
}

/// Publisher side of a connection: header capture plus packet appends
struct PublishState {
    publisher: ChannelPublisher,
    video: Option<TrackInfo>,
    audio: Option<TrackInfo>,
    last_video_ms: Option<u32>,
    last_audio_ms: Option<u32>,
}

impl PublishState {
    fn new(publisher: ChannelPublisher) -> Self {
        Self {
            publisher,
            video: None,
            audio: None,
            last_video_ms: None,
            last_audio_ms: None,
        }
    }

    fn on_media(
        &mut self,
        kind: TrackKind,
        data: Bytes,
        timestamp_ms: u32,
        throttler: &LogThrottler,
    ) -> Result<()> {
        let keyframe = match kind {
            TrackKind::Video => match VideoTag::parse(&data) {
                Ok(tag) => {
                    if tag.is_sequence_header() {
                        self.on_video_sequence_header(data, throttler);
                        return Ok(());
                    }
                    if self.video.is_none() {
                        self.video = Some(TrackInfo::flv(tag.codec, H264_CLOCK_RATE, None));
                    }
                    tag.keyframe
                }
                Err(e) => {
                    warn_throttled!(throttler, "bad_video_tag", channel = %self.publisher.key(), "Dropping video tag: {}", e);
                    return Ok(());
                }
            },
            TrackKind::Audio => match AudioTag::parse(&data) {
                Ok(tag) => {
                    if tag.sequence_header {
                        self.on_audio_sequence_header(data, tag.sample_rate);
                        return Ok(());
                    }
                    if self.audio.is_none() {
                        self.audio = Some(TrackInfo::flv(tag.codec, tag.sample_rate, None));
                    }
                    false
                }
                Err(e) => {
                    warn_throttled!(throttler, "bad_audio_tag", channel = %self.publisher.key(), "Dropping audio tag: {}", e);
                    return Ok(());
                }
            },
        };

        self.ensure_header();

        let last = match kind {
            TrackKind::Video => &mut self.last_video_ms,
            TrackKind::Audio => &mut self.last_audio_ms,
        };
        let duration = last
            .map(|prev| Duration::from_millis(timestamp_ms.wrapping_sub(prev) as u64))
            .filter(|d| *d < Duration::from_secs(10))
            .unwrap_or(Duration::ZERO);
        *last = Some(timestamp_ms);

        let packet = Packet::new(kind, Duration::from_millis(timestamp_ms as u64), data)
            .with_duration(duration)
            .keyframe(keyframe);
        self.publisher.append(packet)?;
        Ok(())
    }

    fn on_video_sequence_header(&mut self, data: Bytes, throttler: &LogThrottler) {
        if self.publisher.has_header() {
            warn_throttled!(
                throttler,
                "late_sequence_header",
                channel = %self.publisher.key(),
                "Ignoring sequence header after stream start"
            );
            return;
        }
        match AvcConfig::from_sequence_header(&data) {
            Ok(config) => {
                debug!(
                    channel = %self.publisher.key(),
                    profile_level_id = %config.profile_level_id(),
                    "AVC sequence header"
                );
                self.video = Some(TrackInfo::flv(MediaCodec::H264, H264_CLOCK_RATE, Some(data)));
            }
            Err(e) => warn!(channel = %self.publisher.key(), "Invalid AVC sequence header: {}", e),
        }
    }

    fn on_audio_sequence_header(&mut self, data: Bytes, flv_rate: u32) {
        if self.publisher.has_header() {
            return;
        }
        let rate = aac_sample_rate(&data).unwrap_or(flv_rate);
        self.audio = Some(TrackInfo::flv(MediaCodec::Aac, rate, Some(data)));
    }

    fn ensure_header(&mut self) {
        if self.publisher.has_header() {
            return;
        }
        let header = StreamHeader {
            video: self.video.clone(),
            audio: self.audio.clone(),
        };
        info!(
            channel = %self.publisher.key(),
            video = ?header.video.as_ref().map(|t| t.codec),
            audio = ?header.audio.as_ref().map(|t| t.codec),
            "Stream header captured"
        );
        self.publisher.set_header(header);
    }
}
