//! Signaling session: negotiation state machine plus attached tracks
//!
//! ```text
//! New ──offer──▶ HaveOffer ──answer──▶ Answering ──gathered──▶ Stable
//!  ▲                                                             │
//!  └──────────── addVideo / removeVideo / renegotiate ◀──────────┘
//!
//! any ──transport failed / gathering timeout──▶ Failed ──▶ Closed
//! ```
//!
//! Only one negotiation round runs at a time; a request arriving while one
//! is in flight fails fast with `NegotiationInProgress`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::signaling::{ConnectionState, NegotiationState, SessionDescription};
use super::track::{plan_tracks, CloseReason, TrackClosed, TrackWriter};
use super::transport::{OutboundTrack, PeerTransport};
use crate::config::WebRtcSettings;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::stream::{ChannelRegistry, StartPosition, TrackKind};

struct AttachedTrack {
    id: String,
    kind: TrackKind,
    cancel: CancellationToken,
    finished: Option<CloseReason>,
}

/// Tracks added by one `addVideo` call
struct Attachment {
    id: u64,
    channel: String,
    tracks: Vec<AttachedTrack>,
}

/// Track summary for status output
#[derive(Debug, Clone, Serialize)]
pub struct TrackStatus {
    pub track_id: String,
    pub kind: TrackKind,
    pub channel: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub state: NegotiationState,
    pub connection: ConnectionState,
    pub rounds: u64,
    pub uptime_secs: u64,
    pub tracks: Vec<TrackStatus>,
}

pub struct SignalingSession {
    id: String,
    created_at: Instant,
    transport: Arc<dyn PeerTransport>,
    registry: Arc<ChannelRegistry>,
    events: Arc<EventBus>,
    gathering_timeout: Duration,
    enable_audio: bool,
    state: watch::Sender<NegotiationState>,
    /// Held for the whole of a negotiation round
    negotiation: tokio::sync::Mutex<()>,
    attachments: parking_lot::Mutex<Vec<Attachment>>,
    next_attachment: AtomicU64,
    rounds: AtomicU64,
    /// Parent of every track writer's cancel token
    cancel: CancellationToken,
    closed_tx: mpsc::UnboundedSender<TrackClosed>,
}

impl SignalingSession {
    pub fn new(
        id: impl Into<String>,
        transport: Arc<dyn PeerTransport>,
        registry: Arc<ChannelRegistry>,
        events: Arc<EventBus>,
        settings: &WebRtcSettings,
    ) -> Arc<Self> {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(NegotiationState::New);
        let connection_rx = transport.connection_state();

        let session = Arc::new(Self {
            id: id.into(),
            created_at: Instant::now(),
            transport,
            registry,
            events,
            gathering_timeout: Duration::from_millis(settings.gathering_timeout_ms),
            enable_audio: settings.enable_audio,
            state,
            negotiation: tokio::sync::Mutex::new(()),
            attachments: parking_lot::Mutex::new(Vec::new()),
            next_attachment: AtomicU64::new(1),
            rounds: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            closed_tx,
        });

        tokio::spawn(Self::monitor(
            Arc::downgrade(&session),
            session.cancel.clone(),
            closed_rx,
            connection_rx,
        ));

        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NegotiationState> {
        self.state.subscribe()
    }

    /// Completed negotiation rounds
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Outbound tracks currently negotiated on the transport
    pub fn track_count(&self) -> usize {
        self.attachments
            .lock()
            .iter()
            .map(|a| a.tracks.len())
            .sum()
    }

    pub fn info(&self) -> SessionInfo {
        let tracks = self
            .attachments
            .lock()
            .iter()
            .flat_map(|a| {
                a.tracks.iter().map(|t| TrackStatus {
                    track_id: t.id.clone(),
                    kind: t.kind,
                    channel: a.channel.clone(),
                    active: t.finished.is_none(),
                })
            })
            .collect();

        SessionInfo {
            session_id: self.id.clone(),
            state: self.state(),
            connection: *self.transport.connection_state().borrow(),
            rounds: self.rounds(),
            uptime_secs: self.created_at.elapsed().as_secs(),
            tracks,
        }
    }

    /// Plain offer/answer round without touching tracks
    pub async fn negotiate(&self, offer: &SessionDescription) -> Result<SessionDescription> {
        let _round = self.begin("negotiate")?;
        self.round(offer, "negotiate").await
    }

    /// Attach the video (and audio, if relayable) of `channel` and renegotiate.
    ///
    /// Track writers start only once the round succeeds; a failed round
    /// removes the tracks it added.
    pub async fn add_video(
        &self,
        channel: &str,
        offer: &SessionDescription,
    ) -> Result<SessionDescription> {
        let _round = self.begin("addVideo")?;

        let channel = self.registry.lookup(channel)?;
        let attachment_id = self.next_attachment.fetch_add(1, Ordering::Relaxed);
        let prefix = format!("relay-{}", attachment_id);
        let plans = plan_tracks(channel.key(), channel.header(), &prefix, self.enable_audio)?;

        let mut added: Vec<OutboundTrack> = Vec::with_capacity(plans.len());
        for plan in &plans {
            match self.transport.add_track(&plan.spec).await {
                Ok(track) => added.push(track),
                Err(e) => {
                    self.remove_tracks(added.iter().map(|t| t.id.as_str())).await;
                    return Err(e);
                }
            }
        }

        let answer = match self.round(offer, "addVideo").await {
            Ok(answer) => answer,
            Err(e) => {
                if !self.state().is_terminal() {
                    self.remove_tracks(added.iter().map(|t| t.id.as_str())).await;
                }
                return Err(e);
            }
        };

        let tracks = added
            .into_iter()
            .zip(plans)
            .map(|(track, plan)| {
                let cancel = self.cancel.child_token();
                let cursor = channel
                    .open_cursor(StartPosition::Latest)
                    .with_cancel(cancel.clone());
                TrackWriter::new(
                    self.id.clone(),
                    track.id.clone(),
                    track.kind,
                    cursor,
                    track.sink,
                    plan.converter,
                    self.closed_tx.clone(),
                )
                .spawn();

                AttachedTrack {
                    id: track.id,
                    kind: track.kind,
                    cancel,
                    finished: None,
                }
            })
            .collect::<Vec<_>>();

        info!(
            session_id = %self.id,
            channel = %channel.key(),
            tracks = tracks.len(),
            "Attached channel"
        );
        self.attachments.lock().push(Attachment {
            id: attachment_id,
            channel: channel.key().to_string(),
            tracks,
        });

        Ok(answer)
    }

    /// Detach the oldest attachment, if any, and renegotiate.
    ///
    /// The offer is applied before anything is detached, so a rejected
    /// offer leaves the attachment and its writers running.
    pub async fn remove_video(&self, offer: &SessionDescription) -> Result<SessionDescription> {
        let _round = self.begin("removeVideo")?;

        self.apply_offer(offer, "removeVideo").await?;

        let attachment = {
            let mut attachments = self.attachments.lock();
            if attachments.is_empty() {
                None
            } else {
                Some(attachments.remove(0))
            }
        };

        match attachment {
            Some(attachment) => {
                for track in &attachment.tracks {
                    track.cancel.cancel();
                }
                self.remove_tracks(attachment.tracks.iter().map(|t| t.id.as_str()))
                    .await;
                info!(
                    session_id = %self.id,
                    channel = %attachment.channel,
                    attachment = attachment.id,
                    "Detached channel"
                );
            }
            None => debug!(session_id = %self.id, "No attachment to remove"),
        }

        self.answer("removeVideo").await
    }

    /// Close the session: cancel every writer and close the transport.
    pub async fn close(&self) {
        if self.transition(NegotiationState::Closed) {
            self.teardown().await;
        }
    }

    /// Move to `Failed` and tear down. No-op once terminal.
    pub async fn fail(&self, reason: &str) {
        if self.transition(NegotiationState::Failed) {
            warn!(session_id = %self.id, "Session failed: {}", reason);
            self.teardown().await;
        }
    }

    fn begin(&self, operation: &'static str) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        let guard = self
            .negotiation
            .try_lock()
            .map_err(|_| AppError::NegotiationInProgress)?;

        let state = self.state();
        if !state.accepts_negotiation() {
            return Err(AppError::WrongState { state, operation });
        }
        Ok(guard)
    }

    async fn round(
        &self,
        offer: &SessionDescription,
        operation: &'static str,
    ) -> Result<SessionDescription> {
        self.apply_offer(offer, operation).await?;
        self.answer(operation).await
    }

    /// First half of a round. A rejected offer leaves the state untouched.
    async fn apply_offer(&self, offer: &SessionDescription, operation: &'static str) -> Result<()> {
        self.transport.set_remote_offer(offer).await?;
        self.enter(NegotiationState::HaveOffer, operation)
    }

    /// Second half of a round: answer, wait for gathering, go `Stable`.
    ///
    /// Every failure past this point leaves the session terminal.
    async fn answer(&self, operation: &'static str) -> Result<SessionDescription> {
        let gathered = match self.transport.apply_answer().await {
            Ok(gathered) => gathered,
            Err(e) => {
                self.fail(&format!("failed to apply answer: {}", e)).await;
                return Err(e);
            }
        };
        self.enter(NegotiationState::Answering, operation)?;

        tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(AppError::WrongState { state: self.state(), operation });
            }
            result = tokio::time::timeout(self.gathering_timeout, gathered) => {
                if result.is_err() {
                    let ms = self.gathering_timeout.as_millis() as u64;
                    self.fail("ICE gathering timed out").await;
                    return Err(AppError::GatheringTimeout(ms));
                }
            }
        }

        let Some(answer) = self.transport.local_description().await else {
            self.fail("no local description after gathering").await;
            return Err(AppError::Internal(
                "No local description after negotiation".to_string(),
            ));
        };
        self.enter(NegotiationState::Stable, operation)?;

        let round = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(session_id = %self.id, round, operation, "Negotiation round complete");
        Ok(answer)
    }

    fn enter(&self, next: NegotiationState, operation: &'static str) -> Result<()> {
        if self.transition(next) {
            Ok(())
        } else {
            Err(AppError::WrongState {
                state: self.state(),
                operation,
            })
        }
    }

    /// Apply a state change. Terminal states only move `Failed -> Closed`.
    fn transition(&self, next: NegotiationState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            let allowed = match *state {
                NegotiationState::Closed => false,
                NegotiationState::Failed => next == NegotiationState::Closed,
                current => current != next,
            };
            if allowed {
                *state = next;
            }
            allowed
        });

        if changed {
            debug!(session_id = %self.id, "Session state: {}", next);
            self.events.publish(SystemEvent::SessionStateChanged {
                session_id: self.id.clone(),
                state: next,
            });
        }
        changed
    }

    async fn remove_tracks<'a>(&self, ids: impl Iterator<Item = &'a str>) {
        for id in ids {
            if let Err(e) = self.transport.remove_track(id).await {
                warn!(session_id = %self.id, track_id = id, "Failed to remove track: {}", e);
            }
        }
    }

    async fn teardown(&self) {
        self.cancel.cancel();
        self.attachments.lock().clear();
        if let Err(e) = self.transport.close().await {
            warn!(session_id = %self.id, "Failed to close transport: {}", e);
        }
        info!(session_id = %self.id, "Session {}", self.state());
    }

    fn on_track_closed(&self, closed: TrackClosed) {
        let mut attachments = self.attachments.lock();
        let track = attachments
            .iter_mut()
            .flat_map(|a| a.tracks.iter_mut())
            .find(|t| t.id == closed.track_id);
        if let Some(track) = track {
            track.finished = Some(closed.reason.clone());
        }
        drop(attachments);

        self.events.publish(SystemEvent::SessionTrackClosed {
            session_id: self.id.clone(),
            track_id: closed.track_id,
            reason: closed.reason.to_string(),
        });
    }

    async fn on_connection_state(&self, state: ConnectionState) {
        self.events.publish(SystemEvent::SessionConnectionChanged {
            session_id: self.id.clone(),
            state,
        });

        match state {
            ConnectionState::Failed => self.fail("peer connection failed").await,
            ConnectionState::Closed => self.close().await,
            _ => {}
        }
    }

    /// Watches writer reports and transport state until the session ends
    async fn monitor(
        session: Weak<Self>,
        cancel: CancellationToken,
        mut closed_rx: mpsc::UnboundedReceiver<TrackClosed>,
        mut connection_rx: watch::Receiver<ConnectionState>,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(closed) = closed_rx.recv() => {
                    let Some(session) = session.upgrade() else { break };
                    session.on_track_closed(closed);
                }
                changed = connection_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *connection_rx.borrow_and_update();
                    let Some(session) = session.upgrade() else { break };
                    session.on_connection_state(state).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::stream::{MediaCodec, Packet, StreamHeader, TrackInfo};
    use crate::webrtc::transport::{GatheringComplete, MediaSink, TrackSpec};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::Notify;
    use tokio::time::timeout;

    struct CountingSink(AtomicUsize);

    #[async_trait]
    impl MediaSink for CountingSink {
        async fn write(&self, _payload: Bytes, _duration: Duration) -> Result<()> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct FakeTransport {
        tracks: Mutex<Vec<String>>,
        answers: AtomicUsize,
        hold_gathering: AtomicBool,
        never_gather: AtomicBool,
        no_description: AtomicBool,
        release: Arc<Notify>,
        sink: Arc<CountingSink>,
        state_tx: watch::Sender<ConnectionState>,
        closed: AtomicBool,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            let (state_tx, _) = watch::channel(ConnectionState::New);
            Arc::new(Self {
                tracks: Mutex::new(Vec::new()),
                answers: AtomicUsize::new(0),
                hold_gathering: AtomicBool::new(false),
                never_gather: AtomicBool::new(false),
                no_description: AtomicBool::new(false),
                release: Arc::new(Notify::new()),
                sink: Arc::new(CountingSink(AtomicUsize::new(0))),
                state_tx,
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn set_remote_offer(&self, offer: &SessionDescription) -> Result<()> {
            if offer.sdp.starts_with("v=0") {
                Ok(())
            } else {
                Err(AppError::InvalidOffer("bad sdp".to_string()))
            }
        }

        async fn apply_answer(&self) -> Result<GatheringComplete> {
            self.answers.fetch_add(1, Ordering::Relaxed);
            if self.never_gather.load(Ordering::Relaxed) {
                return Ok(Box::pin(futures::future::pending()));
            }
            if self.hold_gathering.load(Ordering::Relaxed) {
                let release = self.release.clone();
                return Ok(Box::pin(async move { release.notified().await }));
            }
            Ok(Box::pin(async {}))
        }

        async fn local_description(&self) -> Option<SessionDescription> {
            if self.no_description.load(Ordering::Relaxed) {
                return None;
            }
            let n = self.answers.load(Ordering::Relaxed);
            (n > 0).then(|| SessionDescription::answer(format!("v=0 answer {}", n)))
        }

        async fn add_track(&self, spec: &TrackSpec) -> Result<OutboundTrack> {
            self.tracks.lock().push(spec.id.clone());
            Ok(OutboundTrack {
                id: spec.id.clone(),
                kind: spec.kind,
                sink: self.sink.clone(),
            })
        }

        async fn remove_track(&self, track_id: &str) -> Result<()> {
            self.tracks.lock().retain(|id| id != track_id);
            Ok(())
        }

        fn connection_state(&self) -> watch::Receiver<ConnectionState> {
            self.state_tx.subscribe()
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    struct Fixture {
        registry: Arc<ChannelRegistry>,
        transport: Arc<FakeTransport>,
        session: Arc<SignalingSession>,
        _publisher: crate::stream::ChannelPublisher,
    }

    fn fixture() -> Fixture {
        let events = Arc::new(EventBus::new());
        let registry = ChannelRegistry::new(BusConfig::default(), events.clone());
        let publisher = registry
            .publish("cam1", crate::events::IngestKind::Rtp)
            .unwrap();
        publisher.set_header(StreamHeader {
            video: Some(TrackInfo::rtp(MediaCodec::H264, 90000)),
            audio: Some(TrackInfo::rtp(MediaCodec::Opus, 48000)),
        });

        let transport = FakeTransport::new();
        let settings = WebRtcSettings {
            gathering_timeout_ms: 100,
            enable_audio: false,
            ..Default::default()
        };
        let session = SignalingSession::new(
            "s1",
            transport.clone(),
            registry.clone(),
            events,
            &settings,
        );

        Fixture {
            registry,
            transport,
            session,
            _publisher: publisher,
        }
    }

    fn offer() -> SessionDescription {
        SessionDescription::offer("v=0\r\n")
    }

    async fn wait_for_cursors(registry: &ChannelRegistry, count: usize) {
        let bus = registry.lookup("cam1").unwrap().bus().clone();
        timeout(Duration::from_secs(1), async {
            while bus.stats().cursors != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cursor count did not settle");
    }

    #[tokio::test]
    async fn test_add_remove_add_ends_stable() {
        let f = fixture();

        f.session.add_video("cam1", &offer()).await.unwrap();
        f.session.remove_video(&offer()).await.unwrap();
        let answer = f.session.add_video("cam1", &offer()).await.unwrap();

        assert_eq!(answer.sdp, "v=0 answer 3");
        assert_eq!(f.session.state(), NegotiationState::Stable);
        assert_eq!(f.session.rounds(), 3);
        assert_eq!(f.session.track_count(), 1);
        assert_eq!(f.transport.tracks.lock().as_slice(), ["relay-2-video"]);
        wait_for_cursors(&f.registry, 1).await;
    }

    #[tokio::test]
    async fn test_concurrent_add_is_rejected_then_retry_succeeds() {
        let f = fixture();
        f.transport.hold_gathering.store(true, Ordering::Relaxed);

        let first = {
            let session = f.session.clone();
            tokio::spawn(async move { session.add_video("cam1", &offer()).await })
        };

        let mut state = f.session.subscribe_state();
        timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == NegotiationState::Answering),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(matches!(
            f.session.add_video("cam1", &offer()).await,
            Err(AppError::NegotiationInProgress)
        ));

        f.transport.hold_gathering.store(false, Ordering::Relaxed);
        f.transport.release.notify_one();
        first.await.unwrap().unwrap();

        f.session.add_video("cam1", &offer()).await.unwrap();
        assert_eq!(f.session.rounds(), 2);
        assert_eq!(f.session.track_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_channel_creates_nothing() {
        let f = fixture();
        assert!(matches!(
            f.session.add_video("missing", &offer()).await,
            Err(AppError::ChannelNotFound(_))
        ));
        assert_eq!(f.session.state(), NegotiationState::New);
        assert!(f.transport.tracks.lock().is_empty());
        assert_eq!(f.registry.lookup("cam1").unwrap().bus().stats().cursors, 0);
    }

    #[tokio::test]
    async fn test_invalid_offer_rolls_back_tracks() {
        let f = fixture();
        let bad = SessionDescription::offer("garbage");
        assert!(matches!(
            f.session.add_video("cam1", &bad).await,
            Err(AppError::InvalidOffer(_))
        ));
        assert_eq!(f.session.state(), NegotiationState::New);
        assert!(f.transport.tracks.lock().is_empty());
        assert_eq!(f.session.track_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_remove_keeps_attachment() {
        let f = fixture();
        f.session.add_video("cam1", &offer()).await.unwrap();
        wait_for_cursors(&f.registry, 1).await;

        let bad = SessionDescription::offer("garbage");
        assert!(matches!(
            f.session.remove_video(&bad).await,
            Err(AppError::InvalidOffer(_))
        ));

        assert_eq!(f.session.state(), NegotiationState::Stable);
        assert_eq!(f.session.rounds(), 1);
        assert_eq!(f.session.track_count(), 1);
        assert_eq!(f.transport.tracks.lock().as_slice(), ["relay-1-video"]);
        // A cancelled writer would have released its cursor by now
        tokio::time::sleep(Duration::from_millis(20)).await;
        wait_for_cursors(&f.registry, 1).await;

        f.session.remove_video(&offer()).await.unwrap();
        assert_eq!(f.session.track_count(), 0);
        wait_for_cursors(&f.registry, 0).await;
    }

    #[tokio::test]
    async fn test_remove_without_attachment_still_answers() {
        let f = fixture();
        f.session.negotiate(&offer()).await.unwrap();

        let answer = f.session.remove_video(&offer()).await.unwrap();

        assert_eq!(answer.sdp, "v=0 answer 2");
        assert_eq!(f.session.rounds(), 2);
        assert_eq!(f.session.state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn test_missing_local_description_fails_session() {
        let f = fixture();
        f.transport.no_description.store(true, Ordering::Relaxed);

        assert!(matches!(
            f.session.negotiate(&offer()).await,
            Err(AppError::Internal(_))
        ));
        assert_eq!(f.session.state(), NegotiationState::Failed);
        assert!(f.transport.closed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_gathering_timeout_fails_session() {
        let f = fixture();
        f.transport.never_gather.store(true, Ordering::Relaxed);

        assert!(matches!(
            f.session.negotiate(&offer()).await,
            Err(AppError::GatheringTimeout(100))
        ));
        assert_eq!(f.session.state(), NegotiationState::Failed);
        assert!(f.transport.closed.load(Ordering::Relaxed));

        assert!(matches!(
            f.session.add_video("cam1", &offer()).await,
            Err(AppError::WrongState {
                state: NegotiationState::Failed,
                ..
            })
        ));

        f.session.close().await;
        assert_eq!(f.session.state(), NegotiationState::Closed);
    }

    #[tokio::test]
    async fn test_close_cancels_writers() {
        let f = fixture();
        f.session.add_video("cam1", &offer()).await.unwrap();
        wait_for_cursors(&f.registry, 1).await;

        f.session.close().await;
        assert_eq!(f.session.state(), NegotiationState::Closed);
        wait_for_cursors(&f.registry, 0).await;
        assert!(f.transport.closed.load(Ordering::Relaxed));

        let err = f.session.add_video("cam1", &offer()).await.unwrap_err();
        assert_eq!(err.to_string(), "Cannot addVideo while session is closed");

        // Closing twice is harmless
        f.session.close().await;
    }

    #[tokio::test]
    async fn test_transport_failure_fails_session() {
        let f = fixture();
        f.session.add_video("cam1", &offer()).await.unwrap();
        wait_for_cursors(&f.registry, 1).await;

        f.transport.state_tx.send_replace(ConnectionState::Failed);

        let mut state = f.session.subscribe_state();
        timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == NegotiationState::Failed),
        )
        .await
        .unwrap()
        .unwrap();
        wait_for_cursors(&f.registry, 0).await;
    }

    #[tokio::test]
    async fn test_writer_end_of_stream_is_reported() {
        let f = fixture();
        f.session.add_video("cam1", &offer()).await.unwrap();
        wait_for_cursors(&f.registry, 1).await;

        let channel = f.registry.lookup("cam1").unwrap();
        channel
            .bus()
            .append(
                Packet::new(TrackKind::Video, Duration::ZERO, Bytes::from_static(&[0x65]))
                    .keyframe(true),
            )
            .unwrap();
        timeout(Duration::from_secs(1), async {
            while f.transport.sink.0.load(Ordering::Relaxed) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let Fixture {
            session,
            _publisher: publisher,
            ..
        } = f;
        publisher.close();

        timeout(Duration::from_secs(1), async {
            while session.info().tracks.iter().any(|t| t.active) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // The session itself survives the end of its channel
        assert_eq!(session.state(), NegotiationState::Stable);
        assert_eq!(session.track_count(), 1);
    }
}
