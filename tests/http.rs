//! Signaling endpoints driven through the router with an in-memory transport

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceExt;

use live_relay::config::AppConfig;
use live_relay::events::IngestKind;
use live_relay::state::AppState;
use live_relay::stream::{ChannelPublisher, MediaCodec, StreamHeader, TrackInfo};
use live_relay::web::{create_router, SESSION_HEADER};
use live_relay::webrtc::{
    ConnectionState, GatheringComplete, MediaSink, OutboundTrack, PeerTransport,
    SessionDescription, TrackSpec, TransportFactory,
};
use live_relay::{AppError, Result};

struct DiscardSink;

#[async_trait]
impl MediaSink for DiscardSink {
    async fn write(&self, _payload: Bytes, _duration: Duration) -> Result<()> {
        Ok(())
    }
}

struct LoopbackTransport {
    rounds: parking_lot::Mutex<usize>,
    state_tx: watch::Sender<ConnectionState>,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn set_remote_offer(&self, offer: &SessionDescription) -> Result<()> {
        if offer.sdp.starts_with("v=0") {
            Ok(())
        } else {
            Err(AppError::InvalidOffer("missing version line".to_string()))
        }
    }

    async fn apply_answer(&self) -> Result<GatheringComplete> {
        *self.rounds.lock() += 1;
        Ok(Box::pin(async {}))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let rounds = *self.rounds.lock();
        Some(SessionDescription::answer(format!("v=0 round {}", rounds)))
    }

    async fn add_track(&self, spec: &TrackSpec) -> Result<OutboundTrack> {
        Ok(OutboundTrack {
            id: spec.id.clone(),
            kind: spec.kind,
            sink: Arc::new(DiscardSink),
        })
    }

    async fn remove_track(&self, _track_id: &str) -> Result<()> {
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct LoopbackFactory;

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(&self, _session_id: &str) -> Result<Arc<dyn PeerTransport>> {
        let (state_tx, _) = watch::channel(ConnectionState::New);
        Ok(Arc::new(LoopbackTransport {
            rounds: parking_lot::Mutex::new(0),
            state_tx,
        }))
    }
}

fn app_state() -> Arc<AppState> {
    AppState::new(AppConfig::default(), Arc::new(LoopbackFactory))
}

fn publish_cam1(state: &AppState) -> ChannelPublisher {
    let publisher = state.registry.publish("cam1", IngestKind::Rtp).unwrap();
    publisher.set_header(StreamHeader {
        video: Some(TrackInfo::rtp(MediaCodec::H264, 90000)),
        audio: Some(TrackInfo::rtp(MediaCodec::Opus, 48000)),
    });
    publisher
}

fn offer_body() -> String {
    json!({ "type": "offer", "sdp": "v=0\r\n" }).to_string()
}

fn post(uri: &str, session: Option<&str>, body: impl Into<Body>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(id) = session {
        builder = builder.header(SESSION_HEADER, id);
    }
    builder.body(body.into()).unwrap()
}

async fn send(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, Option<String>, Value) {
    let response = create_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let session = response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, session, body)
}

#[tokio::test]
async fn create_peer_connection_returns_answer_and_session_id() {
    let state = app_state();

    let (status, session, body) = send(&state, post("/createPeerConnection", None, offer_body())).await;

    assert_eq!(status, StatusCode::OK);
    assert!(session.is_some());
    assert_eq!(body["type"], "answer");
    assert_eq!(body["sdp"], "v=0 round 1");
    assert_eq!(state.sessions.session_count().await, 1);
}

#[tokio::test]
async fn malformed_offer_is_rejected() {
    let state = app_state();

    let (status, _, body) = send(&state, post("/createPeerConnection", None, "not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let answer = json!({ "type": "answer", "sdp": "v=0" }).to_string();
    let (status, _, _) = send(&state, post("/createPeerConnection", None, answer)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(state.sessions.session_count().await, 0);
}

#[tokio::test]
async fn rejected_sdp_discards_the_session() {
    let state = app_state();
    let garbage = json!({ "type": "offer", "sdp": "garbage" }).to_string();

    let (status, _, _) = send(&state, post("/createPeerConnection", None, garbage)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(state.sessions.session_count().await, 0);
}

#[tokio::test]
async fn add_video_requires_a_session() {
    let state = app_state();
    let _publisher = publish_cam1(&state);

    let (status, _, _) = send(&state, post("/addVideo?channel=cam1", None, offer_body())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(
        &state,
        post("/addVideo?channel=cam1", Some("unknown"), offer_body()),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn add_video_for_missing_channel_is_not_found() {
    let state = app_state();
    let (_, session, _) = send(&state, post("/createPeerConnection", None, offer_body())).await;

    let (status, _, body) = send(
        &state,
        post("/addVideo?channel=nope", session.as_deref(), offer_body()),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["message"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn add_and_remove_video_renegotiates() {
    let state = app_state();
    let _publisher = publish_cam1(&state);
    let (_, session, _) = send(&state, post("/createPeerConnection", None, offer_body())).await;
    let session = session.unwrap();

    let (status, returned, body) = send(
        &state,
        post("/addVideo?channel=cam1", Some(&session), offer_body()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(returned.as_deref(), Some(session.as_str()));
    assert_eq!(body["sdp"], "v=0 round 2");

    let info = state.sessions.list().await;
    assert_eq!(info[0].tracks.len(), 2);
    assert_eq!(info[0].rounds, 2);

    let (status, _, body) = send(&state, post("/removeVideo", Some(&session), offer_body())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sdp"], "v=0 round 3");
    assert!(state.sessions.list().await[0].tracks.is_empty());

    // Nothing left to remove: still answered so the browser leaves have-local-offer
    let (status, _, body) = send(&state, post("/removeVideo", Some(&session), offer_body())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sdp"], "v=0 round 4");
}

#[tokio::test]
async fn add_video_without_query_uses_default_channel() {
    let state = app_state();
    let publisher = state.registry.publish("live", IngestKind::Rtmp).unwrap();
    publisher.set_header(StreamHeader {
        video: Some(TrackInfo::rtp(MediaCodec::H264, 90000)),
        audio: None,
    });
    let (_, session, _) = send(&state, post("/createPeerConnection", None, offer_body())).await;

    let (status, _, _) = send(&state, post("/addVideo", session.as_deref(), offer_body())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(state.sessions.list().await[0].tracks[0].channel, "live");
}

#[tokio::test]
async fn close_peer_connection_removes_the_session() {
    let state = app_state();
    let (_, session, _) = send(&state, post("/createPeerConnection", None, offer_body())).await;
    let session = session.unwrap();

    let (status, _, body) = send(&state, post("/closePeerConnection", Some(&session), "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(state.sessions.session_count().await, 0);

    let (status, _, _) = send(&state, post("/closePeerConnection", Some(&session), "")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_and_status() {
    let state = app_state();
    let _publisher = publish_cam1(&state);

    let request = Request::builder().uri("/api/health").body(Body::empty()).unwrap();
    let (status, _, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let request = Request::builder().uri("/api/status").body(Body::empty()).unwrap();
    let (status, _, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["channels"][0]["key"], "cam1");
    assert_eq!(body["sessions"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn index_page_is_served() {
    let state = app_state();
    let request = Request::builder().uri("/").body(Body::empty()).unwrap();

    let response = create_router(state).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/html"));
}
