use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::stream::ChannelInfo;
use crate::webrtc::{SessionDescription, SessionInfo, SignalingSession};

/// Header carrying the signaling session id, both ways
pub const SESSION_HEADER: &str = "x-session-id";

// ============================================================================
// Health & Status
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct IngestStatus {
    pub rtmp: bool,
    pub rtp: bool,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub uptime_secs: u64,
    pub ingest: IngestStatus,
    pub channels: Vec<ChannelInfo>,
    pub sessions: Vec<SessionInfo>,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.uptime_secs(),
        ingest: IngestStatus {
            rtmp: state.config.ingest.rtmp.enabled,
            rtp: state.config.ingest.rtp.enabled,
        },
        channels: state.registry.list(),
        sessions: state.sessions.list().await,
    })
}

// ============================================================================
// Signaling
// ============================================================================

fn parse_offer(body: &[u8]) -> Result<SessionDescription> {
    SessionDescription::parse_offer(body).map_err(AppError::InvalidOffer)
}

fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

async fn find_session(state: &AppState, headers: &HeaderMap) -> Result<Arc<SignalingSession>> {
    state.sessions.get(session_id(headers)).await
}

fn answer_response(session: &SignalingSession, answer: SessionDescription) -> Response {
    ([(SESSION_HEADER, session.id().to_string())], Json(answer)).into_response()
}

/// `POST /createPeerConnection`: new session, first offer/answer round
pub async fn create_peer_connection(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response> {
    let offer = parse_offer(&body)?;
    let session = state.sessions.create_session().await?;

    match session.negotiate(&offer).await {
        Ok(answer) => Ok(answer_response(&session, answer)),
        Err(e) => {
            debug!(session_id = %session.id(), "Discarding session after failed negotiation");
            if let Err(close_err) = state.sessions.close_session(session.id()).await {
                debug!(session_id = %session.id(), "Session already gone: {}", close_err);
            }
            Err(e)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AddVideoQuery {
    pub channel: Option<String>,
}

/// `POST /addVideo[?channel=<key>]`: attach a channel and renegotiate
pub async fn add_video(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AddVideoQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let offer = parse_offer(&body)?;
    let session = find_session(&state, &headers).await?;
    let channel = query
        .channel
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| state.config.webrtc.default_channel.clone());

    let answer = session.add_video(&channel, &offer).await?;
    info!(session_id = %session.id(), channel = %channel, "Video added");
    Ok(answer_response(&session, answer))
}

/// `POST /removeVideo`: detach the first attached channel and renegotiate
pub async fn remove_video(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let offer = parse_offer(&body)?;
    let session = find_session(&state, &headers).await?;

    let answer = session.remove_video(&offer).await?;
    info!(session_id = %session.id(), "Video removed");
    Ok(answer_response(&session, answer))
}

#[derive(Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

/// `POST /closePeerConnection`
pub async fn close_peer_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ActionResponse>> {
    let session = find_session(&state, &headers).await?;
    state.sessions.close_session(session.id()).await?;

    Ok(Json(ActionResponse {
        success: true,
        message: "Session closed".to_string(),
    }))
}
