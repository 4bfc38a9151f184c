use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::webrtc::signaling::NegotiationState;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Channel already has a publisher: {0}")]
    ChannelBusy(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Invalid offer: {0}")]
    InvalidOffer(String),

    #[error("Cannot {operation} while session is {state}")]
    WrongState {
        state: NegotiationState,
        operation: &'static str,
    },

    #[error("Another negotiation is in progress")]
    NegotiationInProgress,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("ICE gathering did not complete within {0}ms")]
    GatheringTimeout(u64),

    #[error("Media write failed: {0}")]
    WriteFailure(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<webrtc::Error> for AppError {
    fn from(e: webrtc::Error) -> Self {
        AppError::WebRtc(e.to_string())
    }
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ChannelNotFound(_) | AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::ChannelBusy(_)
            | AppError::WrongState { .. }
            | AppError::NegotiationInProgress => StatusCode::CONFLICT,
            AppError::InvalidOffer(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::GatheringTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::ServiceUnavailable(_) | AppError::ChannelClosed(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error_message = %body.message, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error_message = %body.message, "Request rejected");
        }

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
