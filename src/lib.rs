//! live-relay - live stream relay from RTMP / RTP ingest to WebRTC viewers
//!
//! Publishers push into per-channel packet buses held by a single
//! [`stream::ChannelRegistry`]. Browsers negotiate over plain HTTP
//! offer/answer endpoints and receive the channel through WebRTC tracks.

pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod media;
pub mod state;
pub mod stream;
pub mod utils;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
