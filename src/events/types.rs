//! System event types
//!
//! Everything the relay announces over the event bus. Events are serialized
//! as `{"event": "<name>", "data": {...}}`.

use serde::{Deserialize, Serialize};

use crate::webrtc::signaling::{ConnectionState, NegotiationState};

/// Which ingest path produced a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestKind {
    Rtmp,
    Rtp,
}

impl std::fmt::Display for IngestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestKind::Rtmp => write!(f, "rtmp"),
            IngestKind::Rtp => write!(f, "rtp"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    /// A publisher claimed a channel key
    #[serde(rename = "channel.published")]
    ChannelPublished {
        channel: String,
        publisher_id: u64,
    },

    /// A channel was removed and its bus closed
    #[serde(rename = "channel.closed")]
    ChannelClosed {
        channel: String,
        /// Packets appended over the channel's lifetime
        packets: u64,
    },

    /// A second publisher tried to claim a busy key
    #[serde(rename = "channel.publish_rejected")]
    ChannelPublishRejected {
        channel: String,
        ingest: IngestKind,
        reason: String,
    },

    /// Signaling session moved to a new negotiation state
    #[serde(rename = "session.state_changed")]
    SessionStateChanged {
        session_id: String,
        state: NegotiationState,
    },

    /// Peer transport reported a connectivity change
    #[serde(rename = "session.connection_changed")]
    SessionConnectionChanged {
        session_id: String,
        state: ConnectionState,
    },

    /// A track writer stopped
    #[serde(rename = "session.track_closed")]
    SessionTrackClosed {
        session_id: String,
        track_id: String,
        reason: String,
    },

    #[serde(rename = "system.error")]
    SystemError {
        module: String,
        message: String,
    },
}

impl SystemEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ChannelPublished { .. } => "channel.published",
            Self::ChannelClosed { .. } => "channel.closed",
            Self::ChannelPublishRejected { .. } => "channel.publish_rejected",
            Self::SessionStateChanged { .. } => "session.state_changed",
            Self::SessionConnectionChanged { .. } => "session.connection_changed",
            Self::SessionTrackClosed { .. } => "session.track_closed",
            Self::SystemError { .. } => "system.error",
        }
    }

    /// Topic filter: `*`, `prefix.*`, or an exact event name.
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if let Some(prefix) = topic.strip_suffix(".*") {
            event_name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
        } else {
            event_name == topic
        }
    }
}
