//! Signaling message types and session states

use serde::{Deserialize, Serialize};

/// SDP message type, serialized the way browsers emit `RTCSessionDescription`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description exchanged over HTTP (`{"type": "offer", "sdp": "..."}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Parse a request body into an offer.
    ///
    /// Anything other than a JSON offer with a non-empty SDP is rejected,
    /// so callers can map every failure to `InvalidOffer`.
    pub fn parse_offer(body: &[u8]) -> Result<Self, String> {
        let desc: SessionDescription =
            serde_json::from_slice(body).map_err(|e| format!("malformed offer: {}", e))?;
        if desc.sdp_type != SdpType::Offer {
            return Err(format!("expected an offer, got {:?}", desc.sdp_type));
        }
        if desc.sdp.trim().is_empty() {
            return Err("offer has an empty SDP".to_string());
        }
        Ok(desc)
    }
}

/// Negotiation state of a signaling session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    New,
    HaveOffer,
    Answering,
    Stable,
    Failed,
    Closed,
}

impl NegotiationState {
    /// Track attach/detach and renegotiation are only accepted here
    pub fn accepts_negotiation(&self) -> bool {
        matches!(self, NegotiationState::New | NegotiationState::Stable)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationState::New => write!(f, "new"),
            NegotiationState::HaveOffer => write!(f, "have-offer"),
            NegotiationState::Answering => write!(f, "answering"),
            NegotiationState::Stable => write!(f, "stable"),
            NegotiationState::Failed => write!(f, "failed"),
            NegotiationState::Closed => write!(f, "closed"),
        }
    }
}

/// Connection state notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_offer_parses() {
        let body = br#"{"type":"offer","sdp":"v=0\r\n"}"#;
        let offer = SessionDescription::parse_offer(body).unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert_eq!(offer.sdp, "v=0\r\n");
    }

    #[test]
    fn test_invalid_offers_rejected() {
        assert!(SessionDescription::parse_offer(b"not json").is_err());
        assert!(SessionDescription::parse_offer(br#"{"type":"answer","sdp":"v=0"}"#).is_err());
        assert!(SessionDescription::parse_offer(br#"{"type":"offer","sdp":"  "}"#).is_err());
        assert!(SessionDescription::parse_offer(br#"{"sdp":"v=0"}"#).is_err());
    }

    #[test]
    fn test_answer_serialization() {
        let json = serde_json::to_value(SessionDescription::answer("v=0")).unwrap();
        assert_eq!(json["type"], "answer");
        assert_eq!(json["sdp"], "v=0");
    }

    #[test]
    fn test_state_names() {
        assert_eq!(
            serde_json::to_string(&NegotiationState::HaveOffer).unwrap(),
            "\"have-offer\""
        );
        assert_eq!(NegotiationState::HaveOffer.to_string(), "have-offer");
        assert_eq!(NegotiationState::Stable.to_string(), "stable");
        assert!(NegotiationState::Stable.accepts_negotiation());
        assert!(!NegotiationState::Answering.accepts_negotiation());
        assert!(NegotiationState::Failed.is_terminal());
    }
}
