//! Signaling protocol definitions
//!
//! A `SignalingMessage` is what one participant sends to the other through
//! the relay. The relay forwards it untouched; only the sender creates it.

use serde::{Deserialize, Serialize};

use crate::error::SignalingError;
use crate::types::SessionId;
use crate::MAX_PAYLOAD_SIZE;

/// ICE candidate descriptor, as produced by the browser's `RTCIceCandidate`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Messages exchanged between the two participants of a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalingMessage {
    Offer {
        session_id: SessionId,
        sender_id: String,
        sdp: String,
    },
    Answer {
        session_id: SessionId,
        sender_id: String,
        sdp: String,
    },
    IceCandidate {
        session_id: SessionId,
        sender_id: String,
        candidate: IceCandidate,
    },
    Hangup {
        session_id: SessionId,
        sender_id: String,
    },
    Heartbeat {
        session_id: SessionId,
        sender_id: String,
    },
}

/// Discriminant of a `SignalingMessage`, handy for logging and matching
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Offer,
    Answer,
    IceCandidate,
    Hangup,
    Heartbeat,
}

impl SignalingMessage {
    pub fn offer(session_id: SessionId, sender_id: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self::Offer {
            session_id,
            sender_id: sender_id.into(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(session_id: SessionId, sender_id: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self::Answer {
            session_id,
            sender_id: sender_id.into(),
            sdp: sdp.into(),
        }
    }

    pub fn ice_candidate(
        session_id: SessionId,
        sender_id: impl Into<String>,
        candidate: IceCandidate,
    ) -> Self {
        Self::IceCandidate {
            session_id,
            sender_id: sender_id.into(),
            candidate,
        }
    }

    pub fn hangup(session_id: SessionId, sender_id: impl Into<String>) -> Self {
        Self::Hangup {
            session_id,
            sender_id: sender_id.into(),
        }
    }

    pub fn heartbeat(session_id: SessionId, sender_id: impl Into<String>) -> Self {
        Self::Heartbeat {
            session_id,
            sender_id: sender_id.into(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Offer { session_id, .. }
            | Self::Answer { session_id, .. }
            | Self::IceCandidate { session_id, .. }
            | Self::Hangup { session_id, .. }
            | Self::Heartbeat { session_id, .. } => *session_id,
        }
    }

    pub fn sender_id(&self) -> &str {
        match self {
            Self::Offer { sender_id, .. }
            | Self::Answer { sender_id, .. }
            | Self::IceCandidate { sender_id, .. }
            | Self::Hangup { sender_id, .. }
            | Self::Heartbeat { sender_id, .. } => sender_id,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Offer { .. } => MessageKind::Offer,
            Self::Answer { .. } => MessageKind::Answer,
            Self::IceCandidate { .. } => MessageKind::IceCandidate,
            Self::Hangup { .. } => MessageKind::Hangup,
            Self::Heartbeat { .. } => MessageKind::Heartbeat,
        }
    }

    /// Structural checks applied before a message is relayed
    pub fn validate(&self) -> Result<(), SignalingError> {
        if self.sender_id().trim().is_empty() {
            return Err(SignalingError::Malformed("empty sender id".into()));
        }

        match self {
            Self::Offer { sdp, .. } | Self::Answer { sdp, .. } => {
                if sdp.trim().is_empty() {
                    return Err(SignalingError::Malformed("empty sdp".into()));
                }
                if sdp.len() > MAX_PAYLOAD_SIZE {
                    return Err(SignalingError::Malformed(format!(
                        "sdp too large: {} bytes (max {})",
                        sdp.len(),
                        MAX_PAYLOAD_SIZE
                    )));
                }
            }
            Self::IceCandidate { candidate, .. } => {
                if candidate.candidate.trim().is_empty() {
                    return Err(SignalingError::Malformed("empty ice candidate".into()));
                }
                if candidate.candidate.len() > MAX_PAYLOAD_SIZE {
                    return Err(SignalingError::Malformed("ice candidate too large".into()));
                }
            }
            Self::Hangup { .. } | Self::Heartbeat { .. } => {}
        }

        Ok(())
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_wire_format() {
        let id = SessionId::new();
        let msg = SignalingMessage::offer(id, "u1", "v=0");
        let json = msg.to_json().unwrap();

        assert!(json.contains("\"kind\":\"offer\""));
        assert!(json.contains("\"sender_id\":\"u1\""));
        assert!(json.contains(&id.to_string()));
    }

    #[test]
    fn test_candidate_roundtrip_keeps_init_fields() {
        let id = SessionId::new();
        let msg = SignalingMessage::ice_candidate(
            id,
            "u1",
            IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            },
        );
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"sdp_mid\":\"0\""));

        let parsed = SignalingMessage::from_json(&json).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.kind(), MessageKind::IceCandidate);
    }

    #[test]
    fn test_hangup_parses_without_payload() {
        let id = SessionId::new();
        let json = format!(r#"{{"kind":"hangup","session_id":"{}","sender_id":"u2"}}"#, id);
        let msg = SignalingMessage::from_json(&json).unwrap();
        assert_eq!(msg.session_id(), id);
        assert_eq!(msg.sender_id(), "u2");
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_payloads() {
        let id = SessionId::new();
        assert!(matches!(
            SignalingMessage::offer(id, "u1", "  ").validate(),
            Err(SignalingError::Malformed(_))
        ));
        assert!(matches!(
            SignalingMessage::hangup(id, "").validate(),
            Err(SignalingError::Malformed(_))
        ));

        let oversized = "a".repeat(MAX_PAYLOAD_SIZE + 1);
        assert!(SignalingMessage::answer(id, "u1", oversized).validate().is_err());
    }
}
