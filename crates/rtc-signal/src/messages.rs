//! Signal channel frames

use serde::{Deserialize, Serialize};

use rtc_core::{CallState, ErrorCode, Participant, SessionId, SignalingMessage};

use crate::registry::SessionSnapshot;
use crate::relay::Delivery;

/// Frames exchanged over a signaling channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// First client frame: identity and token
    Hello {
        user_id: String,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar_ref: Option<String>,
    },

    /// Credential accepted
    Authenticated {
        connection_id: String,
        user_id: String,
        /// Token expiry as Unix seconds
        expires_at: u64,
    },

    /// Create or join a session
    Join { session_id: SessionId },

    /// Session joined
    Joined { session: SessionSnapshot },

    /// Leave the current session
    Leave,

    /// Publish a signaling message
    Signal { message: SignalingMessage },

    /// Publish accepted
    Ack {
        seq: u64,
        delivered: usize,
        state: CallState,
    },

    /// Signaling message from the other participant
    Relayed { seq: u64, message: SignalingMessage },

    /// Session state changed
    StateChanged { session_id: SessionId, state: CallState },

    /// The other participant joined
    PeerJoined {
        session_id: SessionId,
        participant: Participant,
    },

    /// The other participant left
    PeerLeft { session_id: SessionId, user_id: String },

    /// Error response
    Error { code: ErrorCode, message: String },

    /// Ping for keepalive
    Ping { timestamp: u64 },

    /// Pong response
    Pong { timestamp: u64 },
}

impl ChannelMessage {
    /// Create an error message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Error frame after which the relay closes the channel
    pub fn ends_connection(&self) -> bool {
        matches!(self, Self::Error { code, .. } if code.ends_connection())
    }

    /// Frame answering a client request
    ///
    /// The relay answers every client frame except `leave` with exactly one
    /// of these, in request order.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Self::Authenticated { .. }
                | Self::Joined { .. }
                | Self::Ack { .. }
                | Self::Error { .. }
                | Self::Pong { .. }
        )
    }
}

impl From<Delivery> for ChannelMessage {
    fn from(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Signal { seq, message } => Self::Relayed { seq, message },
            Delivery::StateChanged { session_id, state } => Self::StateChanged { session_id, state },
            Delivery::PeerJoined {
                session_id,
                participant,
            } => Self::PeerJoined {
                session_id,
                participant,
            },
            Delivery::PeerLeft { session_id, user_id } => Self::PeerLeft { session_id, user_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_wire_form() {
        let json = r#"{"type":"hello","user_id":"u1","token":"123.abc"}"#;
        match ChannelMessage::from_json(json).unwrap() {
            ChannelMessage::Hello {
                user_id,
                token,
                display_name,
                avatar_ref,
            } => {
                assert_eq!(user_id, "u1");
                assert_eq!(token, "123.abc");
                assert!(display_name.is_none());
                assert!(avatar_ref.is_none());
            }
            other => panic!("wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_signal_frame_nests_signaling_message() {
        let id = SessionId::new();
        let msg = ChannelMessage::Signal {
            message: SignalingMessage::offer(id, "u1", "v=0"),
        };

        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "signal");
        assert_eq!(value["message"]["kind"], "offer");
        assert_eq!(value["message"]["sender_id"], "u1");

        assert_eq!(ChannelMessage::from_json(&msg.to_json().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_peer_joined_never_carries_token() {
        let msg = ChannelMessage::PeerJoined {
            session_id: SessionId::new(),
            participant: Participant::new("u2", "Bob").with_token("secret-token"),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("peer_joined"));
        assert!(!json.contains("secret-token"));
    }

    #[test]
    fn test_error_message() {
        let msg = ChannelMessage::error(ErrorCode::SessionFull, "Session is full");
        let json = msg.to_json().unwrap();

        assert!(json.contains("error"));
        assert!(json.contains("session_full"));
        assert!(!msg.ends_connection());
        assert!(ChannelMessage::error(ErrorCode::InvalidToken, "expired").ends_connection());
        assert!(!ChannelMessage::error(ErrorCode::Malformed, "bad sdp").ends_connection());
    }

    #[test]
    fn test_replies_and_pushes() {
        let id = SessionId::new();
        assert!(ChannelMessage::Pong { timestamp: 1 }.is_reply());
        assert!(ChannelMessage::error(ErrorCode::NotParticipant, "spoofed").is_reply());
        assert!(!ChannelMessage::StateChanged {
            session_id: id,
            state: CallState::Failed
        }
        .is_reply());
        assert!(!ChannelMessage::PeerLeft {
            session_id: id,
            user_id: "u2".into()
        }
        .is_reply());
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(ChannelMessage::from_json(r#"{"type":"create_room"}"#).is_err());
    }
}
