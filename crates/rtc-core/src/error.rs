//! Error taxonomy for the signaling core

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SessionId;

/// Presence & token validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no resolvable user identity")]
    MissingIdentity,

    #[error("the auth token is invalid or expired")]
    InvalidToken,
}

/// Session registry failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0} already has two participants")]
    SessionFull(SessionId),

    #[error("no session registered for {0}")]
    UnknownSession(SessionId),

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("user is already in active session {0}")]
    AlreadyInSession(SessionId),

    #[error("session {0} has ended")]
    Terminated(SessionId),

    #[error("user {user_id} is not a participant of session {session_id}")]
    NotParticipant {
        session_id: SessionId,
        user_id: String,
    },
}

/// Signaling message failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("malformed signaling message: {0}")]
    Malformed(String),

    #[error("timeout")]
    Timeout,
}

/// Transport and loader failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to load coordinator code: {0}")]
    LoadFailed(String),

    #[error("failed to open signaling channel: {0}")]
    ConnectFailed(String),

    #[error("signaling channel closed")]
    ChannelClosed,
}

/// Any failure that can end a call attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Wire error codes (sent to clients)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MissingIdentity,
    InvalidToken,
    SessionFull,
    UnknownSession,
    NotFound,
    AlreadyInSession,
    Terminated,
    NotParticipant,
    Malformed,
    Timeout,
    LoadFailed,
    ConnectFailed,
    ChannelClosed,
    /// Frame arrived in a state where it is not allowed
    InvalidState,
    InternalError,
}

impl From<&CallError> for ErrorCode {
    fn from(e: &CallError) -> Self {
        match e {
            CallError::Auth(AuthError::MissingIdentity) => ErrorCode::MissingIdentity,
            CallError::Auth(AuthError::InvalidToken) => ErrorCode::InvalidToken,
            CallError::Session(SessionError::SessionFull(_)) => ErrorCode::SessionFull,
            CallError::Session(SessionError::UnknownSession(_)) => ErrorCode::UnknownSession,
            CallError::Session(SessionError::NotFound(_)) => ErrorCode::NotFound,
            CallError::Session(SessionError::AlreadyInSession(_)) => ErrorCode::AlreadyInSession,
            CallError::Session(SessionError::Terminated(_)) => ErrorCode::Terminated,
            CallError::Session(SessionError::NotParticipant { .. }) => ErrorCode::NotParticipant,
            CallError::Signaling(SignalingError::Malformed(_)) => ErrorCode::Malformed,
            CallError::Signaling(SignalingError::Timeout) => ErrorCode::Timeout,
            CallError::Transport(TransportError::LoadFailed(_)) => ErrorCode::LoadFailed,
            CallError::Transport(TransportError::ConnectFailed(_)) => ErrorCode::ConnectFailed,
            CallError::Transport(TransportError::ChannelClosed) => ErrorCode::ChannelClosed,
        }
    }
}

impl ErrorCode {
    /// Whether the relay closes the channel after reporting this error
    ///
    /// Authentication failures do; call and session failures leave the
    /// channel open for another join.
    pub fn ends_connection(self) -> bool {
        matches!(
            self,
            ErrorCode::MissingIdentity | ErrorCode::InvalidToken | ErrorCode::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let id = SessionId::new();
        let err = CallError::from(SessionError::SessionFull(id));
        assert_eq!(ErrorCode::from(&err), ErrorCode::SessionFull);

        let err = CallError::from(AuthError::InvalidToken);
        assert_eq!(ErrorCode::from(&err), ErrorCode::InvalidToken);
        assert!(ErrorCode::from(&err).ends_connection());

        let err = CallError::from(SessionError::Terminated(id));
        assert!(!ErrorCode::from(&err).ends_connection());
    }

    #[test]
    fn test_error_code_wire_form() {
        let json = serde_json::to_string(&ErrorCode::AlreadyInSession).unwrap();
        assert_eq!(json, "\"already_in_session\"");
    }

    #[test]
    fn test_error_display() {
        let err = CallError::from(SignalingError::Malformed("empty sdp".into()));
        assert_eq!(err.to_string(), "malformed signaling message: empty sdp");
    }
}
