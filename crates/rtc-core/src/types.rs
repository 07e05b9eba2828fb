//! Core type definitions
//!
//! These types are shared by the signal server and the embed client and
//! describe who takes part in a call and where the call is in its lifecycle.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one call attempt
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random session id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// A user taking part in a session
///
/// The auth token is kept so the registry can hand it to the journal or
/// revalidate, but it is never serialized and never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    #[serde(skip)]
    pub auth_token: String,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_ref: None,
            auth_token: String::new(),
        }
    }

    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        let avatar_ref = avatar_ref.into();
        self.avatar_ref = (!avatar_ref.is_empty()).then_some(avatar_ref);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = token.into();
        self
    }
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("user_id", &self.user_id)
            .field("display_name", &self.display_name)
            .field("avatar_ref", &self.avatar_ref)
            .field("auth_token", &"[REDACTED]")
            .finish()
    }
}

/// Lifecycle state of a call session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// One participant is waiting for the other
    Ringing,
    /// Both participants are present, offer/answer in flight
    Connecting,
    /// Offer and matching answer have been exchanged
    Active,
    /// Hung up or left
    Ended,
    /// Authentication failure, malformed signaling, or idle timeout
    Failed,
}

impl CallState {
    /// `Ended` and `Failed` never transition again
    pub const fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// Legal edges of the call lifecycle
    pub const fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Ended | Failed, _) => false,
            (_, Failed) => true,
            (Ringing, Connecting) => true,
            (Connecting, Active) => true,
            (Ringing | Connecting | Active, Ended) => true,
            _ => false,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            CallState::Ringing => "ringing",
            CallState::Connecting => "connecting",
            CallState::Active => "active",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ringing" => Ok(CallState::Ringing),
            "connecting" => Ok(CallState::Connecting),
            "active" => Ok(CallState::Active),
            "ended" => Ok(CallState::Ended),
            "failed" => Ok(CallState::Failed),
            _ => Err(format!("Unknown call state: {}", s)),
        }
    }
}

/// Seconds since the Unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Milliseconds since the Unix epoch
pub fn unix_now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis()
}
