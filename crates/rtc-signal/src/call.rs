//! Per-session call lifecycle
//!
//! ```text
//! Ringing ──peer joins──▶ Connecting ──offer + answer──▶ Active
//!    │                        │                           │
//!    └──────── hangup / leave ┴───────────────────────────┴──▶ Ended
//!
//! any non-terminal ── malformed / auth failure / idle before Active ──▶ Failed
//! ```

use rtc_core::{CallState, SignalingMessage};
use tracing::debug;

/// Something that happened to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent<'a> {
    /// The second participant joined
    PeerJoined,
    /// An offer from this user was relayed
    Offer { from: &'a str },
    /// An answer from this user was relayed
    Answer { from: &'a str },
    /// A participant hung up
    Hangup,
    /// A participant left the session
    ParticipantLeft,
    /// No signaling activity within the idle window
    IdleTimeout,
    /// Malformed signaling or a rejected credential
    Failure,
}

impl<'a> CallEvent<'a> {
    /// The event a relayed message represents, if any
    pub fn from_message(msg: &'a SignalingMessage) -> Option<Self> {
        match msg {
            SignalingMessage::Offer { sender_id, .. } => Some(CallEvent::Offer { from: sender_id }),
            SignalingMessage::Answer { sender_id, .. } => Some(CallEvent::Answer { from: sender_id }),
            SignalingMessage::Hangup { .. } => Some(CallEvent::Hangup),
            SignalingMessage::IceCandidate { .. } | SignalingMessage::Heartbeat { .. } => None,
        }
    }
}

/// Call state machine for a single session
#[derive(Debug, Clone)]
pub struct CallMachine {
    state: CallState,
    /// Sender of the most recent offer
    offer_from: Option<String>,
    /// An answer from the other side followed that offer
    answered: bool,
}

impl CallMachine {
    pub fn new() -> Self {
        Self {
            state: CallState::Ringing,
            offer_from: None,
            answered: false,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Whether an offer and its matching answer have both been seen
    pub fn negotiated(&self) -> bool {
        self.offer_from.is_some() && self.answered
    }

    /// Apply an event; returns the new state when it changed
    pub fn apply(&mut self, event: CallEvent<'_>) -> Option<CallState> {
        if self.state.is_terminal() {
            debug!("Ignoring {:?} in terminal state {}", event, self.state);
            return None;
        }

        let next = match event {
            CallEvent::PeerJoined => match self.state {
                CallState::Ringing => Some(CallState::Connecting),
                _ => None,
            },
            CallEvent::Offer { from } => {
                // A new offer (including renegotiation) waits for a fresh answer
                self.offer_from = Some(from.to_string());
                self.answered = false;
                None
            }
            CallEvent::Answer { from } => {
                if self.offer_from.as_deref().is_some_and(|offerer| offerer != from) {
                    self.answered = true;
                }
                match self.state {
                    CallState::Connecting if self.negotiated() => Some(CallState::Active),
                    _ => None,
                }
            }
            CallEvent::Hangup | CallEvent::ParticipantLeft => Some(CallState::Ended),
            CallEvent::IdleTimeout => match self.state {
                CallState::Active => Some(CallState::Ended),
                _ => Some(CallState::Failed),
            },
            CallEvent::Failure => Some(CallState::Failed),
        };

        let next = next.filter(|n| *n != self.state && self.state.can_transition_to(*n))?;
        debug!("Call state {} -> {}", self.state, next);
        self.state = next;
        Some(next)
    }
}

impl Default for CallMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut m = CallMachine::new();
        assert_eq!(m.state(), CallState::Ringing);

        assert_eq!(m.apply(CallEvent::PeerJoined), Some(CallState::Connecting));
        assert_eq!(m.apply(CallEvent::Offer { from: "a" }), None);
        assert_eq!(m.apply(CallEvent::Answer { from: "b" }), Some(CallState::Active));
        assert_eq!(m.apply(CallEvent::Hangup), Some(CallState::Ended));
    }

    #[test]
    fn test_answer_must_come_from_other_side() {
        let mut m = CallMachine::new();
        m.apply(CallEvent::PeerJoined);
        m.apply(CallEvent::Offer { from: "a" });

        assert_eq!(m.apply(CallEvent::Answer { from: "a" }), None);
        assert_eq!(m.state(), CallState::Connecting);
    }

    #[test]
    fn test_answer_without_offer_is_ignored() {
        let mut m = CallMachine::new();
        m.apply(CallEvent::PeerJoined);

        assert_eq!(m.apply(CallEvent::Answer { from: "b" }), None);
        assert_eq!(m.state(), CallState::Connecting);
        assert!(!m.negotiated());
    }

    #[test]
    fn test_offer_answer_before_peer_joined() {
        // Negotiation can't complete while ringing; it completes on join
        let mut m = CallMachine::new();
        m.apply(CallEvent::Offer { from: "a" });
        assert_eq!(m.state(), CallState::Ringing);
    }

    #[test]
    fn test_renegotiation_while_active() {
        let mut m = CallMachine::new();
        m.apply(CallEvent::PeerJoined);
        m.apply(CallEvent::Offer { from: "a" });
        m.apply(CallEvent::Answer { from: "b" });

        assert_eq!(m.apply(CallEvent::Offer { from: "b" }), None);
        assert_eq!(m.state(), CallState::Active);
        assert!(!m.negotiated());
        assert_eq!(m.apply(CallEvent::Answer { from: "a" }), None);
        assert!(m.negotiated());
    }

    #[test]
    fn test_hangup_before_active_ends_call() {
        let mut m = CallMachine::new();
        m.apply(CallEvent::PeerJoined);
        assert_eq!(m.apply(CallEvent::Hangup), Some(CallState::Ended));
    }

    #[test]
    fn test_idle_timeout() {
        let mut ringing = CallMachine::new();
        assert_eq!(ringing.apply(CallEvent::IdleTimeout), Some(CallState::Failed));

        let mut active = CallMachine::new();
        active.apply(CallEvent::PeerJoined);
        active.apply(CallEvent::Offer { from: "a" });
        active.apply(CallEvent::Answer { from: "b" });
        assert_eq!(active.apply(CallEvent::IdleTimeout), Some(CallState::Ended));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut m = CallMachine::new();
        assert_eq!(m.apply(CallEvent::Failure), Some(CallState::Failed));

        assert_eq!(m.apply(CallEvent::PeerJoined), None);
        assert_eq!(m.apply(CallEvent::Hangup), None);
        assert_eq!(m.apply(CallEvent::Failure), None);
        assert_eq!(m.state(), CallState::Failed);

        let mut ended = CallMachine::new();
        ended.apply(CallEvent::ParticipantLeft);
        assert_eq!(ended.apply(CallEvent::Failure), None);
        assert_eq!(ended.state(), CallState::Ended);
    }

    #[test]
    fn test_event_from_message() {
        let id = rtc_core::SessionId::new();
        let offer = SignalingMessage::offer(id, "a", "v=0");
        assert_eq!(CallEvent::from_message(&offer), Some(CallEvent::Offer { from: "a" }));

        let hb = SignalingMessage::heartbeat(id, "a");
        assert_eq!(CallEvent::from_message(&hb), None);
    }
}
