//! Signaling relay
//!
//! Forwards signaling messages between the two participants of a session.
//! Fan-out happens while the session lock is held, so every subscriber sees
//! one total order of signals and state changes per session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rtc_core::{
    CallError, CallState, MessageKind, Participant, SessionError, SessionId, SignalingMessage,
};

use crate::call::CallEvent;
use crate::registry::{Admission, Eviction, SessionRegistry, SessionSnapshot};

/// Something a subscriber receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "delivery", rename_all = "snake_case")]
pub enum Delivery {
    /// A message relayed from the other participant
    Signal { seq: u64, message: SignalingMessage },
    /// The session moved to a new state
    StateChanged { session_id: SessionId, state: CallState },
    /// Another participant joined
    PeerJoined {
        session_id: SessionId,
        participant: Participant,
    },
    /// Another participant left
    PeerLeft { session_id: SessionId, user_id: String },
}

/// Acknowledgement of an accepted publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub session_id: SessionId,
    /// Per-session publish sequence number
    pub seq: u64,
    /// Subscribers the message reached
    pub delivered: usize,
    /// Session state after the message was applied
    pub state: CallState,
}

struct Subscriber {
    id: u64,
    user_id: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

type Channels = DashMap<SessionId, Vec<Subscriber>>;

/// Receiving end of a session subscription
///
/// Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    session_id: SessionId,
    user_id: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
    channels: Weak<Channels>,
}

impl Subscription {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Next delivery; `None` once the session has been evicted
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(channels) = self.channels.upgrade() else {
            return;
        };

        if let Some(mut subscribers) = channels.get_mut(&self.session_id) {
            subscribers.retain(|s| s.id != self.id);
        }
        channels.remove_if(&self.session_id, |_, subscribers| subscribers.is_empty());
        debug!("Unsubscribed {} from {}", self.user_id, self.session_id);
    }
}

/// Signaling relay over a session registry
pub struct SignalingRelay {
    registry: Arc<SessionRegistry>,
    channels: Arc<Channels>,
    next_subscriber: AtomicU64,
}

impl SignalingRelay {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            channels: Arc::new(DashMap::new()),
            next_subscriber: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Number of live subscriptions across all sessions
    pub fn subscriber_count(&self) -> usize {
        self.channels.iter().map(|entry| entry.value().len()).sum()
    }

    /// Subscribe a member of an existing session
    pub fn subscribe(&self, session_id: SessionId, user_id: &str) -> Result<Subscription, SessionError> {
        self.registry
            .with_session(session_id, |session| {
                if !session.has_participant(user_id) {
                    return Err(SessionError::NotParticipant {
                        session_id,
                        user_id: user_id.to_string(),
                    });
                }
                Ok(self.register(session_id, user_id))
            })
            .map_err(unknown_session)?
    }

    /// Join a session and subscribe to it in one step
    ///
    /// The subscription is registered under the session lock, so it sees
    /// every delivery published after the join and none before.
    pub fn join(
        &self,
        session_id: SessionId,
        participant: Participant,
    ) -> Result<(SessionSnapshot, Subscription), SessionError> {
        let user_id = participant.user_id.clone();
        let announced = participant.clone();

        let (snapshot, subscription) =
            self.registry
                .join_with(session_id, participant, |_, outcome| {
                    let subscription = self.register(session_id, &user_id);

                    if outcome.admission != Admission::AlreadyMember {
                        self.fan_out(
                            session_id,
                            Some(&user_id),
                            Delivery::PeerJoined {
                                session_id,
                                participant: announced,
                            },
                        );
                    }
                    if let Some(state) = outcome.transition {
                        self.fan_out(session_id, None, Delivery::StateChanged { session_id, state });
                    }

                    subscription
                })?;

        Ok((snapshot, subscription))
    }

    /// Leave a session; idempotent
    pub fn leave(&self, session_id: SessionId, user_id: &str) {
        self.registry.leave_with(session_id, user_id, |_, outcome| {
            self.fan_out(
                session_id,
                Some(user_id),
                Delivery::PeerLeft {
                    session_id,
                    user_id: outcome.removed.user_id.clone(),
                },
            );
            if let Some(state) = outcome.transition {
                self.fan_out(session_id, None, Delivery::StateChanged { session_id, state });
            }
        });
    }

    /// Relay a message to the other participant and advance the call
    pub fn publish(&self, message: SignalingMessage) -> Result<Ack, CallError> {
        let session_id = message.session_id();
        let validation = message.validate();

        self.registry
            .with_session(session_id, |session| -> Result<Ack, CallError> {
                let sender = message.sender_id();
                if !session.has_participant(sender) {
                    return Err(SessionError::NotParticipant {
                        session_id,
                        user_id: sender.to_string(),
                    }
                    .into());
                }
                if session.state().is_terminal() {
                    return Err(SessionError::Terminated(session_id).into());
                }

                session.touch();

                if let Err(e) = validation {
                    warn!("Malformed {:?} from {} in {}: {}", message.kind(), sender, session_id, e);
                    if let Some(state) = session.apply(CallEvent::Failure) {
                        self.fan_out(session_id, None, Delivery::StateChanged { session_id, state });
                    }
                    return Err(e.into());
                }

                let seq = session.next_seq();
                let delivered = if message.kind() == MessageKind::Heartbeat {
                    0
                } else {
                    self.fan_out(
                        session_id,
                        Some(sender),
                        Delivery::Signal {
                            seq,
                            message: message.clone(),
                        },
                    )
                };

                if let Some(state) = CallEvent::from_message(&message).and_then(|e| session.apply(e)) {
                    self.fan_out(session_id, None, Delivery::StateChanged { session_id, state });
                }

                debug!(
                    "Relayed {:?} #{} in {} to {} subscriber(s)",
                    message.kind(),
                    seq,
                    session_id,
                    delivered
                );

                Ok(Ack {
                    session_id,
                    seq,
                    delivered,
                    state: session.state(),
                })
            })
            .map_err(unknown_session)?
    }

    /// Drive a session to `Failed` and tell its subscribers
    pub fn fail(&self, session_id: SessionId, reason: &str) -> Result<Option<CallState>, SessionError> {
        self.registry.with_session(session_id, |session| {
            let transition = session.apply(CallEvent::Failure);
            if let Some(state) = transition {
                warn!("Session {} failed: {}", session_id, reason);
                self.fan_out(session_id, None, Delivery::StateChanged { session_id, state });
            }
            transition
        })
    }

    /// Sweep the registry and close the channels of evicted sessions
    pub fn sweep(&self) -> Vec<Eviction> {
        let evicted = self.registry.sweep();
        self.close_evicted(&evicted);
        evicted
    }

    fn close_evicted(&self, evicted: &[Eviction]) {
        for eviction in evicted {
            if eviction.timed_out {
                self.fan_out(
                    eviction.session_id,
                    None,
                    Delivery::StateChanged {
                        session_id: eviction.session_id,
                        state: eviction.final_state,
                    },
                );
            }
            // Dropping the senders ends every open subscription
            self.channels.remove(&eviction.session_id);
        }
    }

    /// Run `sweep` every `interval` in the background
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let evicted = self.sweep();
                if !evicted.is_empty() {
                    info!(
                        "Sweep evicted {} session(s), {} remaining",
                        evicted.len(),
                        self.registry.session_count()
                    );
                }
            }
        })
    }

    fn register(&self, session_id: SessionId, user_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        self.channels.entry(session_id).or_default().push(Subscriber {
            id,
            user_id: user_id.to_string(),
            tx,
        });

        Subscription {
            id,
            session_id,
            user_id: user_id.to_string(),
            rx,
            channels: Arc::downgrade(&self.channels),
        }
    }

    /// Enqueue a delivery for every subscriber except `except`
    fn fan_out(&self, session_id: SessionId, except: Option<&str>, delivery: Delivery) -> usize {
        let Some(mut subscribers) = self.channels.get_mut(&session_id) else {
            return 0;
        };

        let mut delivered = 0;
        subscribers.retain(|subscriber| {
            if except == Some(subscriber.user_id.as_str()) {
                return true;
            }
            match subscriber.tx.send(delivery.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    warn!(
                        "Dropping delivery for closed subscriber {} in {}",
                        subscriber.user_id, session_id
                    );
                    false
                }
            }
        });

        delivered
    }
}

/// Publishing to a session the registry never had is `UnknownSession`
fn unknown_session(e: SessionError) -> SessionError {
    match e {
        SessionError::NotFound(id) => SessionError::UnknownSession(id),
        other => other,
    }
}
