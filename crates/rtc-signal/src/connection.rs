//! Transport-agnostic connection handling
//!
//! A `Connection` is one authenticated signaling channel. The WebSocket
//! server drives it with frames off the wire; the in-process connector in
//! `rtc-embed` drives it directly.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use rtc_core::crypto::generate_connection_id;
use rtc_core::identity::FALLBACK_DISPLAY_NAME;
use rtc_core::{
    AuthContext, CallError, ErrorCode, Participant, SessionError, SessionId, SignalingError,
    SignalingMessage, Validator,
};

use crate::messages::ChannelMessage;
use crate::registry::SessionRegistry;
use crate::relay::{Delivery, SignalingRelay, Subscription};

/// Shared state behind every connection
pub struct Hub {
    relay: Arc<SignalingRelay>,
    validator: Validator,
    auth_timeout: Duration,
    connections: AtomicUsize,
    next_connection: AtomicU64,
}

impl Hub {
    pub fn new(relay: Arc<SignalingRelay>, validator: Validator, auth_timeout: Duration) -> Self {
        Self {
            relay,
            validator,
            auth_timeout,
            connections: AtomicUsize::new(0),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn relay(&self) -> &Arc<SignalingRelay> {
        &self.relay
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.relay.registry()
    }

    /// A connection must send `hello` within this window
    pub fn auth_timeout(&self) -> Duration {
        self.auth_timeout
    }

    /// Open connections
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Open a new, unauthenticated connection
    pub fn connect(self: &Arc<Self>) -> Connection {
        let seq = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let id = generate_connection_id().unwrap_or_else(|e| {
            warn!("RNG unavailable for connection id: {}", e);
            format!("{:016x}", seq)
        });

        self.connections.fetch_add(1, Ordering::Relaxed);
        debug!("Connection {} opened", id);

        Connection {
            id,
            hub: Arc::clone(self),
            auth: None,
            participant: None,
            joined: None,
            closed: false,
        }
    }
}

/// One signaling channel
pub struct Connection {
    id: String,
    hub: Arc<Hub>,
    auth: Option<AuthContext>,
    participant: Option<Participant>,
    /// Subscription to the session this connection joined
    joined: Option<Subscription>,
    closed: bool,
}

impl Connection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.joined.as_ref().map(Subscription::session_id)
    }

    /// Handle one client frame, returning the replies
    ///
    /// After an authentication failure the connection is closed and every
    /// further frame is refused.
    pub async fn handle(&mut self, msg: ChannelMessage) -> Vec<ChannelMessage> {
        if self.closed {
            return vec![error_frame(rtc_core::TransportError::ChannelClosed)];
        }

        let replies = match msg {
            ChannelMessage::Ping { timestamp } => vec![ChannelMessage::Pong { timestamp }],

            ChannelMessage::Hello {
                user_id,
                token,
                display_name,
                avatar_ref,
            } => {
                self.authenticate(user_id, token, display_name, avatar_ref)
                    .await
            }

            _ if self.auth.is_none() => vec![ChannelMessage::error(
                ErrorCode::InvalidState,
                "hello required before any other frame",
            )],

            ChannelMessage::Join { session_id } => self.join(session_id),

            ChannelMessage::Leave => {
                self.leave();
                Vec::new()
            }

            ChannelMessage::Signal { message } => self.signal(message),

            _ => vec![ChannelMessage::error(
                ErrorCode::InvalidState,
                "server-only frame",
            )],
        };

        if replies.iter().any(ChannelMessage::ends_connection) {
            self.close();
        }

        replies
    }

    /// Next frame pushed by the relay
    ///
    /// Pending while the connection is not in a session. Returns `None`
    /// when the session was evicted.
    pub async fn next_event(&mut self) -> Option<ChannelMessage> {
        let Some(subscription) = self.joined.as_mut() else {
            return std::future::pending().await;
        };

        match subscription.recv().await {
            Some(delivery) => {
                if let Delivery::StateChanged { session_id, state } = &delivery {
                    if state.is_terminal() {
                        debug!("Connection {} released from {} ({})", self.id, session_id, state);
                        self.joined = None;
                    }
                }
                Some(delivery.into())
            }
            None => {
                debug!("Connection {} subscription closed", self.id);
                self.joined = None;
                None
            }
        }
    }

    /// Leave any session and refuse further frames; idempotent
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.leave();
        self.closed = true;
        debug!("Connection {} closed", self.id);
    }

    async fn authenticate(
        &mut self,
        user_id: String,
        token: String,
        display_name: Option<String>,
        avatar_ref: Option<String>,
    ) -> Vec<ChannelMessage> {
        if self.auth.is_some() {
            return vec![ChannelMessage::error(
                ErrorCode::InvalidState,
                "already authenticated",
            )];
        }

        let validation = tokio::time::timeout(
            self.hub.auth_timeout,
            self.hub.validator.validate(&user_id, &token),
        )
        .await;

        let ctx = match validation {
            Ok(Ok(ctx)) => ctx,
            Ok(Err(e)) => {
                info!("Connection {} rejected: {}", self.id, e);
                return vec![error_frame(e)];
            }
            Err(_) => {
                warn!("Connection {} token validation timed out", self.id);
                return vec![error_frame(SignalingError::Timeout)];
            }
        };

        let display_name = display_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_DISPLAY_NAME.to_string());
        let mut participant = Participant::new(ctx.user_id.clone(), display_name).with_token(token);
        if let Some(avatar) = avatar_ref {
            participant = participant.with_avatar(avatar);
        }

        info!("Connection {} authenticated as {}", self.id, ctx.user_id);

        let reply = ChannelMessage::Authenticated {
            connection_id: self.id.clone(),
            user_id: ctx.user_id.clone(),
            expires_at: ctx.expires_at,
        };
        self.auth = Some(ctx);
        self.participant = Some(participant);
        vec![reply]
    }

    fn join(&mut self, session_id: SessionId) -> Vec<ChannelMessage> {
        if let Some(current) = self.session_id() {
            if current != session_id {
                return vec![error_frame(SessionError::AlreadyInSession(current))];
            }
            return match self.hub.registry().get(session_id) {
                Ok(session) => vec![ChannelMessage::Joined { session }],
                Err(e) => vec![error_frame(e)],
            };
        }

        if let Some(expired) = self.check_token() {
            return expired;
        }

        let Some(participant) = self.participant.clone() else {
            return vec![ChannelMessage::error(ErrorCode::InvalidState, "not authenticated")];
        };

        match self.hub.relay.join(session_id, participant) {
            Ok((session, subscription)) => {
                self.joined = Some(subscription);
                vec![ChannelMessage::Joined { session }]
            }
            Err(e) => vec![error_frame(e)],
        }
    }

    fn leave(&mut self) {
        let Some(subscription) = self.joined.take() else {
            return;
        };
        let session_id = subscription.session_id();
        drop(subscription);

        if let Some(participant) = &self.participant {
            self.hub.relay.leave(session_id, &participant.user_id);
        }
    }

    fn signal(&mut self, message: SignalingMessage) -> Vec<ChannelMessage> {
        let Some(session_id) = self.session_id() else {
            return vec![ChannelMessage::error(ErrorCode::InvalidState, "not in a session")];
        };

        if let Some(expired) = self.check_token() {
            return expired;
        }

        if message.session_id() != session_id {
            let reason = format!(
                "message for session {} on a channel joined to {}",
                message.session_id(),
                session_id
            );
            if let Err(e) = self.hub.relay.fail(session_id, &reason) {
                debug!("Connection {} could not fail {}: {}", self.id, session_id, e);
            }
            return vec![error_frame(SignalingError::Malformed(reason))];
        }

        let user_id = self.auth.as_ref().map(|a| a.user_id.as_str()).unwrap_or_default();
        if message.sender_id() != user_id {
            warn!(
                "Connection {} ({}) tried to send as {}",
                self.id,
                user_id,
                message.sender_id()
            );
            return vec![error_frame(SessionError::NotParticipant {
                session_id,
                user_id: message.sender_id().to_string(),
            })];
        }

        match self.hub.relay.publish(message) {
            Ok(ack) => vec![ChannelMessage::Ack {
                seq: ack.seq,
                delivered: ack.delivered,
                state: ack.state,
            }],
            Err(e) => vec![error_frame(e)],
        }
    }

    /// Expired credentials fail the current session and end the connection
    fn check_token(&mut self) -> Option<Vec<ChannelMessage>> {
        if self.auth.as_ref().is_some_and(AuthContext::is_valid) {
            return None;
        }

        info!("Connection {} token expired", self.id);
        if let Some(session_id) = self.session_id() {
            if let Err(e) = self.hub.relay.fail(session_id, "auth token expired") {
                debug!("Connection {} could not fail {}: {}", self.id, session_id, e);
            }
        }
        Some(vec![error_frame(rtc_core::AuthError::InvalidToken)])
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
        self.hub.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

fn error_frame(e: impl Into<CallError>) -> ChannelMessage {
    let e = e.into();
    ChannelMessage::error(ErrorCode::from(&e), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rtc_core::crypto::{TokenClaims, TokenKey};
    use rtc_core::{unix_now, AuthError, CallState, TokenVerifier};

    const SECRET: &str = "connection-test-secret";

    fn hub() -> Arc<Hub> {
        let relay = Arc::new(SignalingRelay::new(Arc::new(SessionRegistry::default())));
        let validator = Validator::with_key(TokenKey::from_secret(SECRET));
        Arc::new(Hub::new(relay, validator, Duration::from_secs(5)))
    }

    fn hello(user_id: &str) -> ChannelMessage {
        let token = TokenKey::from_secret(SECRET).issue(user_id, unix_now() + 3600);
        ChannelMessage::Hello {
            user_id: user_id.into(),
            token,
            display_name: Some(user_id.to_uppercase()),
            avatar_ref: None,
        }
    }

    async fn joined(hub: &Arc<Hub>, user_id: &str, session_id: SessionId) -> Connection {
        let mut conn = hub.connect();
        let replies = conn.handle(hello(user_id)).await;
        assert!(matches!(replies[0], ChannelMessage::Authenticated { .. }));
        let replies = conn.handle(ChannelMessage::Join { session_id }).await;
        assert!(matches!(replies[0], ChannelMessage::Joined { .. }), "{:?}", replies);
        conn
    }

    #[test]
    fn test_next_event_pending_outside_session() {
        let hub = hub();
        let mut conn = hub.connect();

        let mut next = tokio_test::task::spawn(conn.next_event());
        tokio_test::assert_pending!(next.poll());
    }

    #[tokio::test]
    async fn test_hello_required() {
        let hub = hub();
        let mut conn = hub.connect();

        let replies = conn
            .handle(ChannelMessage::Join {
                session_id: SessionId::new(),
            })
            .await;
        assert!(matches!(
            replies[0],
            ChannelMessage::Error {
                code: ErrorCode::InvalidState,
                ..
            }
        ));
        assert!(!conn.is_closed());

        let replies = conn.handle(ChannelMessage::Ping { timestamp: 7 }).await;
        assert_eq!(replies, vec![ChannelMessage::Pong { timestamp: 7 }]);
    }

    #[tokio::test]
    async fn test_bad_token_closes_connection() {
        let hub = hub();
        let mut conn = hub.connect();

        let replies = conn
            .handle(ChannelMessage::Hello {
                user_id: "alice".into(),
                token: "123.deadbeef".into(),
                display_name: None,
                avatar_ref: None,
            })
            .await;
        assert!(matches!(
            replies[0],
            ChannelMessage::Error {
                code: ErrorCode::InvalidToken,
                ..
            }
        ));
        assert!(conn.is_closed());
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_missing_identity() {
        let hub = hub();
        let mut conn = hub.connect();

        let replies = conn
            .handle(ChannelMessage::Hello {
                user_id: "  ".into(),
                token: "x".into(),
                display_name: None,
                avatar_ref: None,
            })
            .await;
        assert!(matches!(
            replies[0],
            ChannelMessage::Error {
                code: ErrorCode::MissingIdentity,
                ..
            }
        ));
        assert!(conn.is_closed());
    }

    struct StalledVerifier;

    #[async_trait]
    impl TokenVerifier for StalledVerifier {
        async fn verify(&self, _: &str, _: &str, _: u64) -> Result<TokenClaims, AuthError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(AuthError::InvalidToken)
        }
    }

    #[tokio::test]
    async fn test_validation_timeout() {
        let relay = Arc::new(SignalingRelay::new(Arc::new(SessionRegistry::default())));
        let validator = Validator::new(Arc::new(StalledVerifier));
        let hub = Arc::new(Hub::new(relay, validator, Duration::from_millis(50)));
        let mut conn = hub.connect();

        let replies = conn.handle(hello("alice")).await;
        assert!(matches!(
            replies[0],
            ChannelMessage::Error {
                code: ErrorCode::Timeout,
                ..
            }
        ));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_two_connections_exchange_signals() {
        let hub = hub();
        let id = SessionId::new();

        let mut a = joined(&hub, "alice", id).await;
        let mut b = joined(&hub, "bob", id).await;
        assert_eq!(hub.connection_count(), 2);

        assert!(matches!(a.next_event().await, Some(ChannelMessage::PeerJoined { .. })));
        assert_eq!(
            a.next_event().await,
            Some(ChannelMessage::StateChanged {
                session_id: id,
                state: CallState::Connecting
            })
        );

        let replies = a
            .handle(ChannelMessage::Signal {
                message: SignalingMessage::offer(id, "alice", "v=0 offer"),
            })
            .await;
        assert!(matches!(replies[0], ChannelMessage::Ack { seq: 1, delivered: 1, .. }));

        assert!(matches!(
            b.next_event().await,
            Some(ChannelMessage::StateChanged {
                state: CallState::Connecting,
                ..
            })
        ));
        match b.next_event().await {
            Some(ChannelMessage::Relayed { seq, message }) => {
                assert_eq!(seq, 1);
                assert_eq!(message, SignalingMessage::offer(id, "alice", "v=0 offer"));
            }
            other => panic!("expected relayed offer, got {:?}", other),
        }

        let replies = b
            .handle(ChannelMessage::Signal {
                message: SignalingMessage::answer(id, "bob", "v=0 answer"),
            })
            .await;
        assert!(matches!(
            replies[0],
            ChannelMessage::Ack {
                state: CallState::Active,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_sender_spoof_rejected_without_failing_session() {
        let hub = hub();
        let id = SessionId::new();
        let mut a = joined(&hub, "alice", id).await;
        let _b = joined(&hub, "bob", id).await;

        let replies = a
            .handle(ChannelMessage::Signal {
                message: SignalingMessage::offer(id, "bob", "v=0"),
            })
            .await;
        assert!(matches!(
            replies[0],
            ChannelMessage::Error {
                code: ErrorCode::NotParticipant,
                ..
            }
        ));
        assert_eq!(hub.registry().get(id).unwrap().state, CallState::Connecting);
    }

    #[tokio::test]
    async fn test_session_mismatch_fails_session() {
        let hub = hub();
        let id = SessionId::new();
        let mut a = joined(&hub, "alice", id).await;

        let replies = a
            .handle(ChannelMessage::Signal {
                message: SignalingMessage::offer(SessionId::new(), "alice", "v=0"),
            })
            .await;
        assert!(matches!(
            replies[0],
            ChannelMessage::Error {
                code: ErrorCode::Malformed,
                ..
            }
        ));
        assert_eq!(hub.registry().get(id).unwrap().state, CallState::Failed);

        assert_eq!(
            a.next_event().await,
            Some(ChannelMessage::StateChanged {
                session_id: id,
                state: CallState::Failed
            })
        );
        assert_eq!(a.session_id(), None);
    }

    #[tokio::test]
    async fn test_drop_leaves_session() {
        let hub = hub();
        let id = SessionId::new();
        let a = joined(&hub, "alice", id).await;
        let mut b = joined(&hub, "bob", id).await;
        assert!(matches!(b.next_event().await, Some(ChannelMessage::StateChanged { .. })));

        drop(a);
        assert_eq!(hub.connection_count(), 1);

        assert_eq!(
            b.next_event().await,
            Some(ChannelMessage::PeerLeft {
                session_id: id,
                user_id: "alice".into()
            })
        );
        assert_eq!(
            b.next_event().await,
            Some(ChannelMessage::StateChanged {
                session_id: id,
                state: CallState::Ended
            })
        );
    }

    #[tokio::test]
    async fn test_join_is_idempotent_per_connection() {
        let hub = hub();
        let id = SessionId::new();
        let mut a = joined(&hub, "alice", id).await;

        let replies = a.handle(ChannelMessage::Join { session_id: id }).await;
        match &replies[0] {
            ChannelMessage::Joined { session } => assert_eq!(session.participants.len(), 1),
            other => panic!("expected joined, got {:?}", other),
        }

        let other = SessionId::new();
        let replies = a.handle(ChannelMessage::Join { session_id: other }).await;
        assert!(matches!(
            replies[0],
            ChannelMessage::Error {
                code: ErrorCode::AlreadyInSession,
                ..
            }
        ));
    }
}
