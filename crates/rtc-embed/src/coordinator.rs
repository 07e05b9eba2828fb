//! Client coordinator
//!
//! Drives one participant's side of a call: authenticates to the relay,
//! joins a session, negotiates through the `MediaEngine` and reports
//! lifecycle events to the host.
//!
//! After `start` the signaling channel is owned by a background pump task.
//! The coordinator talks to it through an outbound queue; the pump handles
//! everything the relay pushes and keeps `Shared` current.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use rtc_core::{
    unix_now, AuthError, CallError, CallState, ClientConfig, ErrorCode, IceCandidate, SessionError,
    SessionId, SignalingError, SignalingMessage, TransportError,
};
use rtc_signal::{ChannelMessage, SessionSnapshot};

use crate::attributes::EmbedAttributes;
use crate::channel::{Connector, SignalChannel};
use crate::events::{HostEvent, HostNotifier};
use crate::loader::CoordinatorLoader;
use crate::media::{MediaEngine, RenderTarget};

/// Coordinator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Connecting,
    /// Authenticated; may join sessions
    Ready,
    Closed,
    Failed,
}

/// Result of `start`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { user_id: String },
    AlreadyStarted,
    /// Reported to the host as `WEBRTC_ERROR`
    Failed(CallError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// First member; sends the offer
    Caller,
    Callee,
}

enum Outbound {
    Frame(ChannelMessage),
    Close,
}

/// Client frame still waiting for its reply
///
/// The relay answers requests one at a time and in order, so replies are
/// matched against a FIFO of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Join(SessionId),
    Signal(SessionId),
    Other,
}

impl Request {
    /// `None` for frames the relay never answers
    fn of(frame: &ChannelMessage) -> Option<Self> {
        match frame {
            ChannelMessage::Leave => None,
            ChannelMessage::Join { session_id } => Some(Request::Join(*session_id)),
            ChannelMessage::Signal { message } => Some(Request::Signal(message.session_id())),
            _ => Some(Request::Other),
        }
    }
}

struct Shared {
    state: CoordinatorState,
    user_id: Option<String>,
    session_id: Option<SessionId>,
    call_state: Option<CallState>,
    role: Option<Role>,
    offered: bool,
    /// Session being joined and the waiting `join` call
    pending_join: Option<(SessionId, oneshot::Sender<Result<SessionSnapshot, CallError>>)>,
    /// Session whose failure the host has already been told about
    failure_reported: Option<SessionId>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: CoordinatorState::Idle,
            user_id: None,
            session_id: None,
            call_state: None,
            role: None,
            offered: false,
            pending_join: None,
            failure_reported: None,
        }
    }

    fn is_pending(&self, session_id: SessionId) -> bool {
        matches!(&self.pending_join, Some((pending, _)) if *pending == session_id)
    }

    /// Session we are in, while the call is still live
    fn live_session(&self) -> Option<(SessionId, String)> {
        match (self.session_id, &self.user_id, self.call_state) {
            (Some(session_id), Some(user_id), Some(state)) if !state.is_terminal() => {
                Some((session_id, user_id.clone()))
            }
            _ => None,
        }
    }
}

/// One participant's call coordinator
pub struct ClientCoordinator {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    media: Arc<dyn MediaEngine>,
    host: HostNotifier,
    target: Option<RenderTarget>,
    loader: Option<CoordinatorLoader>,
    shared: Arc<Mutex<Shared>>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    pump: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    released: bool,
}

impl ClientCoordinator {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        media: Arc<dyn MediaEngine>,
        host: HostNotifier,
        target: RenderTarget,
    ) -> Self {
        Self {
            config,
            connector,
            media,
            host,
            target: Some(target),
            loader: None,
            shared: Arc::new(Mutex::new(Shared::new())),
            outbound: None,
            pump: None,
            heartbeat: None,
            released: false,
        }
    }

    /// Fetch the coordinator code before connecting
    pub fn with_loader(mut self, loader: CoordinatorLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn state(&self) -> CoordinatorState {
        self.shared.lock().state
    }

    pub fn call_state(&self) -> Option<CallState> {
        self.shared.lock().call_state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.lock().session_id
    }

    pub fn user_id(&self) -> Option<String> {
        self.shared.lock().user_id.clone()
    }

    /// Resolve identity, open the channel and authenticate
    ///
    /// Never panics and never returns an error to the host: failures are
    /// logged and posted as `WEBRTC_ERROR`.
    pub async fn start(&mut self, attrs: &EmbedAttributes) -> StartOutcome {
        {
            let mut shared = self.shared.lock();
            if shared.state != CoordinatorState::Idle {
                debug!("Coordinator already started ({:?})", shared.state);
                return StartOutcome::AlreadyStarted;
            }

            let participant = match attrs.participant() {
                Ok(p) => p,
                Err(e) => {
                    error!("Cannot start call coordinator: {}", e);
                    let err = CallError::from(e);
                    self.host.error(&err);
                    return StartOutcome::Failed(err);
                }
            };

            shared.state = CoordinatorState::Connecting;
            shared.user_id = Some(participant.user_id);
        }

        match self.open(attrs).await {
            Ok((channel, user_id)) => {
                self.spawn_tasks(channel, user_id.clone());
                if let Some(target) = &self.target {
                    self.media.attach(target);
                }
                info!("Call coordinator ready as {}", user_id);
                self.host.ready();
                StartOutcome::Started { user_id }
            }
            Err(err) => {
                warn!("Call coordinator failed to start: {}", err);
                self.shared.lock().state = CoordinatorState::Failed;
                self.host.error(&err);
                self.release();
                StartOutcome::Failed(err)
            }
        }
    }

    /// Load, connect and authenticate; the channel is closed on failure
    async fn open(&self, attrs: &EmbedAttributes) -> Result<(Box<dyn SignalChannel>, String), CallError> {
        if let Some(loader) = &self.loader {
            let code = loader.load().await?;
            debug!("Coordinator code {} ({})", code.version, code.digest);
        }

        let mut channel = match timeout(self.config.connect_timeout(), self.connector.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Signaling channel did not open within {:?}", self.config.connect_timeout());
                return Err(SignalingError::Timeout.into());
            }
        };

        let user_id = attrs.user_id.clone().unwrap_or_default().trim().to_string();
        let hello = ChannelMessage::Hello {
            user_id: user_id.clone(),
            token: attrs.user_token.clone().unwrap_or_default(),
            display_name: attrs.user_name.clone(),
            avatar_ref: attrs.user_avatar.clone(),
        };

        let authenticated = match timeout(self.config.auth_timeout(), authenticate(channel.as_mut(), hello)).await {
            Ok(result) => result,
            Err(_) => Err(SignalingError::Timeout.into()),
        };

        match authenticated {
            Ok(expires_at) => {
                debug!(
                    "Authenticated as {} for {}s",
                    user_id,
                    expires_at.saturating_sub(unix_now())
                );
                Ok((channel, user_id))
            }
            Err(e) => {
                channel.close().await;
                Err(e)
            }
        }
    }

    fn spawn_tasks(&mut self, channel: Box<dyn SignalChannel>, user_id: String) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().state = CoordinatorState::Ready;

        let pump = Pump {
            channel,
            outbound: rx,
            awaiting: VecDeque::new(),
            shared: self.shared.clone(),
            media: self.media.clone(),
            host: self.host.clone(),
            user_id,
        };
        self.pump = Some(tokio::spawn(pump.run()));
        self.heartbeat = Some(spawn_heartbeat(
            self.shared.clone(),
            tx.clone(),
            self.config.heartbeat_interval(),
        ));
        self.outbound = Some(tx);
    }

    /// Join (or create) a session
    ///
    /// On timeout the join is withdrawn: a late `joined` reply is ignored
    /// and a `leave` is queued behind the request.
    pub async fn join(&self, session_id: SessionId) -> Result<SessionSnapshot, CallError> {
        let (tx, mut rx) = oneshot::channel();
        {
            let mut shared = self.shared.lock();
            if shared.state != CoordinatorState::Ready {
                return Err(TransportError::ChannelClosed.into());
            }
            shared.pending_join = Some((session_id, tx));
        }

        self.send(ChannelMessage::Join { session_id })?;

        match timeout(self.config.connect_timeout(), &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ChannelClosed.into()),
            Err(_) => {
                let leave = {
                    let mut shared = self.shared.lock();
                    if !shared.is_pending(session_id) {
                        // Settled by the pump as the timer fired
                        return rx
                            .try_recv()
                            .unwrap_or_else(|_| Err(TransportError::ChannelClosed.into()));
                    }
                    shared.pending_join = None;
                    shared.live_session().is_none()
                };
                warn!("Join of {} timed out", session_id);
                if leave {
                    self.send(ChannelMessage::Leave)?;
                }
                Err(SignalingError::Timeout.into())
            }
        }
    }

    /// Publish a local ICE candidate
    pub fn send_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let (session_id, user_id) = self.live_session()?;
        self.send(ChannelMessage::Signal {
            message: SignalingMessage::ice_candidate(session_id, user_id, candidate),
        })
    }

    /// End the call
    pub fn hangup(&self) -> Result<(), CallError> {
        let (session_id, user_id) = self.live_session()?;
        info!("Hanging up {}", session_id);
        self.send(ChannelMessage::Signal {
            message: SignalingMessage::hangup(session_id, user_id),
        })
    }

    /// Hang up if still in a call, then stop everything and release media
    ///
    /// Waits up to `hangup_grace` for the hangup to go out.
    pub async fn teardown(&mut self) {
        if let Some(mut pump) = self.shutdown() {
            if timeout(self.config.hangup_grace(), &mut pump).await.is_err() {
                warn!("Signaling pump did not stop in time; aborting");
                pump.abort();
            }
        }
        self.release();
    }

    /// Queue the best-effort hangup and close; returns the pump to wait on
    fn shutdown(&mut self) -> Option<JoinHandle<()>> {
        let hangup = {
            let mut shared = self.shared.lock();
            let hangup = shared.live_session().map(|(session_id, user_id)| {
                info!("Tearing down during call {}; sending hangup", session_id);
                SignalingMessage::hangup(session_id, user_id)
            });
            if shared.state != CoordinatorState::Failed {
                shared.state = CoordinatorState::Closed;
            }
            if let Some((_, tx)) = shared.pending_join.take() {
                let _ = tx.send(Err(TransportError::ChannelClosed.into()));
            }
            hangup
        };

        if let Some(tx) = self.outbound.take() {
            if let Some(message) = hangup {
                let _ = tx.send(Outbound::Frame(ChannelMessage::Signal { message }));
            }
            let _ = tx.send(Outbound::Close);
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        self.pump.take()
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.media.release();
        if let Some(target) = self.target.take() {
            debug!("Released render target {}", target.id());
        }
    }

    fn live_session(&self) -> Result<(SessionId, String), CallError> {
        let shared = self.shared.lock();
        if shared.state != CoordinatorState::Ready {
            return Err(TransportError::ChannelClosed.into());
        }
        shared
            .live_session()
            .ok_or_else(|| SignalingError::Malformed("not in a live session".into()).into())
    }

    fn send(&self, frame: ChannelMessage) -> Result<(), CallError> {
        self.outbound
            .as_ref()
            .ok_or(TransportError::ChannelClosed)?
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::ChannelClosed.into())
    }
}

impl Drop for ClientCoordinator {
    fn drop(&mut self) {
        if let Some(mut pump) = self.shutdown() {
            let grace = self.config.hangup_grace();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if timeout(grace, &mut pump).await.is_err() {
                            pump.abort();
                        }
                    });
                }
                Err(_) => pump.abort(),
            }
        }
        self.release();
    }
}

/// Send `hello` and wait for the verdict; returns the token expiry
async fn authenticate(channel: &mut dyn SignalChannel, hello: ChannelMessage) -> Result<u64, CallError> {
    channel.send(hello).await?;

    loop {
        match channel.recv().await? {
            ChannelMessage::Authenticated { expires_at, .. } => return Ok(expires_at),
            ChannelMessage::Error { code, message } => return Err(rejection(code, message, None)),
            other => debug!("Ignoring {:?} before authentication", other),
        }
    }
}

/// Map an `error` frame back to a `CallError`
fn rejection(code: ErrorCode, message: String, session_id: Option<SessionId>) -> CallError {
    match (code, session_id) {
        (ErrorCode::MissingIdentity, _) => AuthError::MissingIdentity.into(),
        (ErrorCode::InvalidToken, _) => AuthError::InvalidToken.into(),
        (ErrorCode::Timeout, _) => SignalingError::Timeout.into(),
        (ErrorCode::Malformed, _) => SignalingError::Malformed(message).into(),
        (ErrorCode::ChannelClosed, _) => TransportError::ChannelClosed.into(),
        (ErrorCode::SessionFull, Some(id)) => SessionError::SessionFull(id).into(),
        (ErrorCode::UnknownSession, Some(id)) => SessionError::UnknownSession(id).into(),
        (ErrorCode::NotFound, Some(id)) => SessionError::NotFound(id).into(),
        (ErrorCode::AlreadyInSession, Some(id)) => SessionError::AlreadyInSession(id).into(),
        (ErrorCode::Terminated, Some(id)) => SessionError::Terminated(id).into(),
        _ => TransportError::ConnectFailed(format!("{:?}: {}", code, message)).into(),
    }
}

fn spawn_heartbeat(
    shared: Arc<Mutex<Shared>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let live = shared.lock().live_session();
            if let Some((session_id, user_id)) = live {
                let frame = ChannelMessage::Signal {
                    message: SignalingMessage::heartbeat(session_id, user_id),
                };
                if outbound.send(Outbound::Frame(frame)).is_err() {
                    break;
                }
            }
        }
    })
}

/// Owns the signaling channel once authenticated
struct Pump {
    channel: Box<dyn SignalChannel>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    /// Requests sent and not yet answered, oldest first
    awaiting: VecDeque<Request>,
    shared: Arc<Mutex<Shared>>,
    media: Arc<dyn MediaEngine>,
    host: HostNotifier,
    user_id: String,
}

impl Pump {
    async fn run(mut self) {
        let result = loop {
            tokio::select! {
                out = self.outbound.recv() => match out {
                    Some(Outbound::Frame(frame)) => {
                        if let Err(e) = self.send(frame).await {
                            break Err(e);
                        }
                    }
                    Some(Outbound::Close) | None => break Ok(()),
                },
                incoming = self.channel.recv() => match incoming {
                    Ok(frame) => {
                        if let Err(e) = self.on_frame(frame).await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(e),
                },
            }
        };

        self.channel.close().await;

        let mut shared = self.shared.lock();
        if let Some((_, tx)) = shared.pending_join.take() {
            let _ = tx.send(Err(TransportError::ChannelClosed.into()));
        }
        match result {
            Ok(()) => debug!("Signaling pump for {} stopped", self.user_id),
            Err(e) if shared.state == CoordinatorState::Closed => {
                debug!("Signaling channel for {} ended during teardown: {}", self.user_id, e);
            }
            Err(e) => {
                warn!("Signaling channel for {} lost: {}", self.user_id, e);
                shared.state = CoordinatorState::Failed;
                drop(shared);
                self.host.error(&CallError::from(e));
            }
        }
    }

    async fn send(&mut self, frame: ChannelMessage) -> Result<(), TransportError> {
        let request = Request::of(&frame);
        self.channel.send(frame).await?;
        if let Some(request) = request {
            self.awaiting.push_back(request);
        }
        Ok(())
    }

    async fn on_frame(&mut self, frame: ChannelMessage) -> Result<(), TransportError> {
        let request = if frame.is_reply() {
            self.awaiting.pop_front()
        } else {
            None
        };

        match &frame {
            ChannelMessage::Ping { .. } | ChannelMessage::Pong { .. } => return Ok(()),

            ChannelMessage::Joined { session } => {
                let role = match session.participants.first() {
                    Some(first) if first.user_id == self.user_id => Role::Caller,
                    _ => Role::Callee,
                };
                {
                    let mut shared = self.shared.lock();
                    let answers_pending = request == Some(Request::Join(session.session_id))
                        && shared.is_pending(session.session_id);
                    let pending = if answers_pending {
                        shared.pending_join.take()
                    } else {
                        None
                    };
                    let Some((_, tx)) = pending else {
                        debug!("Ignoring late join of {}", session.session_id);
                        return Ok(());
                    };
                    shared.session_id = Some(session.session_id);
                    shared.call_state = Some(session.state);
                    shared.role = Some(role);
                    shared.offered = false;
                    shared.failure_reported = None;
                    let _ = tx.send(Ok(session.clone()));
                }
                info!("Joined {} as {:?} ({})", session.session_id, role, session.state);
                if session.state == CallState::Connecting {
                    self.offer_if_caller().await?;
                }
            }

            ChannelMessage::StateChanged { session_id, state } => {
                let (ours, report) = {
                    let mut shared = self.shared.lock();
                    let ours = shared.session_id == Some(*session_id);
                    let mut report = false;
                    if ours {
                        shared.call_state = Some(*state);
                        if *state == CallState::Failed && shared.failure_reported != Some(*session_id) {
                            shared.failure_reported = Some(*session_id);
                            report = true;
                        }
                    }
                    (ours, report)
                };
                debug!("Session {} is now {}", session_id, state);
                if report {
                    warn!("Session {} failed", session_id);
                    self.host.notify(HostEvent::Error {
                        error: format!("session {} failed", session_id),
                        code: Some(ErrorCode::Terminated),
                    });
                }
                if ours && *state == CallState::Connecting {
                    self.offer_if_caller().await?;
                }
            }

            ChannelMessage::Relayed { message, .. } => self.on_relayed(message).await?,

            ChannelMessage::Error { code, message } => {
                self.on_error(request, *code, message);
                return Ok(());
            }

            _ => {}
        }

        match serde_json::to_value(&frame) {
            Ok(data) => self.host.message(data),
            Err(e) => warn!("Cannot encode frame for host: {}", e),
        }
        Ok(())
    }

    /// Report a relay error once, settling the join it answers
    fn on_error(&self, request: Option<Request>, code: ErrorCode, message: &str) {
        {
            let mut shared = self.shared.lock();
            match request {
                Some(Request::Join(session_id)) => {
                    if !shared.is_pending(session_id) {
                        debug!("Ignoring late join error for {}: {:?}", session_id, code);
                        return;
                    }
                    if let Some((_, tx)) = shared.pending_join.take() {
                        let _ = tx.send(Err(rejection(code, message.to_string(), Some(session_id))));
                    }
                }
                Some(Request::Signal(session_id)) if shared.session_id == Some(session_id) => {
                    let finished = shared.call_state.is_some_and(CallState::is_terminal);
                    if finished
                        && (shared.failure_reported == Some(session_id) || code == ErrorCode::Terminated)
                    {
                        debug!("Ignoring {:?} for finished session {}", code, session_id);
                        return;
                    }
                    if fails_session(code) {
                        shared.failure_reported = Some(session_id);
                    }
                }
                _ => {}
            }
        }

        warn!("Relay error {:?}: {}", code, message);
        self.host.notify(HostEvent::Error {
            error: message.to_string(),
            code: Some(code),
        });
    }

    async fn on_relayed(&mut self, message: &SignalingMessage) -> Result<(), TransportError> {
        let result = match message {
            SignalingMessage::Offer { session_id, sdp, .. } => match self.media.create_answer(sdp).await {
                Ok(answer) => {
                    let reply = SignalingMessage::answer(*session_id, self.user_id.clone(), answer);
                    return self.send(ChannelMessage::Signal { message: reply }).await;
                }
                Err(e) => Err(e),
            },
            SignalingMessage::Answer { sdp, .. } => self.media.apply_answer(sdp).await,
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.media.add_remote_candidate(candidate).await
            }
            SignalingMessage::Hangup { sender_id, .. } => {
                info!("{} hung up", sender_id);
                Ok(())
            }
            SignalingMessage::Heartbeat { .. } => Ok(()),
        };

        if let Err(e) = result {
            warn!("Media engine rejected {:?}: {}", message.kind(), e);
            self.host.notify(HostEvent::Error {
                error: e.to_string(),
                code: None,
            });
        }
        Ok(())
    }

    async fn offer_if_caller(&mut self) -> Result<(), TransportError> {
        let session_id = {
            let mut shared = self.shared.lock();
            if shared.role != Some(Role::Caller) || shared.offered {
                return Ok(());
            }
            let Some(session_id) = shared.session_id else {
                return Ok(());
            };
            shared.offered = true;
            session_id
        };

        match self.media.create_offer().await {
            Ok(sdp) => {
                debug!("Sending offer in {}", session_id);
                let offer = SignalingMessage::offer(session_id, self.user_id.clone(), sdp);
                self.send(ChannelMessage::Signal { message: offer }).await
            }
            Err(e) => {
                warn!("Cannot create offer: {}", e);
                self.host.notify(HostEvent::Error {
                    error: e.to_string(),
                    code: None,
                });
                Ok(())
            }
        }
    }
}

/// Signal errors that also fail the session they were sent in
fn fails_session(code: ErrorCode) -> bool {
    matches!(code, ErrorCode::Malformed | ErrorCode::InvalidToken)
}
