//! Session registry
//!
//! Owns every live call session. The table is a `DashMap` of sessions, each
//! behind its own mutex, so two racing joins on one session are serialized
//! while unrelated sessions never contend.
//!
//! Lock order: membership entry, then session mutex. Nothing acquires a
//! membership entry while holding a session mutex.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use rtc_core::{unix_now, CallState, Participant, SessionError, SessionId, MAX_PARTICIPANTS};

use crate::call::{CallEvent, CallMachine};
use crate::storage::Storage;

/// A live call session
pub struct Session {
    id: SessionId,

    /// At most `MAX_PARTICIPANTS`, in join order
    participants: Vec<Participant>,

    machine: CallMachine,

    /// Unix seconds, for snapshots
    created_at: u64,

    /// Last signaling activity
    last_activity: Instant,

    /// Per-session publish sequence
    seq: u64,
}

/// Immutable copy of a session, safe to hand out without holding locks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub participants: Vec<Participant>,
    pub state: CallState,
    /// Unix seconds
    pub created_at: u64,
    /// Unix seconds
    pub last_activity_at: u64,
}

impl SessionSnapshot {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }
}

/// What `create_or_join` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A new session was created with the caller as sole member
    Created,
    /// The caller joined an existing session
    Joined,
    /// The caller was already a member
    AlreadyMember,
}

/// Result of a join, seen while the session is still locked
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub admission: Admission,
    /// New state if the join moved the call forward
    pub transition: Option<CallState>,
}

/// Result of a leave, seen while the session is still locked
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub removed: Participant,
    pub transition: Option<CallState>,
}

/// A session purged by the sweeper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub session_id: SessionId,
    pub final_state: CallState,
    /// The sweeper itself finalized the session because it went idle
    pub timed_out: bool,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            participants: Vec::with_capacity(MAX_PARTICIPANTS),
            machine: CallMachine::new(),
            created_at: unix_now(),
            last_activity: Instant::now(),
            seq: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> CallState {
        self.machine.state()
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Reset the idle timer
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Allocate the next publish sequence number
    pub fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Feed an event to the call state machine
    pub fn apply(&mut self, event: CallEvent<'_>) -> Option<CallState> {
        self.machine.apply(event)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let idle_secs = self.last_activity.elapsed().as_secs();
        SessionSnapshot {
            session_id: self.id,
            participants: self.participants.clone(),
            state: self.state(),
            created_at: self.created_at,
            last_activity_at: unix_now().saturating_sub(idle_secs),
        }
    }

    fn admit(&mut self, participant: Participant) -> Result<JoinOutcome, SessionError> {
        if self.state().is_terminal() {
            return Err(SessionError::Terminated(self.id));
        }

        if self.has_participant(&participant.user_id) {
            return Ok(JoinOutcome {
                admission: Admission::AlreadyMember,
                transition: None,
            });
        }

        if self.participants.len() >= MAX_PARTICIPANTS {
            return Err(SessionError::SessionFull(self.id));
        }

        let admission = if self.participants.is_empty() {
            Admission::Created
        } else {
            Admission::Joined
        };

        self.participants.push(participant);
        self.touch();

        let transition = if self.participants.len() == MAX_PARTICIPANTS {
            self.apply(CallEvent::PeerJoined)
        } else {
            None
        };

        Ok(JoinOutcome {
            admission,
            transition,
        })
    }

    fn remove(&mut self, user_id: &str) -> Option<LeaveOutcome> {
        let index = self.participants.iter().position(|p| p.user_id == user_id)?;
        let removed = self.participants.remove(index);
        self.touch();
        let transition = self.apply(CallEvent::ParticipantLeft);
        Some(LeaveOutcome { removed, transition })
    }

    fn user_ids(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.user_id.clone()).collect()
    }
}

type SessionSlot = Arc<Mutex<Session>>;

/// Registry of live sessions
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionSlot>,

    /// user id -> session the user is currently a member of
    memberships: DashMap<String, SessionId>,

    idle_timeout: Duration,

    journal: Option<Arc<Storage>>,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            memberships: DashMap::new(),
            idle_timeout,
            journal: None,
        }
    }

    /// Write session history through to a journal
    pub fn with_journal(mut self, journal: Arc<Storage>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Number of sessions currently held (including terminal ones awaiting sweep)
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of users currently in a session
    pub fn member_count(&self) -> usize {
        self.memberships.len()
    }

    fn slot(&self, session_id: SessionId) -> Option<SessionSlot> {
        self.sessions.get(&session_id).map(|s| Arc::clone(s.value()))
    }

    fn is_active(&self, session_id: SessionId) -> bool {
        self.slot(session_id)
            .map(|slot| !slot.lock().state().is_terminal())
            .unwrap_or(false)
    }

    /// Create the session or join it
    pub fn create_or_join(
        &self,
        session_id: SessionId,
        participant: Participant,
    ) -> Result<SessionSnapshot, SessionError> {
        self.join_with(session_id, participant, |_, _| ())
            .map(|(snapshot, _)| snapshot)
    }

    /// Create or join, running `f` while the session is still locked
    ///
    /// The relay uses `f` to notify subscribers in the same total order as
    /// published messages.
    pub fn join_with<R>(
        &self,
        session_id: SessionId,
        participant: Participant,
        f: impl FnOnce(&Session, &JoinOutcome) -> R,
    ) -> Result<(SessionSnapshot, R), SessionError> {
        let user_id = participant.user_id.clone();
        let journal_participant = self.journal.as_ref().map(|_| participant.clone());

        let membership = self.memberships.entry(user_id.clone());
        if let Entry::Occupied(ref current) = membership {
            let current = *current.get();
            if current != session_id && self.is_active(current) {
                debug!("User {} already in session {}", user_id, current);
                return Err(SessionError::AlreadyInSession(current));
            }
        }

        let slot = Arc::clone(
            self.sessions
                .entry(session_id)
                .or_insert_with(|| Arc::new(Mutex::new(Session::new(session_id))))
                .value(),
        );

        let mut session = slot.lock();
        let outcome = match session.admit(participant) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("Join of {} to {} rejected: {}", user_id, session_id, e);
                return Err(e);
            }
        };

        match membership {
            Entry::Occupied(mut current) => {
                current.insert(session_id);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(session_id);
            }
        }

        let result = f(&session, &outcome);
        let snapshot = session.snapshot();
        drop(session);

        match outcome.admission {
            Admission::Created => info!("Session {} created by {}", session_id, user_id),
            Admission::Joined => info!("User {} joined session {}", user_id, session_id),
            Admission::AlreadyMember => debug!("User {} rejoined session {}", user_id, session_id),
        }

        if let (Some(journal), Some(participant)) = (&self.journal, journal_participant) {
            if outcome.admission != Admission::AlreadyMember {
                let written = (|| {
                    if outcome.admission == Admission::Created {
                        journal.record_session(session_id)?;
                    }
                    journal.record_join(session_id, &participant)?;
                    if let Some(state) = outcome.transition {
                        journal.record_state(session_id, state)?;
                    }
                    Ok::<_, crate::storage::StorageError>(())
                })();
                if let Err(e) = written {
                    warn!("Failed to journal join of {}: {}", session_id, e);
                }
            }
        }

        Ok((snapshot, result))
    }

    /// Remove a participant; idempotent
    pub fn leave(&self, session_id: SessionId, user_id: &str) {
        self.leave_with(session_id, user_id, |_, _| ());
    }

    /// Leave, running `f` while the session is still locked if someone was removed
    pub fn leave_with<R>(
        &self,
        session_id: SessionId,
        user_id: &str,
        f: impl FnOnce(&Session, &LeaveOutcome) -> R,
    ) -> Option<R> {
        let slot = self.slot(session_id)?;

        let mut session = slot.lock();
        let outcome = session.remove(user_id)?;
        let result = f(&session, &outcome);
        let remaining = session.user_ids();
        drop(session);

        self.release_membership(session_id, user_id);
        if outcome.transition.is_some_and(CallState::is_terminal) {
            for other in &remaining {
                self.release_membership(session_id, other);
            }
        }

        info!(
            "User {} left session {} ({} remaining)",
            user_id,
            session_id,
            remaining.len()
        );

        self.journal_write(session_id, |journal| {
            journal.record_leave(session_id, user_id)?;
            if let Some(state) = outcome.transition {
                journal.record_state(session_id, state)?;
            }
            Ok(())
        });

        Some(result)
    }

    /// Snapshot of a session
    pub fn get(&self, session_id: SessionId) -> Result<SessionSnapshot, SessionError> {
        self.slot(session_id)
            .map(|slot| slot.lock().snapshot())
            .ok_or(SessionError::NotFound(session_id))
    }

    /// Reset a session's idle timer
    pub fn touch(&self, session_id: SessionId) -> Result<(), SessionError> {
        self.with_session(session_id, |session| session.touch())
    }

    /// Drive a session to `Failed`
    pub fn fail(&self, session_id: SessionId, reason: &str) -> Result<Option<CallState>, SessionError> {
        self.with_session(session_id, |session| {
            let transition = session.apply(CallEvent::Failure);
            if transition.is_some() {
                warn!("Session {} failed: {}", session_id, reason);
            }
            transition
        })
    }

    /// Run `f` with the session locked
    ///
    /// If `f` moves the session into a terminal state, its members are
    /// released so they can join another session right away.
    pub fn with_session<R>(
        &self,
        session_id: SessionId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R, SessionError> {
        let slot = self.slot(session_id).ok_or(SessionError::NotFound(session_id))?;

        let mut session = slot.lock();
        let before = session.state();
        let result = f(&mut session);
        let after = session.state();
        let members = session.user_ids();
        drop(session);

        if before != after {
            if after.is_terminal() {
                for user_id in &members {
                    self.release_membership(session_id, user_id);
                }
            }
            self.journal_write(session_id, |journal| journal.record_state(session_id, after));
        }

        Ok(result)
    }

    /// Purge terminal sessions and finalize idle ones
    pub fn sweep(&self) -> Vec<Eviction> {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> Vec<Eviction> {
        let candidates: Vec<(SessionId, SessionSlot)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut evicted = Vec::new();

        for (session_id, slot) in candidates {
            let mut session = slot.lock();

            let timed_out = if session.state().is_terminal() {
                false
            } else if session.idle_for(now) > self.idle_timeout {
                session.apply(CallEvent::IdleTimeout);
                true
            } else {
                continue;
            };

            let final_state = session.state();
            let members = session.user_ids();
            drop(session);

            self.sessions
                .remove_if(&session_id, |_, current| Arc::ptr_eq(current, &slot));
            for user_id in &members {
                self.release_membership(session_id, user_id);
            }

            if timed_out {
                info!("Session {} timed out ({})", session_id, final_state);
            } else {
                debug!("Session {} evicted ({})", session_id, final_state);
            }

            self.journal_write(session_id, |journal| {
                if timed_out {
                    journal.record_state(session_id, final_state)?;
                }
                journal.record_eviction(session_id)
            });

            evicted.push(Eviction {
                session_id,
                final_state,
                timed_out,
            });
        }

        evicted
    }

    fn release_membership(&self, session_id: SessionId, user_id: &str) {
        self.memberships
            .remove_if(user_id, |_, current| *current == session_id);
    }

    fn journal_write(
        &self,
        session_id: SessionId,
        write: impl FnOnce(&Storage) -> Result<(), crate::storage::StorageError>,
    ) {
        if let Some(journal) = &self.journal {
            if let Err(e) = write(journal) {
                warn!("Failed to journal session {}: {}", session_id, e);
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(rtc_core::DEFAULT_IDLE_TIMEOUT_SECS))
    }
}
