//! SQLite session journal
//!
//! Records sessions, their participants and every state transition so call
//! history survives server restarts. The live registry never reads from it.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info};

use rtc_core::{unix_now, CallState, Participant, SessionId};

/// SQLite storage backend
pub struct Storage {
    conn: Mutex<Connection>,
}

/// A participant row as stored in the journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalParticipant {
    pub user_id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub joined_at: i64,
    pub left_at: Option<i64>,
}

impl Storage {
    /// Open or create a new SQLite database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_activity INTEGER NOT NULL,
                evicted_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS participants (
                session_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                display_name TEXT NOT NULL,
                avatar_ref TEXT,
                joined_at INTEGER NOT NULL,
                left_at INTEGER,
                PRIMARY KEY (session_id, user_id),
                FOREIGN KEY (session_id) REFERENCES sessions(session_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                state TEXT NOT NULL,
                at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_participants_session ON participants(session_id);
            CREATE INDEX IF NOT EXISTS idx_transitions_session ON transitions(session_id);
            "#,
        )?;

        info!("Journal schema initialized");
        Ok(())
    }

    /// Record a newly created session (state `Ringing`)
    pub fn record_session(&self, session_id: SessionId) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let now = current_timestamp();
        let id = session_id.to_string();

        conn.execute(
            "INSERT OR IGNORE INTO sessions (session_id, state, created_at, last_activity) VALUES (?1, ?2, ?3, ?3)",
            params![id, CallState::Ringing.as_str(), now],
        )?;
        conn.execute(
            "INSERT INTO transitions (session_id, state, at) VALUES (?1, ?2, ?3)",
            params![id, CallState::Ringing.as_str(), now],
        )?;

        debug!("Session recorded in journal: {}", session_id);
        Ok(())
    }

    /// Record a participant joining a session
    pub fn record_join(&self, session_id: SessionId, participant: &Participant) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let now = current_timestamp();
        let id = session_id.to_string();

        conn.execute(
            "INSERT OR REPLACE INTO participants (session_id, user_id, display_name, avatar_ref, joined_at, left_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            params![
                id,
                participant.user_id,
                participant.display_name,
                participant.avatar_ref,
                now,
            ],
        )?;
        conn.execute(
            "UPDATE sessions SET last_activity = ?1 WHERE session_id = ?2",
            params![now, id],
        )?;

        debug!(
            "Participant {} joined session {} (journal)",
            participant.user_id, session_id
        );
        Ok(())
    }

    /// Record a participant leaving a session
    pub fn record_leave(&self, session_id: SessionId, user_id: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let now = current_timestamp();
        let id = session_id.to_string();

        conn.execute(
            "UPDATE participants SET left_at = ?1 WHERE session_id = ?2 AND user_id = ?3 AND left_at IS NULL",
            params![now, id, user_id],
        )?;
        conn.execute(
            "UPDATE sessions SET last_activity = ?1 WHERE session_id = ?2",
            params![now, id],
        )?;

        Ok(())
    }

    /// Record a state transition
    pub fn record_state(&self, session_id: SessionId, state: CallState) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let now = current_timestamp();
        let id = session_id.to_string();

        conn.execute(
            "UPDATE sessions SET state = ?1, last_activity = ?2 WHERE session_id = ?3",
            params![state.as_str(), now, id],
        )?;
        conn.execute(
            "INSERT INTO transitions (session_id, state, at) VALUES (?1, ?2, ?3)",
            params![id, state.as_str(), now],
        )?;

        Ok(())
    }

    /// Record that the sweeper evicted a session from the live registry
    pub fn record_eviction(&self, session_id: SessionId) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        conn.execute(
            "UPDATE sessions SET evicted_at = ?1 WHERE session_id = ?2",
            params![current_timestamp(), session_id.to_string()],
        )?;

        Ok(())
    }

    /// Last recorded state of a session
    pub fn session_state(&self, session_id: SessionId) -> Result<Option<CallState>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM sessions WHERE session_id = ?1",
                params![session_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(state.and_then(|s| s.parse().ok()))
    }

    /// Ordered list of states a session went through
    pub fn transitions(&self, session_id: SessionId) -> Result<Vec<CallState>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        let mut stmt =
            conn.prepare("SELECT state FROM transitions WHERE session_id = ?1 ORDER BY id")?;
        let states = stmt
            .query_map(params![session_id.to_string()], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|s| s.parse().ok())
            .collect();

        Ok(states)
    }

    /// Everyone who ever joined a session
    pub fn participants(&self, session_id: SessionId) -> Result<Vec<JournalParticipant>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        let mut stmt = conn.prepare(
            "SELECT user_id, display_name, avatar_ref, joined_at, left_at FROM participants
             WHERE session_id = ?1 ORDER BY joined_at, user_id",
        )?;

        let rows = stmt.query_map(params![session_id.to_string()], |row| {
            Ok(JournalParticipant {
                user_id: row.get(0)?,
                display_name: row.get(1)?,
                avatar_ref: row.get(2)?,
                joined_at: row.get(3)?,
                left_at: row.get(4)?,
            })
        })?;

        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Delete journal entries for sessions evicted more than `age_secs` ago
    pub fn prune_evicted(&self, age_secs: u64) -> Result<usize, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let threshold = current_timestamp() - (age_secs as i64);

        conn.execute(
            "DELETE FROM participants WHERE session_id IN (SELECT session_id FROM sessions WHERE evicted_at IS NOT NULL AND evicted_at < ?1)",
            params![threshold],
        )?;
        conn.execute(
            "DELETE FROM transitions WHERE session_id IN (SELECT session_id FROM sessions WHERE evicted_at IS NOT NULL AND evicted_at < ?1)",
            params![threshold],
        )?;
        let count = conn.execute(
            "DELETE FROM sessions WHERE evicted_at IS NOT NULL AND evicted_at < ?1",
            params![threshold],
        )?;

        if count > 0 {
            info!("Pruned {} evicted sessions from journal", count);
        }

        Ok(count)
    }

    /// Get total session count
    pub fn session_count(&self) -> Result<usize, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Sessions never evicted (still live, or live when the server stopped)
    pub fn open_session_count(&self) -> Result<usize, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE evicted_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

/// Get current Unix timestamp
fn current_timestamp() -> i64 {
    unix_now() as i64
}

/// Storage errors
#[derive(Debug)]
pub enum StorageError {
    Database(rusqlite::Error),
    /// Mutex lock was poisoned (indicates a panic occurred while holding the lock)
    LockPoisoned,
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        error!("Database error: {:?}", e);
        StorageError::Database(e)
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Database(e) => write!(f, "Database error: {}", e),
            StorageError::LockPoisoned => {
                write!(f, "Lock poisoned: a thread panicked while holding the lock")
            }
        }
    }
}

impl std::error::Error for StorageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_creation() {
        let storage = Storage::in_memory().unwrap();
        assert_eq!(storage.session_count().unwrap(), 0);
    }

    #[test]
    fn test_session_lifecycle_journal() {
        let storage = Storage::in_memory().unwrap();
        let id = SessionId::new();

        storage.record_session(id).unwrap();
        storage
            .record_join(id, &Participant::new("a", "Alice").with_avatar("/a.png"))
            .unwrap();
        storage.record_join(id, &Participant::new("b", "Bob")).unwrap();
        storage.record_state(id, CallState::Connecting).unwrap();
        storage.record_state(id, CallState::Active).unwrap();
        storage.record_leave(id, "b").unwrap();
        storage.record_state(id, CallState::Ended).unwrap();

        assert_eq!(storage.session_state(id).unwrap(), Some(CallState::Ended));
        assert_eq!(
            storage.transitions(id).unwrap(),
            vec![
                CallState::Ringing,
                CallState::Connecting,
                CallState::Active,
                CallState::Ended
            ]
        );

        let participants = storage.participants(id).unwrap();
        assert_eq!(participants.len(), 2);
        let alice = participants.iter().find(|p| p.user_id == "a").unwrap();
        assert_eq!(alice.avatar_ref.as_deref(), Some("/a.png"));
        assert!(alice.left_at.is_none());
        let bob = participants.iter().find(|p| p.user_id == "b").unwrap();
        assert!(bob.left_at.is_some());
    }

    #[test]
    fn test_eviction_and_prune() {
        let storage = Storage::in_memory().unwrap();
        let id = SessionId::new();
        storage.record_session(id).unwrap();
        assert_eq!(storage.open_session_count().unwrap(), 1);

        storage.record_eviction(id).unwrap();
        assert_eq!(storage.open_session_count().unwrap(), 0);

        // Evicted "now" is not older than one hour
        assert_eq!(storage.prune_evicted(3600).unwrap(), 0);
        assert_eq!(storage.session_count().unwrap(), 1);
    }

    #[test]
    fn test_unknown_session() {
        let storage = Storage::in_memory().unwrap();
        let id = SessionId::new();
        assert_eq!(storage.session_state(id).unwrap(), None);
        assert!(storage.transitions(id).unwrap().is_empty());
    }

    #[test]
    fn test_file_backed_journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        let id = SessionId::new();

        {
            let storage = Storage::open(&path).unwrap();
            storage.record_session(id).unwrap();
            storage.record_state(id, CallState::Failed).unwrap();
        }

        let storage = Storage::open(&path).unwrap();
        assert_eq!(storage.session_state(id).unwrap(), Some(CallState::Failed));
    }
}
