//! Authenticated-session table.
//!
//! Sessions are single-owner, capped in number and expire at an absolute
//! deadline regardless of activity. Validation and expiry removal happen
//! under one lock so a dying session is never visible to a second caller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use uuid::Uuid;

/// Absolute session lifetime. There is no renewal.
pub const SESSION_LIFETIME: Duration = Duration::from_secs(8 * 60 * 60);

/// One authenticated client.
#[derive(Debug, Clone)]
pub struct Session {
    pub id:              String,
    pub pid:             u32,
    pub executable_path: Option<PathBuf>,
    pub created_at:      SystemTime,
    pub expires_at:      SystemTime,
}

pub struct SessionManager {
    max_sessions: usize,
    table:        Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a session, or returns `None` when the concurrent-session cap
    /// is reached. Existing sessions are never evicted to make room, but
    /// entries that expired on their own no longer count against the cap.
    pub fn create(&self, pid: u32, executable_path: Option<PathBuf>) -> Option<Session> {
        self.create_with_lifetime(pid, executable_path, SESSION_LIFETIME)
    }

    fn create_with_lifetime(
        &self,
        pid: u32,
        executable_path: Option<PathBuf>,
        lifetime: Duration,
    ) -> Option<Session> {
        let now = SystemTime::now();
        let mut table = self.table.lock();
        table.retain(|_, session| session.expires_at > now);

        if table.len() >= self.max_sessions {
            return None;
        }

        let session = Session {
            id: Uuid::new_v4().to_string(),
            pid,
            executable_path,
            created_at: now,
            expires_at: now + lifetime,
        };
        table.insert(session.id.clone(), session.clone());
        Some(session)
    }

    /// Looks a session up and checks expiry in one step. An expired entry is
    /// removed before this returns, so concurrent callers can never both
    /// observe it.
    pub fn validate(&self, session_id: &str) -> Option<Session> {
        let now = SystemTime::now();
        let mut table = self.table.lock();
        match table.get(session_id) {
            Some(session) if session.expires_at > now => Some(session.clone()),
            Some(_) => {
                table.remove(session_id);
                None
            }
            None => None,
        }
    }

    /// Removes a session. Removing an unknown or already-removed id is a
    /// no-op.
    pub fn remove(&self, session_id: &str) {
        self.table.lock().remove(session_id);
    }

    pub fn active_count(&self) -> usize {
        let now = SystemTime::now();
        self.table
            .lock()
            .values()
            .filter(|s| s.expires_at > now)
            .count()
    }
}
