//! The global session queue.
//!
//! An in-memory ordered set of pending sessions. Sessions are ordered by
//! effective priority (priority flag first, then oldest created), but the
//! queue is not strictly FIFO: a scheduler filter may skip non-matching
//! head elements.

use std::sync::Mutex;

use chrono::Utc;

use fleet_common::{Session, SessionFilter, SessionSummary};

/// Ordered set of pending sessions with filtered lookup.
///
/// All operations take a single internal lock; none of them block on I/O.
#[derive(Default)]
pub struct SessionQueue {
    sessions: Mutex<Vec<Session>>,
}

/// Comparator position: priority sessions first, then oldest created first.
fn ordering(a: &Session, b: &Session) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created.cmp(&b.created))
}

impl SessionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session, idempotent by ID. If the session is already queued
    /// the newer copy replaces it (a new user interaction overwrites the
    /// older pending entry).
    pub fn enqueue(&self, session: Session) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|s| s.id != session.id);
        let pos = sessions
            .binary_search_by(|s| ordering(s, &session))
            .unwrap_or_else(|pos| pos);
        sessions.insert(pos, session);
    }

    /// Remove a session by ID. No-op when absent.
    pub fn remove(&self, session_id: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().unwrap();
        let pos = sessions.iter().position(|s| s.id == session_id)?;
        Some(sessions.remove(pos))
    }

    /// The first session in comparator order that satisfies the filter.
    /// Does not remove; callers commit with [`SessionQueue::remove`].
    pub fn match_session(&self, filter: &SessionFilter) -> Option<Session> {
        let sessions = self.sessions.lock().unwrap();
        let now = Utc::now();
        sessions.iter().find(|s| filter.matches(s, now)).cloned()
    }

    /// Match and remove in one critical section. This is what the scheduler
    /// uses so that two concurrent pollers can never receive the same
    /// session.
    pub fn take_matching(&self, filter: &SessionFilter) -> Option<Session> {
        let mut sessions = self.sessions.lock().unwrap();
        let now = Utc::now();
        let pos = sessions.iter().position(|s| filter.matches(s, now))?;
        Some(sessions.remove(pos))
    }

    /// Dashboard view of the pending queue, in scheduling order.
    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.lock().unwrap();
        sessions.iter().map(|s| s.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }
}
