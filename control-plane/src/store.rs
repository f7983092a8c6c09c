//! Session storage contract.
//!
//! The durable store is an external collaborator; the core only consumes
//! this narrow interface. The in-memory implementation backs tests and
//! single-node deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use fleet_common::{Session, SessionSummary};

/// The relational-store contract the control plane consumes.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn list_sessions(&self, owner: Option<&str>) -> Vec<SessionSummary>;
    async fn get_session(&self, id: &str) -> Option<Session>;
    async fn create_session(&self, session: Session);
    async fn update_session(&self, session: Session);
}

/// In-memory session store.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn list_sessions(&self, owner: Option<&str>) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .filter(|s| owner.map_or(true, |o| s.owner == o))
            .map(|s| s.summary())
            .collect();
        summaries.sort_by(|a, b| b.created.cmp(&a.created));
        summaries
    }

    async fn get_session(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn create_session(&self, session: Session) {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
    }

    async fn update_session(&self, session: Session) {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
    }
}
