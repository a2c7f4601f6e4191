//! The relational persistence collaborator, typed but not implemented here.
//!
//! spec.md §1 puts the database behind the core; this trait is the seam.
//! Production deployments hand the connections manager a concrete
//! implementation that talks to whatever the admin API is backed by.

use crate::model::{AgentId, AgentRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),
    #[error("agent {0} not found")]
    NotFound(AgentId),
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Full snapshot of every agent record, used to rebuild the keystore.
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError>;

    /// Record a successful handshake. Callers treat failures as best-effort
    /// (spec.md §4.4 `update_last_seen` / §7 `PersistenceFailure`).
    async fn record_seen(
        &self,
        agent_id: AgentId,
        peer: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// In-memory store used by tests and by the bundled binary when no real
/// database is configured. Not the production deployment path — a real
/// deployment hands `ControlServer::new` an `Arc<dyn AgentStore>` backed by
/// the actual relational layer (spec.md §1's out-of-scope persistence
/// collaborator).
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryAgentStore {
        records: Mutex<HashMap<AgentId, AgentRecord>>,
    }

    impl MemoryAgentStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, record: AgentRecord) {
            self.records.lock().unwrap().insert(record.agent_id, record);
        }
    }

    #[async_trait]
    impl AgentStore for MemoryAgentStore {
        async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
            Ok(self.records.lock().unwrap().values().cloned().collect())
        }

        async fn record_seen(
            &self,
            agent_id: AgentId,
            peer: &str,
            at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            let mut records = self.records.lock().unwrap();
            let record = records
                .get_mut(&agent_id)
                .ok_or(StoreError::NotFound(agent_id))?;
            record.last_seen = Some(at);
            record.last_from = Some(peer.to_string());
            Ok(())
        }
    }
}
