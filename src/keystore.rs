//! Snapshot-capable agent-id -> secret mapping (spec.md §2.2, §4.4).
//!
//! Handshake validation reads the snapshot, never the live persistence
//! layer, so a database outage never blocks an agent reconnect and the
//! handshake hot path never awaits a database round-trip.

use crate::model::AgentId;
use crate::persistence::{AgentStore, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

pub struct Keystore {
    store: Arc<dyn AgentStore>,
    snapshot: RwLock<Arc<HashMap<AgentId, String>>>,
}

impl Keystore {
    pub fn new(store: Arc<dyn AgentStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Reload the snapshot from persistence. Idempotent; the prior snapshot
    /// stays visible to concurrent readers until the new one is installed,
    /// atomically, in one write-lock acquisition.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        let records = self.store.list_agents().await?;
        let map: HashMap<AgentId, String> = records
            .into_iter()
            .map(|r| (r.agent_id, r.secret))
            .collect();
        let len = map.len();
        *self.snapshot.write().unwrap() = Arc::new(map);
        info!("keystore refreshed with {} agent secrets", len);
        Ok(())
    }

    /// A cheap `Arc` clone of the current snapshot, safe to iterate without
    /// holding any lock on the live map.
    pub fn snapshot(&self) -> Arc<HashMap<AgentId, String>> {
        self.snapshot.read().unwrap().clone()
    }
}
