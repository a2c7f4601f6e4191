//! In-memory registry of live agent connections (spec.md §4.4).
//!
//! Holds the agent-id -> connection map and the background task registry
//! the source used to keep at process scope. `register` implements the
//! pop-or-none-then-insert eviction rule: at most one Connected entry per
//! agent-id exists at any instant (spec.md §3, §8 P4). The handshake
//! keystore itself lives on [`crate::server::ControlServer`], shared with
//! the accept loop; this manager only needs persistence for
//! `update_last_seen`.

use crate::address::PeerAddress;
use crate::model::AgentId;
use crate::persistence::AgentStore;
use crate::tasks::BackgroundTasks;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{info, warn};

/// Slots per direction (spec.md §3, §4.4).
pub const PIPE_CAPACITY: usize = 1024;

/// Engine-facing half of a freshly registered connection: the ends the
/// framing engine reads from / writes to, plus the signal that fires when
/// a later handshake for the same agent supersedes this one.
pub struct EngineEnds {
    pub generation: u64,
    pub op_to_agent_rx: mpsc::Receiver<Vec<u8>>,
    pub agent_to_op_tx: mpsc::Sender<Vec<u8>>,
    pub evicted: oneshot::Receiver<()>,
}

/// Bridge-facing half of a registered connection: what the operator
/// bridge sends into and reads out of, plus the generation it must quote
/// back to [`ConnectionsManager::connection_lost`] on its own teardown.
pub struct BridgeEnds {
    pub generation: u64,
    pub op_to_agent_tx: mpsc::Sender<Vec<u8>>,
    pub agent_to_op_rx: Arc<AsyncMutex<mpsc::Receiver<Vec<u8>>>>,
}

struct ConnectionRecord {
    generation: u64,
    peer_address: PeerAddress,
    evict_tx: Option<oneshot::Sender<()>>,
    op_to_agent_tx: mpsc::Sender<Vec<u8>>,
    agent_to_op_rx: Arc<AsyncMutex<mpsc::Receiver<Vec<u8>>>>,
}

pub struct ConnectionsManager {
    store: Arc<dyn AgentStore>,
    connections: StdMutex<HashMap<AgentId, ConnectionRecord>>,
    background: BackgroundTasks,
    next_generation: AtomicU64,
}

impl ConnectionsManager {
    pub fn new(store: Arc<dyn AgentStore>) -> Self {
        Self {
            store,
            connections: StdMutex::new(HashMap::new()),
            background: BackgroundTasks::new(),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Register a newly handshaken connection for `agent_id`, evicting and
    /// tearing down any prior entry first (spec.md §4.2, §4.4, §8 P4).
    ///
    /// Eviction is synchronous with registration: the old record is popped
    /// and its teardown signal fired before the new record becomes
    /// observable, under the same registry lock.
    pub fn register(&self, agent_id: AgentId, peer_address: PeerAddress) -> EngineEnds {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        let (op_to_agent_tx, op_to_agent_rx) = mpsc::channel(PIPE_CAPACITY);
        let (agent_to_op_tx, agent_to_op_rx) = mpsc::channel(PIPE_CAPACITY);
        let agent_to_op_rx = Arc::new(AsyncMutex::new(agent_to_op_rx));
        let (evict_tx, evicted) = oneshot::channel();

        let record = ConnectionRecord {
            generation,
            peer_address,
            evict_tx: Some(evict_tx),
            op_to_agent_tx,
            agent_to_op_rx,
        };

        let prior = {
            let mut connections = self.connections.lock().unwrap();
            let prior = connections.remove(&agent_id);
            connections.insert(agent_id, record);
            prior
        };

        if let Some(mut prior) = prior {
            warn!(%agent_id, prior_generation = prior.generation, "evicting superseded connection");
            if let Some(tx) = prior.evict_tx.take() {
                let _ = tx.send(());
            }
        }

        EngineEnds {
            generation,
            op_to_agent_rx,
            agent_to_op_tx,
            evicted,
        }
    }

    /// Bridge-facing lookup used by the operator bridge (spec.md §4.5 step 1).
    /// Returns `None` when the agent is not currently Connected.
    pub fn bridge_ends(&self, agent_id: AgentId) -> Option<BridgeEnds> {
        let connections = self.connections.lock().unwrap();
        connections.get(&agent_id).map(|record| BridgeEnds {
            generation: record.generation,
            op_to_agent_tx: record.op_to_agent_tx.clone(),
            agent_to_op_rx: record.agent_to_op_rx.clone(),
        })
    }

    /// Fire the engine's "connection lost" signal for `agent_id`, iff the
    /// registry entry still matches `generation` (spec.md §4.5 step 6).
    ///
    /// Used by the operator bridge on its own termination: the bridge holds
    /// only clones of the pipe ends, so dropping them never closes the
    /// engine's side of the channel, and without this call an agent whose
    /// operator detaches would sit in the registry forever. Firing
    /// `evict_tx` wakes the engine's own `evicted` branch, which then tears
    /// the connection down and calls `remove_if_current` itself — this
    /// method never removes the entry directly.
    pub fn connection_lost(&self, agent_id: AgentId, generation: u64) {
        let mut connections = self.connections.lock().unwrap();
        if let Some(record) = connections.get_mut(&agent_id) {
            if record.generation == generation {
                if let Some(tx) = record.evict_tx.take() {
                    let _ = tx.send(());
                }
            }
        }
    }

    /// Remove the registry entry for `agent_id` iff it still matches
    /// `generation` — guards against a teardown racing a newer handshake's
    /// registration for the same agent (spec.md §4.2 "if the registry
    /// entry still points at this engine, remove it").
    pub fn remove_if_current(&self, agent_id: AgentId, generation: u64) {
        let mut connections = self.connections.lock().unwrap();
        if let std::collections::hash_map::Entry::Occupied(entry) = connections.entry(agent_id) {
            if entry.get().generation == generation {
                entry.remove();
            }
        }
    }

    pub fn is_connected(&self, agent_id: AgentId) -> bool {
        self.connections.lock().unwrap().contains_key(&agent_id)
    }

    pub fn peer_address_of(&self, agent_id: AgentId) -> Option<PeerAddress> {
        self.connections
            .lock()
            .unwrap()
            .get(&agent_id)
            .map(|r| r.peer_address)
    }

    /// Best-effort `last_seen`/`last_from` update, fired as a background
    /// task; failures are logged and never surfaced to the caller
    /// (spec.md §4.4, §7 PersistenceFailure).
    pub fn update_last_seen(&self, agent_id: AgentId, peer_address: PeerAddress) {
        let store = self.store.clone();
        self.background.spawn(async move {
            let peer = peer_address.to_string();
            if let Err(err) = store.record_seen(agent_id, &peer, Utc::now()).await {
                warn!(%agent_id, %err, "failed to record last_seen");
            } else {
                info!(%agent_id, %peer, "recorded last_seen");
            }
        });
    }
}
