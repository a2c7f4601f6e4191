//! Agent record shape shared by the keystore and the connections manager.
//!
//! The relational persistence layer that actually owns this data is out of
//! scope (spec.md §1); this module defines only the typed view the core
//! reads and the slice of it the core is allowed to write back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for an agent, handed out by the (out-of-scope) admin API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read view of a persisted agent record (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub name: String,
    /// ASCII handshake pre-key / cipher pre-key. Length 32 in the reference
    /// deployment, but nothing in the core assumes a fixed length.
    pub secret: String,
    pub owner_id: Uuid,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_from: Option<String>,
}
