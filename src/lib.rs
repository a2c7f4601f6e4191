//! pivotd — the transport core of a remote-administration control server.
//!
//! Scope is deliberately narrow (spec.md §1): encrypted framing, the
//! handshake, the per-agent connection registry, the duplex bridge between
//! agent sockets and operator websockets, and the agent-binary factory. The
//! HTTP admin API, the relational persistence layer, operator
//! authentication, settings loading, and the terminal UI are external
//! collaborators this crate only talks to through typed seams
//! (`persistence::AgentStore`, the `bridge::run` websocket parameter).

pub mod address;
pub mod bridge;
pub mod cipher;
pub mod config;
pub mod connections;
pub mod engine;
pub mod factory;
pub mod keystore;
pub mod merge;
pub mod model;
pub mod persistence;
pub mod server;
pub mod tasks;
pub mod transport;

pub use address::PeerAddress;
pub use cipher::{FramingCipher, HandshakeTag, SKEW_WINDOW_SECS};
pub use config::ServerConfig;
pub use connections::{ConnectionsManager, PIPE_CAPACITY};
pub use engine::{EngineOutcome, EngineState};
pub use factory::{BuildRequest, FactoryConfig, FactoryError};
pub use keystore::Keystore;
pub use model::{AgentId, AgentRecord};
pub use persistence::{AgentStore, StoreError};
pub use server::ControlServer;
