//! Control server accept loop: binds the agent-facing TCP listener and
//! spawns one [`engine::run`] per inbound connection (spec.md §2.4, §4.2).
//!
//! The operator-facing HTTP/websocket upgrade is the out-of-scope admin
//! layer (spec.md §1); this module only owns the agent socket side. A
//! caller that does wire up an HTTP layer reaches [`bridge::run`] directly
//! once it has an upgraded `WebSocketStream` and a known `agent_id`.

use crate::address::PeerAddress;
use crate::config::ServerConfig;
use crate::connections::ConnectionsManager;
use crate::engine::{self, EngineOutcome};
use crate::keystore::Keystore;
use crate::persistence::AgentStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared handles one control server instance needs to drive the accept
/// loop and that an embedding binary also needs for the operator bridge
/// and the periodic keystore refresh.
pub struct ControlServer {
    pub keystore: Arc<Keystore>,
    pub connections: Arc<ConnectionsManager>,
    pub store: Arc<dyn AgentStore>,
    pub config: ServerConfig,
}

impl ControlServer {
    pub fn new(store: Arc<dyn AgentStore>, config: ServerConfig) -> Self {
        Self {
            keystore: Arc::new(Keystore::new(store.clone())),
            connections: Arc::new(ConnectionsManager::new(store.clone())),
            store,
            config,
        }
    }

    /// Bind the listener and run the accept loop until it errors or the
    /// process is asked to stop. Each accepted connection is driven on its
    /// own task by [`engine::run`]; the loop itself never blocks on a
    /// single agent's handshake or session (spec.md §5).
    pub async fn serve(&self) -> std::io::Result<()> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.serve_on(listener).await
    }

    /// Run the accept loop on an already-bound listener. Split out from
    /// [`Self::serve`] so tests can bind an ephemeral port, read back the
    /// actual address, and only then start accepting.
    pub async fn serve_on(&self, listener: TcpListener) -> std::io::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "control server listening for agent connections");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "accept failed");
                    continue;
                }
            };
            let peer_addr = PeerAddress::from(peer);

            let keystore = self.keystore.clone();
            let connections = self.connections.clone();
            let window_secs = self.config.skew_window_secs;

            tokio::spawn(async move {
                let outcome = engine::run(stream, peer_addr, &keystore, &connections, window_secs).await;
                log_outcome(peer_addr, &outcome);
            });
        }
    }
}

fn log_outcome(peer_addr: PeerAddress, outcome: &EngineOutcome) {
    match outcome {
        EngineOutcome::HandshakeFailed => {
            info!(%peer_addr, "connection closed: handshake failed");
        }
        EngineOutcome::Closed { agent_id, reason } => {
            info!(%peer_addr, %agent_id, ?reason, "agent connection closed");
        }
    }
}
