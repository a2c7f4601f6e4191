//! Operator bridge: splices an authenticated operator websocket to an
//! agent's byte pipes (spec.md §4.5; SPEC_FULL.md §6).
//!
//! The HTTP layer that authenticates the operator and performs the
//! websocket upgrade is out of scope; this module starts from an already
//! upgraded [`WebSocketStream`].

use crate::connections::ConnectionsManager;
use crate::merge::{merge_next, Either, NextSource, Source};
use crate::model::AgentId;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The agent has no live connection; the caller should have returned
    /// 409 before the websocket upgrade completed (spec.md §4.5 step 1).
    #[error("agent {0} is not online")]
    AgentNotOnline(AgentId),
    #[error("websocket error: {0}")]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Adapts a websocket stream to [`NextSource`] so it can sit on one side
/// of [`merge_next`] alongside the agent→operator pipe.
struct WsSource<S> {
    socket: WebSocketStream<S>,
}

#[async_trait]
impl<S> NextSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    type Item = Result<Message, tokio_tungstenite::tungstenite::Error>;

    async fn next(&mut self) -> Option<Self::Item> {
        self.socket.next().await
    }
}

/// Run the bridge until either side ends the session (spec.md §4.5).
///
/// On every exit path this calls `connections.connection_lost`, which wakes
/// the engine's own `evicted` branch so it tears the connection down and
/// removes the registry entry itself — the bridge only holds clones of the
/// pipe ends, so dropping them here would never be observed by the engine
/// on its own (spec.md §4.5 step 6, "call the engine's connection lost with
/// no error").
pub async fn run<S>(
    agent_id: AgentId,
    socket: WebSocketStream<S>,
    connections: &ConnectionsManager,
) -> Result<(), BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let bridge_ends = connections
        .bridge_ends(agent_id)
        .ok_or(BridgeError::AgentNotOnline(agent_id))?;
    let generation = bridge_ends.generation;

    let mut ws = WsSource { socket };
    let mut agent_to_op_rx = bridge_ends.agent_to_op_rx.lock().await;

    loop {
        match merge_next(&mut *agent_to_op_rx, &mut ws).await {
            Some((Source::A, Either::A(bytes))) => {
                if ws.socket.send(Message::Binary(bytes)).await.is_err() {
                    debug!(%agent_id, "websocket send failed, ending bridge");
                    break;
                }
            }
            Some((Source::B, Either::B(Ok(Message::Binary(bytes))))) => {
                if bridge_ends.op_to_agent_tx.try_send(bytes).is_err() {
                    warn!(%agent_id, "operator->agent pipe overflowed, ending bridge");
                    break;
                }
            }
            Some((Source::B, Either::B(Ok(Message::Close(_))))) => {
                debug!(%agent_id, "operator closed websocket");
                break;
            }
            Some((Source::B, Either::B(Ok(_)))) => {
                // Ping/Pong/Text frames carry no agent payload; ignored.
                continue;
            }
            Some((Source::B, Either::B(Err(err)))) => {
                warn!(%agent_id, %err, "websocket error, ending bridge");
                break;
            }
            // Agent pipe closed (engine tore down) or websocket stream ended.
            None | Some((Source::A, _)) => break,
        }
    }

    let _ = ws.socket.close(None).await;
    connections.connection_lost(agent_id, generation);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PeerAddress;
    use crate::persistence::memory::MemoryAgentStore;
    use std::sync::Arc;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use uuid::Uuid;

    #[tokio::test]
    async fn agent_not_online_is_rejected_before_any_io() {
        let connections = ConnectionsManager::new(Arc::new(MemoryAgentStore::new()));
        let (client, _server) = tokio::io::duplex(1024);
        let ws = WebSocketStream::from_raw_socket(client, Role::Server, None).await;

        let result = run(AgentId(Uuid::new_v4()), ws, &connections).await;
        assert!(matches!(result, Err(BridgeError::AgentNotOnline(_))));
    }

    #[tokio::test]
    async fn agent_bytes_are_forwarded_as_binary_frames() {
        let connections = ConnectionsManager::new(Arc::new(MemoryAgentStore::new()));
        let agent_id = AgentId(Uuid::new_v4());
        let peer = PeerAddress::from("127.0.0.1:5555".parse::<std::net::SocketAddr>().unwrap());
        let engine_ends = connections.register(agent_id, peer);

        engine_ends.agent_to_op_tx.try_send(b"world\n".to_vec()).unwrap();
        drop(engine_ends.agent_to_op_tx);

        let (client, server) = tokio::io::duplex(4096);
        let operator_handshake = tokio_tungstenite::client_async("ws://localhost/agents", client);
        let agent_handshake = tokio_tungstenite::accept_async(server);

        let (operator_result, agent_result) = tokio::join!(operator_handshake, agent_handshake);
        let (mut operator_ws, _response) = operator_result.unwrap();
        let agent_ws = agent_result.unwrap();

        // `connections` is a stack-local `&ConnectionsManager`, so the
        // driving future is joined in-place rather than spawned onto the
        // runtime (spawning would require it to be `'static`).
        let (bridge_result, _) = tokio::join!(
            run(agent_id, agent_ws, &connections),
            async {
                let msg = operator_ws.next().await.unwrap().unwrap();
                assert_eq!(msg, Message::Binary(b"world\n".to_vec()));
                let _ = operator_ws.close(None).await;
            }
        );
        assert!(bridge_result.is_ok());
    }

    #[tokio::test]
    async fn bridge_exit_fires_connection_lost_for_the_engine() {
        let connections = ConnectionsManager::new(Arc::new(MemoryAgentStore::new()));
        let agent_id = AgentId(Uuid::new_v4());
        let peer = PeerAddress::from("127.0.0.1:5556".parse::<std::net::SocketAddr>().unwrap());
        let engine_ends = connections.register(agent_id, peer);

        let (client, server) = tokio::io::duplex(4096);
        let operator_handshake = tokio_tungstenite::client_async("ws://localhost/agents", client);
        let agent_handshake = tokio_tungstenite::accept_async(server);
        let (operator_result, agent_result) = tokio::join!(operator_handshake, agent_handshake);
        let (operator_ws, _response) = operator_result.unwrap();
        let agent_ws = agent_result.unwrap();

        // Operator walks away (closes the websocket) with no agent traffic
        // pending; the bridge must still notify the engine so it tears down
        // instead of leaking the registry entry forever.
        drop(operator_ws);

        let result = run(agent_id, agent_ws, &connections).await;
        assert!(result.is_ok());
        assert!(engine_ends.evicted.await.is_ok(), "engine must observe connection_lost");
    }
}
