//! Full accept -> handshake -> operator bridge path over real loopback
//! sockets (SPEC_FULL.md §9 "Test tooling"), in the style of the
//! teacher's `tests/net_test.rs` but in-process since pivotd's surface is
//! a library, not only a binary.

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use pivotd::cipher::{self, FramingCipher};
use pivotd::model::{AgentId, AgentRecord};
use pivotd::persistence::memory::MemoryAgentStore;
use pivotd::{bridge, ControlServer, ServerConfig};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

#[tokio::test]
async fn agent_connects_and_operator_bridge_relays_both_directions() {
    let store = Arc::new(MemoryAgentStore::new());
    let agent_id = AgentId(Uuid::new_v4());
    let secret = "V6h9A_wyEE6YLFiAtxY4W601RkBQIsLn";
    store.insert(AgentRecord {
        agent_id,
        name: "alpha".into(),
        secret: secret.into(),
        owner_id: Uuid::new_v4(),
        last_seen: None,
        last_from: None,
    });

    let server = ControlServer::new(store, ServerConfig::default());
    server.keystore.refresh().await.unwrap();
    let connections = server.connections.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve_on(listener).await;
    });

    // Agent side: handshake then hold the connection open.
    let mut agent_socket = TcpStream::connect(addr).await.unwrap();
    let t = Utc::now().timestamp();
    let tag = cipher::compute_tag(secret.as_bytes(), t);
    let mangled = cipher::mangle_key(secret.as_bytes(), &tag);
    let mut agent_cipher = FramingCipher::new(&mangled);

    agent_socket.write_all(tag.as_bytes()).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(connections.is_connected(agent_id), "agent must be registered after handshake");

    // Operator side: an already-upgraded websocket over an in-process duplex.
    let (operator_half, server_half) = tokio::io::duplex(8192);
    let operator_handshake = tokio_tungstenite::client_async("ws://localhost/agents", operator_half);
    let server_handshake = tokio_tungstenite::accept_async(server_half);
    let (operator_result, server_result) = tokio::join!(operator_handshake, server_handshake);
    let (mut operator_ws, _) = operator_result.unwrap();
    let agent_ws: WebSocketStream<_> = server_result.unwrap();

    let bridge_connections = connections.clone();
    let bridge_task = tokio::spawn(async move { bridge::run(agent_id, agent_ws, &bridge_connections).await });

    // Operator -> agent: bridge forwards the websocket payload into the
    // op->agent pipe, the engine encrypts it and writes it to the socket.
    operator_ws
        .send(Message::Binary(b"hello\n".to_vec()))
        .await
        .unwrap();

    let mut received = vec![0u8; 6];
    tokio::io::AsyncReadExt::read_exact(&mut agent_socket, &mut received)
        .await
        .unwrap();
    agent_cipher.decrypt(&mut received);
    assert_eq!(&received, b"hello\n");

    // Agent -> operator: the engine decrypts the agent's bytes onto the
    // agent->op pipe, the bridge forwards them as a binary websocket frame.
    let mut outbound = b"world\n".to_vec();
    agent_cipher.encrypt(&mut outbound);
    agent_socket.write_all(&outbound).await.unwrap();

    let frame = operator_ws.next().await.unwrap().unwrap();
    assert_eq!(frame, Message::Binary(b"world\n".to_vec()));

    let _ = operator_ws.close(None).await;
    let _ = bridge_task.await;
}

#[tokio::test]
async fn operator_bridge_rejects_unknown_agent_before_upgrade_completes() {
    let store = Arc::new(MemoryAgentStore::new());
    let server = ControlServer::new(store, ServerConfig::default());
    let connections = server.connections.clone();

    let (_client, server_half) = tokio::io::duplex(1024);
    let agent_ws = tokio_tungstenite::accept_async(server_half).await.unwrap();

    let result = bridge::run(AgentId(Uuid::new_v4()), agent_ws, &connections).await;
    assert!(result.is_err());
}
