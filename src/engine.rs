//! The control server protocol engine — drives one accepted agent
//! connection end to end (spec.md §4.2; SPEC_FULL.md §4).

use crate::address::PeerAddress;
use crate::cipher::{self, FramingCipher};
use crate::connections::ConnectionsManager;
use crate::keystore::Keystore;
use crate::model::AgentId;
use crate::transport::{SessionContext, SubProtocolTransport};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const TAG_SIZE: usize = 8;
const READ_CHUNK: usize = 8192;

/// Lifecycle phase of one engine instance (spec.md §3, §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Establishing,
    Handshake,
    Connected { agent_id: AgentId },
    Closed,
}

/// Internal failure taxonomy (spec.md §7). None of these escape `run`;
/// they only decide log verbosity and whether a background task fires.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid handshake")]
    InvalidHandshake,
    #[error("unexpected data before handshake completed")]
    InvalidState,
    #[error("bounded pipe overflowed")]
    PipeOverflow,
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What happened to one connection, for logging/metrics at the caller.
/// `run` never propagates `EngineError` itself — only this outcome.
#[derive(Debug)]
pub enum EngineOutcome {
    /// Handshake never completed (bad tag, short read, or I/O error
    /// before any agent was identified).
    HandshakeFailed,
    /// The agent connected, was identified, and the session later ended
    /// for the given reason.
    Closed {
        agent_id: AgentId,
        reason: CloseReason,
    },
}

#[derive(Debug)]
pub enum CloseReason {
    Eof,
    Evicted,
    Io,
    PipeOverflow,
}

/// Drive `stream` through handshake and, on success, the connected
/// read/write loop, until the session ends. Never returns an `Err` — all
/// internal failures are folded into the returned `EngineOutcome` (spec.md
/// §7 "framing-engine internal failures never escape to the event loop").
pub async fn run(
    mut stream: TcpStream,
    peer_addr: PeerAddress,
    keystore: &Keystore,
    connections: &ConnectionsManager,
    window_secs: i64,
) -> EngineOutcome {
    let mut state = EngineState::Establishing;
    debug!(%peer_addr, ?state, "engine accepted");
    state = EngineState::Handshake;
    debug!(%peer_addr, ?state, "engine entering handshake");

    let mut buf = vec![0u8; TAG_SIZE];
    if let Err(io_err) = stream.read_exact(&mut buf).await {
        let err = EngineError::from(io_err);
        debug!(%peer_addr, %err, "handshake read failed");
        return EngineOutcome::HandshakeFailed;
    }

    let snapshot = keystore.snapshot();
    let accepted = match cipher::accept(&buf, &snapshot, window_secs) {
        Ok(accepted) => accepted,
        Err(_) => {
            // spec.md §4.1 step 5: close silently, never distinguish
            // unknown-agent from clock-skew to the peer or the log.
            let err = EngineError::InvalidHandshake;
            debug!(%peer_addr, %err, "handshake rejected");
            return EngineOutcome::HandshakeFailed;
        }
    };

    let agent_id = accepted.agent_id;
    state = EngineState::Connected { agent_id };
    debug!(%peer_addr, ?state, "engine connected");

    let engine_ends = connections.register(agent_id, peer_addr);
    let mut op_to_agent_rx = engine_ends.op_to_agent_rx;
    let agent_to_op_tx = engine_ends.agent_to_op_tx;
    let mut evicted = engine_ends.evicted;
    let generation = engine_ends.generation;

    connections.update_last_seen(agent_id, peer_addr);

    let (mut read_half, write_half) = stream.into_split();
    let write_half: Arc<Mutex<OwnedWriteHalf>> = Arc::new(Mutex::new(write_half));
    // `decrypt` is driven only from this task's read branch below, and
    // `transport.write` only from the outbound branch — both live on the
    // same `FramingCipher`, so the mutex is never actually contended, just
    // the seam the sub-protocol transport facade needs to own its half of
    // the cipher independently of the inbound decrypt path (spec.md §4.3).
    let cipher_pair = Arc::new(Mutex::new(accepted.cipher));
    let context = SessionContext { agent_id, peer_address: peer_addr };
    let transport = SubProtocolTransport::new(write_half.clone(), cipher_pair.clone(), context);

    let mut read_buf = vec![0u8; READ_CHUNK];
    let close_reason;

    loop {
        tokio::select! {
            biased;

            _ = &mut evicted => {
                close_reason = CloseReason::Evicted;
                break;
            }

            read_result = read_half.read(&mut read_buf) => {
                match read_result {
                    Ok(0) => {
                        if agent_to_op_tx.try_send(Vec::new()).is_err() {
                            // spec.md §9 open question: preserve the
                            // in-band empty-vec EOF marker; if the pipe is
                            // already full the EOF signal is dropped, same
                            // as any other overflow — connection tears
                            // down regardless since we break below anyway.
                        }
                        close_reason = CloseReason::Eof;
                        break;
                    }
                    Ok(n) => {
                        let mut chunk = read_buf[..n].to_vec();
                        cipher_pair.lock().await.decrypt(&mut chunk);
                        if agent_to_op_tx.try_send(chunk).is_err() {
                            let err = EngineError::PipeOverflow;
                            warn!(%agent_id, %err, "agent->operator pipe overflowed");
                            close_reason = CloseReason::PipeOverflow;
                            break;
                        }
                    }
                    Err(io_err) => {
                        let err = EngineError::from(io_err);
                        warn!(%agent_id, %err, "socket read error");
                        close_reason = CloseReason::Io;
                        break;
                    }
                }
            }

            outbound = op_to_agent_rx.recv() => {
                match outbound {
                    Some(chunk) => {
                        if let Err(io_err) = transport.write(&chunk).await {
                            let err = EngineError::from(io_err);
                            warn!(%agent_id, %err, "socket write error");
                            close_reason = CloseReason::Io;
                            break;
                        }
                    }
                    None => {
                        close_reason = CloseReason::Eof;
                        break;
                    }
                }
            }
        }
    }

    state = EngineState::Closed;
    debug!(%agent_id, ?state, ?close_reason, "engine closed");
    connections.remove_if_current(agent_id, generation);
    let _ = transport.write_eof().await;

    EngineOutcome::Closed {
        agent_id,
        reason: close_reason,
    }
}
