//! Sub-protocol transport facade (spec.md §4.3, §9 "model as an explicit
//! SessionContext value").
//!
//! The source dynamically bolts `client_id`, `peername`, and `key` onto a
//! plain transport object via an "extra info" dict. Here that dynamic
//! attribute bag becomes a typed, immutable `SessionContext` the transport
//! carries from construction, and the transport itself is a write-only
//! facade: every write is encrypted before it reaches the agent socket.

use crate::address::PeerAddress;
use crate::cipher::FramingCipher;
use crate::model::AgentId;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Everything the sub-protocol is allowed to know about the connection it
/// rides on, captured once at handshake acceptance.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub agent_id: AgentId,
    pub peer_address: PeerAddress,
}

/// Write-only facade between the sub-protocol and the raw agent socket.
///
/// Encrypts on write and proxies close/half-close to the underlying
/// writer. Has no lifecycle of its own beyond the framing engine that
/// constructs it (spec.md §4.3).
pub struct SubProtocolTransport<W> {
    raw: Arc<Mutex<W>>,
    cipher: Arc<Mutex<FramingCipher>>,
    context: SessionContext,
}

impl<W> SubProtocolTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(raw: Arc<Mutex<W>>, cipher: Arc<Mutex<FramingCipher>>, context: SessionContext) -> Self {
        Self { raw, cipher, context }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Encrypt `data` and forward the ciphertext to the raw transport.
    pub async fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut buf = data.to_vec();
        self.cipher.lock().await.encrypt(&mut buf);
        let mut raw = self.raw.lock().await;
        raw.write_all(&buf).await?;
        raw.flush().await
    }

    /// Half-close the outbound side; no further writes are expected.
    pub async fn write_eof(&self) -> std::io::Result<()> {
        self.raw.lock().await.shutdown().await
    }

    pub fn can_write_eof(&self) -> bool {
        true
    }
}
