//! Per-connection handle
//!
//! A `Connection` is identified by its `ConnectionId`, never by content. The
//! read half of the socket belongs to the connection's read loop; the write
//! half lives here so handlers can reply to the peer.

use super::codec::Utf8FrameCodec;
use super::error::{ServerError, ServerResult};
use futures_util::SinkExt;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

/// Unique identifier of an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An established client connection
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    alive: AtomicBool,
    cancel: CancellationToken,
    writer: Mutex<Option<FramedWrite<OwnedWriteHalf, Utf8FrameCodec>>>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        peer: SocketAddr,
        writer: OwnedWriteHalf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            alive: AtomicBool::new(true),
            cancel,
            writer: Mutex::new(Some(FramedWrite::new(writer, Utf8FrameCodec))),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote endpoint of the connection
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// False once the read loop has exited
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Request the read loop to stop
    ///
    /// The loop finishes through its local-close path and reports
    /// `remote = false` to `on_close`.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Send one framed message to the peer
    pub async fn send(&self, text: &str) -> ServerResult<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(framed) => framed.send(text).await,
            None => Err(ServerError::ConnectionClosed {
                id: self.id.0,
                peer: self.peer,
            }),
        }
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Mark dead and drop the write half, closing the socket
    pub(crate) async fn release(&self) {
        self.alive.store(false, Ordering::Release);
        self.writer.lock().await.take();
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}
