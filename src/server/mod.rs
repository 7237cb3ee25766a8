//! Connection Server
//!
//! A generic TCP server that accepts any number of concurrent clients, reads
//! length-framed UTF-8 messages from each, and drives three lifecycle hooks on
//! a caller-supplied [`ConnectionHandler`].
//!
//! ## Tasks
//!
//! - one accept loop, spawned by [`ConnectionServer::start`]
//! - one read loop per accepted connection
//!
//! ## Hook ordering
//!
//! For a single connection the handler observes `on_open`, then zero or more
//! `on_message` calls in the order the frames arrived, then exactly one
//! `on_close`. `on_open` runs before the read loop is spawned, so any
//! bookkeeping it does is in place before the first `on_message`. Hooks for
//! different connections run concurrently.
//!
//! ## Shutdown
//!
//! [`ConnectionServer::stop`] closes the listener, waits for the accept loop to
//! exit, then cancels every live connection. It does not wait for the read
//! loops themselves; each one unwinds through `on_close(conn, false)`.

mod codec;
mod connection;
mod error;

pub use codec::{Frame, Utf8FrameCodec, MAX_FRAME_LEN};
pub use connection::{Connection, ConnectionId};
pub use error::{ServerError, ServerResult};

use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

/// Backoff after a failed `accept` before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle callbacks invoked by a [`ConnectionServer`]
///
/// Hooks are synchronous and should only do bounded, non-blocking work. A
/// slow `on_message` throttles its own connection and nothing else.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A new connection was accepted
    fn on_open(&self, conn: &Arc<Connection>);

    /// A complete message arrived on `conn`
    fn on_message(&self, conn: &Arc<Connection>, message: String);

    /// The connection ended
    ///
    /// `remote` is true when the peer closed or reset the connection, false
    /// when it was cancelled locally or failed with a local error.
    fn on_close(&self, conn: &Arc<Connection>, remote: bool);

    /// A frame arrived whose payload was not valid UTF-8
    fn on_malformed(&self, conn: &Arc<Connection>, error: std::str::Utf8Error) {
        tracing::warn!(
            connection_id = %conn.id(),
            peer = %conn.peer(),
            error = %error,
            "Dropped frame with invalid UTF-8"
        );
    }
}

enum RunState {
    /// Bound but not yet accepting
    Idle(TcpListener),
    Running {
        shutdown: CancellationToken,
        accept_task: JoinHandle<()>,
    },
    Stopped,
}

struct Shared<H> {
    handler: Arc<H>,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
}

/// Generic framed TCP server
pub struct ConnectionServer<H: ConnectionHandler> {
    shared: Arc<Shared<H>>,
    local_addr: SocketAddr,
    state: Mutex<RunState>,
}

impl<H: ConnectionHandler> ConnectionServer<H> {
    /// Bind the listening socket
    ///
    /// Bind failure is the one fatal server error and is returned directly.
    pub async fn bind(
        addr: impl ToSocketAddrs + std::fmt::Display,
        handler: Arc<H>,
    ) -> ServerResult<Self> {
        let display_addr = addr.to_string();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: display_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            shared: Arc::new(Shared {
                handler,
                connections: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            local_addr,
            state: Mutex::new(RunState::Idle(listener)),
        })
    }

    /// Start accepting connections
    ///
    /// Returns false when the server is already running or has been stopped.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut state = self.state.lock();
        let listener = match std::mem::replace(&mut *state, RunState::Stopped) {
            RunState::Idle(listener) => listener,
            other => {
                *state = other;
                return false;
            }
        };

        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            shutdown.clone(),
        ));

        *state = RunState::Running {
            shutdown,
            accept_task,
        };

        tracing::info!(addr = %self.local_addr, "Connection server listening");
        true
    }

    /// Stop accepting and cancel every live connection
    ///
    /// Idempotent. Once this returns the accept loop has exited, so no further
    /// `on_open` is issued.
    pub async fn stop(&self) {
        let running = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, RunState::Stopped) {
                RunState::Running {
                    shutdown,
                    accept_task,
                } => Some((shutdown, accept_task)),
                RunState::Idle(_) | RunState::Stopped => None,
            }
        };

        let Some((shutdown, accept_task)) = running else {
            return;
        };

        shutdown.cancel();
        if let Err(e) = accept_task.await {
            if e.is_panic() {
                tracing::error!(addr = %self.local_addr, "Accept loop panicked: {e:?}");
            }
        }

        let live: Vec<Arc<Connection>> = self.shared.connections.lock().values().cloned().collect();
        for conn in &live {
            conn.close();
        }

        tracing::info!(
            addr = %self.local_addr,
            cancelled = live.len(),
            "Connection server stopped"
        );
    }

    /// True between `start` and `stop`
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), RunState::Running { .. })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections whose read loop is still running
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Look up a live connection by id
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.shared.connections.lock().get(&id).cloned()
    }

    /// The handler shared by every connection
    pub fn handler(&self) -> &Arc<H> {
        &self.shared.handler
    }
}

async fn accept_loop<H: ConnectionHandler>(
    listener: TcpListener,
    shared: Arc<Shared<H>>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = listener.accept() => res,
        };

        match accepted {
            Ok((socket, peer)) => {
                if shutdown.is_cancelled() {
                    break;
                }
                open_connection(&shared, socket, peer, &shutdown);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    // Dropping the listener closes the socket.
    drop(listener);
    tracing::debug!("Accept loop exited");
}

fn open_connection<H: ConnectionHandler>(
    shared: &Arc<Shared<H>>,
    socket: TcpStream,
    peer: SocketAddr,
    shutdown: &CancellationToken,
) {
    if let Err(e) = socket.set_nodelay(true) {
        tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let id = ConnectionId(shared.next_id.fetch_add(1, Ordering::Relaxed));
    let (read_half, write_half) = socket.into_split();
    let conn = Arc::new(Connection::new(
        id,
        peer,
        write_half,
        shutdown.child_token(),
    ));

    shared.connections.lock().insert(id, Arc::clone(&conn));
    tracing::info!(connection_id = %id, peer = %peer, "Accepted connection");

    shared.handler.on_open(&conn);

    let frames = FramedRead::new(read_half, Utf8FrameCodec);
    tokio::spawn(read_loop(Arc::clone(shared), conn, frames));
}

/// Removes a connection from the live registry when dropped
///
/// Also runs if a hook panics, so the registry never keeps a dead entry.
struct RegistryGuard<'a, H: ConnectionHandler> {
    shared: &'a Shared<H>,
    conn: &'a Arc<Connection>,
}

impl<H: ConnectionHandler> Drop for RegistryGuard<'_, H> {
    fn drop(&mut self) {
        self.conn.mark_dead();
        self.shared.connections.lock().remove(&self.conn.id());
    }
}

async fn read_loop<H: ConnectionHandler>(
    shared: Arc<Shared<H>>,
    conn: Arc<Connection>,
    mut frames: FramedRead<tokio::net::tcp::OwnedReadHalf, Utf8FrameCodec>,
) {
    let guard = RegistryGuard {
        shared: &shared,
        conn: &conn,
    };
    let cancel = conn.cancel_token().clone();

    let remote = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break false,
            next = frames.next() => match next {
                Some(Ok(Frame::Text(message))) => shared.handler.on_message(&conn, message),
                Some(Ok(Frame::Malformed(error))) => shared.handler.on_malformed(&conn, error),
                Some(Err(e)) => {
                    let remote = is_remote_disconnect(&e);
                    if remote {
                        tracing::debug!(connection_id = %conn.id(), error = %e, "Connection closed by peer");
                    } else {
                        tracing::warn!(connection_id = %conn.id(), error = %e, "Connection read failed");
                    }
                    break remote;
                }
                None => break true,
            }
        }
    };

    // Retire from the registry and notify in the same step.
    drop(guard);
    shared.handler.on_close(&conn, remote);

    drop(frames);
    conn.release().await;

    tracing::info!(
        connection_id = %conn.id(),
        peer = %conn.peer(),
        remote,
        "Connection closed"
    );
}

/// Errors that mean the peer went away rather than a local failure
fn is_remote_disconnect(e: &ServerError) -> bool {
    match e {
        ServerError::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::BrokenPipe
        ),
        ServerError::TruncatedFrame(_) => true,
        _ => false,
    }
}
