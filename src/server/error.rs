//! Connection server error types

use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised by the connection server and its framing codec
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listening socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Socket I/O failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Outgoing message does not fit the 2-byte length prefix
    #[error("Frame too long: {0} bytes (max 65535)")]
    FrameTooLong(usize),

    /// The stream ended part way through a frame
    #[error("Stream ended inside a frame with {0} bytes unread")]
    TruncatedFrame(usize),

    /// The connection has already been closed
    #[error("Connection {id} to {peer} is closed")]
    ConnectionClosed { id: u64, peer: SocketAddr },
}

/// Result type alias for server operations
pub type ServerResult<T> = Result<T, ServerError>;
