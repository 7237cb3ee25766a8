//! # Waypoint
//!
//! GPS location relay. Devices stream location samples over a framed TCP
//! protocol; every sample is fanned out to live web viewers and written to a
//! backing store in timed batches.
//!
//! ## Modules
//!
//! - [`server`]: Generic framed TCP server with lifecycle hooks
//! - [`session`]: Device protocol and per-connection sessions
//! - [`dispatch`]: Publish/subscribe hub for location events
//! - [`writer`]: Timed batch writer feeding the store
//! - [`store`]: SQLite and in-memory backing stores
//! - [`live`]: WebSocket broadcast to web viewers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use waypoint::{
//!     open_store, BatchedWriter, ConnectionServer, DeviceServer, DispatchHub, WriterConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = open_store("sqlite://waypoint.db")?;
//!     let writer = Arc::new(BatchedWriter::new(store, WriterConfig::default()));
//!     writer.connect().await?;
//!
//!     let hub = Arc::new(DispatchHub::new());
//!     hub.register(writer.clone());
//!
//!     let server = ConnectionServer::bind("0.0.0.0:7000", Arc::new(DeviceServer::new(hub))).await?;
//!     server.start();
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     writer.flush().await?;
//!     writer.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod live;
pub mod record;
pub mod server;
pub mod session;
pub mod store;
pub mod writer;

// Re-export top-level types for convenience
pub use record::{DeviceId, GpsRecord};

pub use server::{
    Connection, ConnectionHandler, ConnectionId, ConnectionServer, ServerError, ServerResult,
};

pub use dispatch::{
    DispatchEvent, DispatchHub, DispatchReport, GpsListener, HubStats, ListenerError, ListenerId,
};

pub use session::{DeviceMessage, DeviceServer, DeviceSession, ProtocolError};

pub use writer::{BatchedWriter, FlushOutcome, WriterConfig, WriterStats};

pub use store::{open_store, BackingStore, MemoryStore, SqliteStore, StoreError, StoreResult};

pub use live::{LiveConfig, LiveError, LiveHub, LiveState, ServerMessage};

pub use config::{Config, ConfigError, LoggingConfig};
