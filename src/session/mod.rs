//! Device Sessions
//!
//! - **DeviceSession**: per-connection state; remembers the device identity
//!   and turns raw frames into hub events
//! - **DeviceServer**: the [`ConnectionHandler`] that creates, feeds and
//!   retires one session per connection
//!
//! A location update that arrives before the device identified itself is still
//! dispatched, with no device id on the record. A disconnect is only
//! dispatched for sessions that had identified themselves.

mod protocol;

pub use protocol::{DeviceMessage, ProtocolError, UpdatePayload};

use crate::dispatch::DispatchHub;
use crate::record::{DeviceId, GpsRecord};
use crate::server::{Connection, ConnectionHandler, ConnectionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-connection device state
pub struct DeviceSession {
    endpoint: SocketAddr,
    device_id: Option<DeviceId>,
    hub: Arc<DispatchHub>,
    updates: u64,
}

impl DeviceSession {
    pub fn new(endpoint: SocketAddr, hub: Arc<DispatchHub>) -> Self {
        Self {
            endpoint,
            device_id: None,
            hub,
            updates: 0,
        }
    }

    /// Identity announced by the device, if any
    pub fn device_id(&self) -> Option<&DeviceId> {
        self.device_id.as_ref()
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Number of location updates forwarded so far
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Parse one frame and dispatch the resulting event
    ///
    /// A malformed frame is returned as an error and changes nothing; the
    /// session stays usable.
    pub fn handle_message(&mut self, text: &str) -> Result<(), ProtocolError> {
        match DeviceMessage::parse(text)? {
            DeviceMessage::Metadata { device_id } => self.identify(device_id),
            DeviceMessage::Update(payload) => {
                let record = GpsRecord::new(
                    self.device_id.clone(),
                    self.endpoint,
                    payload.timestamp,
                    payload.lat,
                    payload.lon,
                    payload.altitude,
                    payload.speed,
                );
                self.updates += 1;
                self.hub.dispatch_update(record);
            }
        }
        Ok(())
    }

    fn identify(&mut self, device_id: DeviceId) {
        match self.device_id.take() {
            Some(current) if current == device_id => {
                tracing::debug!(device_id = %device_id, "Device re-sent its identity");
                self.device_id = Some(current);
                return;
            }
            Some(previous) => {
                tracing::info!(
                    previous = %previous,
                    device_id = %device_id,
                    "Device changed identity"
                );
                self.hub.dispatch_disconnect(previous);
            }
            None => {}
        }

        tracing::info!(device_id = %device_id, endpoint = %self.endpoint, "Device identified");
        self.device_id = Some(device_id.clone());
        self.hub.dispatch_connect(device_id);
    }

    /// End the session, announcing the disconnect if the device was known
    ///
    /// The identity is cleared, so a second call announces nothing.
    pub fn close(&mut self) {
        if let Some(device_id) = self.device_id.take() {
            self.hub.dispatch_disconnect(device_id);
        }
    }
}

/// Session counters
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceServerStats {
    pub active_sessions: usize,
    pub identified_sessions: usize,
    pub malformed_messages: u64,
}

/// Connection handler for device clients
pub struct DeviceServer {
    hub: Arc<DispatchHub>,
    sessions: Mutex<HashMap<ConnectionId, Arc<Mutex<DeviceSession>>>>,
    malformed: AtomicU64,
}

impl DeviceServer {
    pub fn new(hub: Arc<DispatchHub>) -> Self {
        Self {
            hub,
            sessions: Mutex::new(HashMap::new()),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn hub(&self) -> &Arc<DispatchHub> {
        &self.hub
    }

    /// Device identity of a live connection
    pub fn device_id(&self, conn: ConnectionId) -> Option<DeviceId> {
        let session = self.session(conn)?;
        let device_id = session.lock().device_id().cloned();
        device_id
    }

    pub fn stats(&self) -> DeviceServerStats {
        let sessions: Vec<_> = self.sessions.lock().values().cloned().collect();
        let identified = sessions
            .iter()
            .filter(|s| s.lock().device_id().is_some())
            .count();

        DeviceServerStats {
            active_sessions: sessions.len(),
            identified_sessions: identified,
            malformed_messages: self.malformed.load(Ordering::Relaxed),
        }
    }

    fn session(&self, conn: ConnectionId) -> Option<Arc<Mutex<DeviceSession>>> {
        self.sessions.lock().get(&conn).cloned()
    }
}

impl ConnectionHandler for DeviceServer {
    fn on_open(&self, conn: &Arc<Connection>) {
        let session = DeviceSession::new(conn.peer(), Arc::clone(&self.hub));
        self.sessions
            .lock()
            .insert(conn.id(), Arc::new(Mutex::new(session)));
    }

    fn on_message(&self, conn: &Arc<Connection>, message: String) {
        let Some(session) = self.session(conn.id()) else {
            tracing::warn!(connection_id = %conn.id(), "Message for unknown session");
            return;
        };

        // Only this connection's read loop ever takes this lock.
        let result = session.lock().handle_message(&message);
        if let Err(e) = result {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                connection_id = %conn.id(),
                peer = %conn.peer(),
                error = %e,
                "Ignoring malformed device message"
            );
        }
    }

    fn on_close(&self, conn: &Arc<Connection>, remote: bool) {
        let Some(session) = self.sessions.lock().remove(&conn.id()) else {
            return;
        };

        let mut session = session.lock();
        tracing::debug!(
            connection_id = %conn.id(),
            device_id = ?session.device_id(),
            updates = session.updates(),
            remote,
            "Device session ended"
        );
        session.close();
    }
}
