//! Live Peer Hub
//!
//! Tracks connected web peers and the set of identified devices, and fans
//! dispatch events out to every peer as [`ServerMessage`]s.
//!
//! Each peer owns an unbounded queue drained by its socket task, so a
//! broadcast never waits on a slow browser.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::messages::ServerMessage;
use super::LiveError;
use crate::dispatch::{GpsListener, ListenerError};
use crate::record::{DeviceId, GpsRecord};

/// Unique identifier for a web peer
pub type PeerId = String;

/// Configuration for the live hub
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Maximum number of concurrent web peers
    pub max_peers: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self { max_peers: 1000 }
    }
}

pub struct LiveHub {
    peers: RwLock<HashMap<PeerId, mpsc::UnboundedSender<ServerMessage>>>,
    devices: RwLock<BTreeSet<DeviceId>>,
    config: LiveConfig,
}

impl LiveHub {
    pub fn new(config: LiveConfig) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            devices: RwLock::new(BTreeSet::new()),
            config,
        }
    }

    /// Register a web peer
    ///
    /// The peer's queue receives the `setup` message first, then one
    /// `update` per record returned by `backlog`, then every later broadcast.
    ///
    /// `backlog` runs while the peer map is write-locked, so a record that
    /// misses the snapshot is broadcast only after the peer has joined. A
    /// record appended just before the snapshot may reach the peer twice.
    pub fn register<F>(
        &self,
        sender: mpsc::UnboundedSender<ServerMessage>,
        backlog: F,
    ) -> Result<PeerId, LiveError>
    where
        F: FnOnce() -> Vec<GpsRecord>,
    {
        // Held until the peer is in the map so no presence change slips between
        // the setup snapshot and the first broadcast.
        let devices = self.devices.read();
        let mut peers = self.peers.write();
        if peers.len() >= self.config.max_peers {
            return Err(LiveError::TooManyPeers);
        }

        let setup = ServerMessage::Setup {
            devices: devices.iter().cloned().collect(),
        };
        if sender.send(setup).is_err() {
            return Err(LiveError::PeerClosed);
        }
        for record in backlog() {
            if sender.send(ServerMessage::Update(record)).is_err() {
                return Err(LiveError::PeerClosed);
            }
        }

        let id = Uuid::new_v4().to_string();
        peers.insert(id.clone(), sender);

        tracing::info!(peer_id = %id, devices = devices.len(), "Web peer connected");
        Ok(id)
    }

    pub fn unregister(&self, id: &str) {
        if self.peers.write().remove(id).is_some() {
            tracing::info!(peer_id = %id, "Web peer disconnected");
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Identified devices, sorted
    pub fn devices(&self) -> Vec<DeviceId> {
        self.devices.read().iter().cloned().collect()
    }

    /// Send a message to every peer, pruning peers whose queue is gone
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        let mut closed = Vec::new();
        let mut sent = 0;
        {
            let peers = self.peers.read();
            for (id, sender) in peers.iter() {
                if sender.send(message.clone()).is_ok() {
                    sent += 1;
                } else {
                    closed.push(id.clone());
                }
            }
        }

        if !closed.is_empty() {
            let mut peers = self.peers.write();
            for id in &closed {
                peers.remove(id);
            }
            tracing::debug!(pruned = closed.len(), "Pruned closed web peers");
        }

        sent
    }
}

impl Default for LiveHub {
    fn default() -> Self {
        Self::new(LiveConfig::default())
    }
}

impl GpsListener for LiveHub {
    fn name(&self) -> &str {
        "live-hub"
    }

    fn on_update(&self, record: &GpsRecord) -> Result<(), ListenerError> {
        self.broadcast(&ServerMessage::Update(record.clone()));
        Ok(())
    }

    fn on_connect(&self, device: &DeviceId) -> Result<(), ListenerError> {
        let mut devices = self.devices.write();
        devices.insert(device.clone());
        self.broadcast(&ServerMessage::Connected { id: device.clone() });
        Ok(())
    }

    fn on_disconnect(&self, device: &DeviceId) -> Result<(), ListenerError> {
        let mut devices = self.devices.write();
        devices.remove(device);
        self.broadcast(&ServerMessage::Disconnected { id: device.clone() });
        Ok(())
    }
}
