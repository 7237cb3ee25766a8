//! Dispatch Hub
//!
//! Publish/subscribe between the device sessions that produce events and the
//! consumers that act on them (batched persistence, live broadcast, ...).
//! Producers only know the hub; consumers register themselves as
//! [`GpsListener`]s and can come and go without producers noticing.
//!
//! ## Semantics
//!
//! - Listeners are kept in an ordered list; a listener appears at most once.
//! - `dispatch` notifies every registered listener in registration order, on
//!   the calling task, before returning.
//! - The registry lock is only held to copy the listener list, never while a
//!   listener runs, so `register`/`unregister` are safe during a dispatch.
//! - A listener that returns an error or panics is logged and skipped; the
//!   remaining listeners are still notified.

use crate::record::{DeviceId, GpsRecord};
use parking_lot::RwLock;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Consumer of device events
///
/// Handlers run synchronously on the dispatching connection's task, so they
/// must not block on I/O. Connect and disconnect default to no-ops.
pub trait GpsListener: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// A device reported a new location
    fn on_update(&self, record: &GpsRecord) -> Result<(), ListenerError>;

    /// A device identified itself
    fn on_connect(&self, _device: &DeviceId) -> Result<(), ListenerError> {
        Ok(())
    }

    /// An identified device's session ended
    fn on_disconnect(&self, _device: &DeviceId) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Events carried by the hub
///
/// `Disconnected` always names a device: sessions that never identified
/// themselves have nothing to announce.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    Update(GpsRecord),
    Connected(DeviceId),
    Disconnected(DeviceId),
}

impl DispatchEvent {
    fn kind(&self) -> &'static str {
        match self {
            DispatchEvent::Update(_) => "update",
            DispatchEvent::Connected(_) => "connected",
            DispatchEvent::Disconnected(_) => "disconnected",
        }
    }
}

/// Handle returned by [`DispatchHub::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Failure reported by a single listener
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Listener failed: {0}")]
    Failed(String),

    #[error("Listener panicked: {0}")]
    Panicked(String),
}

/// Outcome of one `dispatch` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Listeners that handled the event
    pub delivered: usize,
    /// Listeners that failed or panicked
    pub failed: usize,
}

/// Hub counters
#[derive(Debug, Clone, Copy, Default)]
pub struct HubStats {
    pub listeners: usize,
    pub events_dispatched: u64,
    pub listener_faults: u64,
}

struct Registered {
    id: ListenerId,
    listener: Arc<dyn GpsListener>,
}

/// Ordered listener registry with fault-isolated fan-out
pub struct DispatchHub {
    listeners: RwLock<Vec<Registered>>,
    next_id: AtomicU64,
    events_dispatched: AtomicU64,
    listener_faults: AtomicU64,
}

impl Default for DispatchHub {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchHub {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            events_dispatched: AtomicU64::new(0),
            listener_faults: AtomicU64::new(0),
        }
    }

    /// Add a listener at the end of the notification order
    ///
    /// Registering the same listener twice returns the original id.
    pub fn register(&self, listener: Arc<dyn GpsListener>) -> ListenerId {
        let mut listeners = self.listeners.write();

        if let Some(existing) = listeners
            .iter()
            .find(|r| same_listener(&r.listener, &listener))
        {
            return existing.id;
        }

        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(listener = %listener.name(), listener_id = %id, "Registered listener");
        listeners.push(Registered { id, listener });
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        let removed = listeners.len() != before;
        if removed {
            tracing::debug!(listener_id = %id, "Unregistered listener");
        }
        removed
    }

    /// Remove a listener by handle rather than id
    pub fn unregister_listener(&self, listener: &Arc<dyn GpsListener>) -> bool {
        let id = self
            .listeners
            .read()
            .iter()
            .find(|r| same_listener(&r.listener, listener))
            .map(|r| r.id);
        id.map_or(false, |id| self.unregister(id))
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Notify every registered listener of `event`, in registration order
    pub fn dispatch(&self, event: &DispatchEvent) -> DispatchReport {
        let snapshot: Vec<Arc<dyn GpsListener>> = self
            .listeners
            .read()
            .iter()
            .map(|r| Arc::clone(&r.listener))
            .collect();

        self.events_dispatched.fetch_add(1, Ordering::Relaxed);

        let mut report = DispatchReport::default();
        for listener in &snapshot {
            match deliver(listener.as_ref(), event) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    self.listener_faults.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        listener = %listener.name(),
                        event = event.kind(),
                        error = %e,
                        "Listener fault during dispatch"
                    );
                }
            }
        }

        report
    }

    pub fn dispatch_update(&self, record: GpsRecord) -> DispatchReport {
        self.dispatch(&DispatchEvent::Update(record))
    }

    pub fn dispatch_connect(&self, device: DeviceId) -> DispatchReport {
        self.dispatch(&DispatchEvent::Connected(device))
    }

    pub fn dispatch_disconnect(&self, device: DeviceId) -> DispatchReport {
        self.dispatch(&DispatchEvent::Disconnected(device))
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            listeners: self.listener_count(),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            listener_faults: self.listener_faults.load(Ordering::Relaxed),
        }
    }
}

fn deliver(listener: &dyn GpsListener, event: &DispatchEvent) -> Result<(), ListenerError> {
    let outcome = catch_unwind(AssertUnwindSafe(|| match event {
        DispatchEvent::Update(record) => listener.on_update(record),
        DispatchEvent::Connected(device) => listener.on_connect(device),
        DispatchEvent::Disconnected(device) => listener.on_disconnect(device),
    }));

    match outcome {
        Ok(result) => result,
        Err(payload) => Err(ListenerError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Identity comparison on the data pointer only
fn same_listener(a: &Arc<dyn GpsListener>, b: &Arc<dyn GpsListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
