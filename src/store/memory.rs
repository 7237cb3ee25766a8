//! In-process store
//!
//! Keeps every inserted record in a vector. Writes and connects can be made to
//! fail on demand, which is how outages are simulated in tests.

use super::{BackingStore, StoreError, StoreResult};
use crate::record::GpsRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<GpsRecord>>,
    connected: AtomicBool,
    fail_writes: AtomicBool,
    refuse_connect: AtomicBool,
    batches: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far
    pub fn records(&self) -> Vec<GpsRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Number of successful `insert_many` calls
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Make subsequent writes fail with `Unavailable`
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent connects fail with `Unavailable`
    pub fn set_refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::Relaxed);
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> StoreResult<()> {
        if self.refuse_connect.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn insert_many(&self, records: &[GpsRecord]) -> StoreResult<usize> {
        if !self.is_connected() {
            return Err(StoreError::NotConnected);
        }
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("write rejected".into()));
        }

        self.records.lock().extend_from_slice(records);
        self.batches.fetch_add(1, Ordering::Relaxed);
        Ok(records.len())
    }
}
