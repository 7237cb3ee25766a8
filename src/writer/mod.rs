//! Batched Writer
//!
//! Buffers every location update it hears from the dispatch hub and writes the
//! buffer to the backing store in one batch per flush.
//!
//! - Appends never wait on the store; they only touch the in-memory buffer
//! - A flush swaps the buffer for an empty one, so every record lands in
//!   exactly one batch
//! - A batch the store rejects goes back to the front of the buffer and is
//!   retried on the next flush
//! - While the store is disconnected the buffer just keeps growing

use crate::dispatch::{GpsListener, ListenerError};
use crate::record::GpsRecord;
use crate::store::{BackingStore, StoreResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Writer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Time between background flushes
    #[serde(with = "secs")]
    pub flush_interval: Duration,
}

/// Shortest background flush period; shorter configured periods are raised to it
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// What a single flush did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered
    Empty,
    /// Store is not connected; the buffer was left alone
    Disconnected { pending: usize },
    /// This many records were written
    Written(usize),
}

/// Writer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub pending: usize,
    pub appended: u64,
    pub flushed: u64,
    pub flush_cycles: u64,
    pub failed_flushes: u64,
}

pub struct BatchedWriter {
    config: WriterConfig,
    store: Arc<dyn BackingStore>,
    pending: Mutex<Vec<GpsRecord>>,
    // Serializes flushes so a failed batch is restored ahead of newer records.
    flushing: tokio::sync::Mutex<()>,
    appended: AtomicU64,
    flushed: AtomicU64,
    flush_cycles: AtomicU64,
    failed_flushes: AtomicU64,
}

impl BatchedWriter {
    pub fn new(store: Arc<dyn BackingStore>, mut config: WriterConfig) -> Self {
        config.flush_interval = config.flush_interval.max(MIN_FLUSH_INTERVAL);
        Self {
            config,
            store,
            pending: Mutex::new(Vec::new()),
            flushing: tokio::sync::Mutex::new(()),
            appended: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            flush_cycles: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Buffer one record for the next flush
    pub fn append(&self, record: GpsRecord) {
        self.pending.lock().push(record);
        self.appended.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy of the records not yet written
    ///
    /// Later appends and flushes do not affect the returned vector.
    pub fn backlog(&self) -> Vec<GpsRecord> {
        self.pending.lock().clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub async fn connect(&self) -> StoreResult<()> {
        self.store.connect().await?;
        tracing::info!(store = self.store.name(), "Writer connected to store");
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.store.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    /// Write everything buffered so far as one batch
    pub async fn flush(&self) -> StoreResult<FlushOutcome> {
        let _flushing = self.flushing.lock().await;

        if !self.store.is_connected() {
            let pending = self.pending_len();
            if pending > 0 {
                tracing::warn!(
                    store = self.store.name(),
                    pending,
                    "Store not connected, holding buffered records"
                );
            }
            return Ok(FlushOutcome::Disconnected { pending });
        }

        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        match self.store.insert_many(&batch).await {
            Ok(written) => {
                self.flushed.fetch_add(written as u64, Ordering::Relaxed);
                self.flush_cycles.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(store = self.store.name(), written, "Flushed batch");
                Ok(FlushOutcome::Written(written))
            }
            Err(e) => {
                self.failed_flushes.fetch_add(1, Ordering::Relaxed);
                let restored = batch.len();
                {
                    let mut pending = self.pending.lock();
                    let newer = std::mem::replace(&mut *pending, batch);
                    pending.extend(newer);
                }
                tracing::warn!(
                    store = self.store.name(),
                    restored,
                    error = %e,
                    "Flush failed, batch kept for retry"
                );
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            pending: self.pending_len(),
            appended: self.appended.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            flush_cycles: self.flush_cycles.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
        }
    }

    /// Flush on a fixed period until `shutdown` fires, then flush once more
    ///
    /// Each tick first retries the store connection if it is down.
    pub fn start_background_flush(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let writer = Arc::clone(self);
        let period = writer.config.flush_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if !writer.is_connected() {
                    if let Err(e) = writer.connect().await {
                        tracing::debug!(error = %e, "Store reconnect failed");
                    }
                }

                if let Err(e) = writer.flush().await {
                    tracing::error!("Background flush failed: {}", e);
                }
            }

            if let Err(e) = writer.flush().await {
                tracing::error!("Final flush failed: {}", e);
            }
        })
    }
}

impl GpsListener for BatchedWriter {
    fn name(&self) -> &str {
        "batched-writer"
    }

    fn on_update(&self, record: &GpsRecord) -> Result<(), ListenerError> {
        self.append(record.clone());
        Ok(())
    }
}
