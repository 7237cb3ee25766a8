//! SQLite store
//!
//! One `locations` row per record. Each batch is written in a single
//! transaction on the blocking pool, so a failed flush leaves no partial rows.

use super::{BackingStore, StoreError, StoreResult};
use crate::record::{DeviceId, GpsRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS locations (
        id        TEXT,
        ip        TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        lat       REAL NOT NULL,
        lon       REAL NOT NULL,
        altitude  REAL NOT NULL,
        speed     REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_locations_device_time ON locations(id, timestamp);
";

#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    Memory,
}

pub struct SqliteStore {
    target: Target,
    conn: Arc<Mutex<Option<Connection>>>,
    connected: AtomicBool,
}

impl SqliteStore {
    /// Store backed by a database file, created on connect if missing
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_target(Target::File(path.as_ref().to_path_buf()))
    }

    /// Store backed by a private in-memory database
    ///
    /// Rows live only as long as the connection.
    pub fn in_memory() -> Self {
        Self::with_target(Target::Memory)
    }

    fn with_target(target: Target) -> Self {
        Self {
            target,
            conn: Arc::new(Mutex::new(None)),
            connected: AtomicBool::new(false),
        }
    }

    /// Database file, if not in-memory
    pub fn path(&self) -> Option<&Path> {
        match &self.target {
            Target::File(path) => Some(path),
            Target::Memory => None,
        }
    }

    /// Total number of stored rows
    pub async fn count(&self) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM locations", [], |row| row.get(0))?;
            Ok(n as u64)
        })
        .await
    }

    /// Most recent records of one device, newest first
    pub async fn recent(&self, device: &DeviceId, limit: usize) -> StoreResult<Vec<GpsRecord>> {
        let device = device.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, ip, timestamp, lat, lon, altitude, speed
                 FROM locations WHERE id = ?1
                 ORDER BY timestamp DESC, rowid DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![device.as_str(), limit as i64], |row| {
                let id: Option<String> = row.get(0)?;
                let ip: String = row.get(1)?;
                Ok((
                    id,
                    ip,
                    row.get::<_, i64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (id, ip, timestamp, lat, lon, altitude, speed) = row?;
                let Ok(endpoint) = ip.parse::<SocketAddr>() else {
                    tracing::warn!(ip = %ip, "Skipping row with unparseable endpoint");
                    continue;
                };
                records.push(GpsRecord::new(
                    id.and_then(DeviceId::new),
                    endpoint,
                    timestamp,
                    lat,
                    lon,
                    altitude,
                    speed,
                ));
            }
            Ok(records)
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            let conn = guard.as_mut().ok_or(StoreError::NotConnected)?;
            f(conn)
        })
        .await?
    }

    fn open(target: &Target) -> StoreResult<Connection> {
        let conn = match target {
            Target::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let conn = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_WRITE
                        | OpenFlags::SQLITE_OPEN_CREATE
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.execute_batch(
                    "
                    PRAGMA journal_mode = WAL;
                    PRAGMA synchronous = NORMAL;
                    ",
                )?;
                conn
            }
            Target::Memory => Connection::open_in_memory()?,
        };

        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }
}

#[async_trait]
impl BackingStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn connect(&self) -> StoreResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let target = self.target.clone();
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let opened = Self::open(&target)?;
            *conn.lock() = Some(opened);
            Ok(())
        })
        .await??;

        self.connected.store(true, Ordering::Release);
        tracing::info!(database = ?self.target, "SQLite store connected");
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }

        let conn = Arc::clone(&self.conn);
        let closed = tokio::task::spawn_blocking(move || conn.lock().take()).await;
        if let Ok(Some(conn)) = closed {
            if let Err((_, e)) = conn.close() {
                tracing::warn!(error = %e, "Error closing SQLite store");
            }
        }
        tracing::info!(database = ?self.target, "SQLite store disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn insert_many(&self, records: &[GpsRecord]) -> StoreResult<usize> {
        if !self.is_connected() {
            return Err(StoreError::NotConnected);
        }
        if records.is_empty() {
            return Ok(0);
        }

        let batch = records.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO locations (id, ip, timestamp, lat, lon, altitude, speed)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for record in &batch {
                    stmt.execute(params![
                        record.device_id().map(DeviceId::as_str),
                        record.endpoint().to_string(),
                        record.sampled_at(),
                        record.lat(),
                        record.lon(),
                        record.altitude(),
                        record.speed(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(batch.len())
        })
        .await
    }
}
