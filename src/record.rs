//! Location record types
//!
//! - `DeviceId`: identity a device announces in its metadata message
//! - `GpsRecord`: one immutable location sample from a device
//!
//! Records are plain values. Once built they are only ever read, so they can
//! be handed to any number of listeners and threads without locking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Identity a device announces for its session (usually its MAC address)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Build a device id, rejecting blank identifiers
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single GPS sample reported by a device
///
/// Serializes with the short keys shared by the store rows and the live
/// broadcast messages: `id`, `ip`, `timestamp`, `lat`, `lon`, `altitude`,
/// `speed`. A record sent before the device identified itself carries
/// `"id": null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsRecord {
    #[serde(rename = "id")]
    device_id: Option<DeviceId>,
    #[serde(rename = "ip")]
    endpoint: SocketAddr,
    #[serde(rename = "timestamp")]
    sampled_at: i64,
    lat: f64,
    lon: f64,
    altitude: f64,
    speed: f64,
}

impl GpsRecord {
    pub fn new(
        device_id: Option<DeviceId>,
        endpoint: SocketAddr,
        sampled_at: i64,
        lat: f64,
        lon: f64,
        altitude: f64,
        speed: f64,
    ) -> Self {
        Self {
            device_id,
            endpoint,
            sampled_at,
            lat,
            lon,
            altitude,
            speed,
        }
    }

    /// Device that produced the sample, if it had identified itself
    pub fn device_id(&self) -> Option<&DeviceId> {
        self.device_id.as_ref()
    }

    /// Remote address the sample arrived from
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Sample time in seconds since the Unix epoch
    pub fn sampled_at(&self) -> i64 {
        self.sampled_at
    }

    /// Sample time as a UTC datetime, if it is representable
    pub fn sampled_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.sampled_at, 0)
    }

    /// Latitude in degrees
    pub fn lat(&self) -> f64 {
        self.lat
    }

    /// Longitude in degrees
    pub fn lon(&self) -> f64 {
        self.lon
    }

    /// Altitude in meters
    pub fn altitude(&self) -> f64 {
        self.altitude
    }

    /// Speed in meters per second
    pub fn speed(&self) -> f64 {
        self.speed
    }
}

impl fmt::Display for GpsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.device_id.as_ref().map(DeviceId::as_str).unwrap_or("<unknown>");
        write!(
            f,
            "{} @ {} ({:.6}, {:.6}) alt={:.1}m speed={:.1}m/s t={}",
            id, self.endpoint, self.lat, self.lon, self.altitude, self.speed, self.sampled_at
        )
    }
}
