//! Canonical data types shared across the ingestion pipeline.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Maximum tolerated clock skew for explicit measurement timestamps, in
/// seconds. Device clocks drift; anything further ahead of server time than
/// this is rejected.
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// A geographic position reported alongside a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Longitude in degrees, `-180.0..=180.0` (`+180` normalized to `-180`)
    pub lng: f64,
    /// Latitude in degrees, `-90.0..=90.0`
    pub lat: f64,
    /// Height above ground in meters, if the device reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

/// A single normalized sensor reading. Every decoder produces these,
/// regardless of the wire format the device used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Local sensor the reading belongs to
    pub sensor_id: String,
    /// Measured value; always finite
    pub value: f64,
    /// When the reading was taken (decode-time now when the payload
    /// carried no timestamp)
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// Where the reading was taken, if the payload carried a location
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Measurement {
    /// Create a measurement timestamped with the current time and no
    /// location.
    pub fn now(sensor_id: impl Into<String>, value: f64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            value,
            created_at: Utc::now(),
            location: None,
        }
    }
}

/// A sensor attached to a device. Read-only lookup target for the decoders
/// and the vendor alias matcher; never mutated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Sensor {
    /// Sensor identifier (hex string on the wire for binary payloads)
    pub id: String,
    /// Human-readable phenomenon title, e.g. "Temperatur"
    pub title: String,
    /// Unit of measurement, e.g. "°C"
    pub unit: String,
    /// Hardware type, e.g. "BME280"; drives vendor alias matching
    #[serde(rename = "sensorType")]
    pub sensor_type: Option<String>,
}

/// A device registered with the platform. Owned by the storage layer; the
/// ingestion pipeline only reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    /// Device identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Whether the device enforces its access token on ingestion
    pub use_auth: bool,
    /// Access token compared verbatim against the Authorization header
    pub api_key: Option<String>,
    /// Sensors in their registered order
    pub sensors: Vec<Sensor>,
}

impl Device {
    /// Look up a sensor of this device by id.
    pub fn sensor(&self, sensor_id: &str) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.id == sensor_id)
    }
}

/// Whether an explicit timestamp is within the tolerated clock skew of
/// server time. Timestamps in the past are always acceptable; device
/// batches are routinely uploaded long after the fact.
pub fn within_clock_skew(created_at: DateTime<Utc>) -> bool {
    created_at - Utc::now() <= Duration::seconds(MAX_CLOCK_SKEW_SECS)
}
