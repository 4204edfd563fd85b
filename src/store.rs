//! Storage seam for the ingestion pipeline.
//!
//! The orchestrator only sees the [`MeasurementStore`] trait: one device
//! lookup and one batched write per request. The write side owns location
//! reconciliation, which must hold even when measurements arrive
//! non-monotonically:
//!
//! - the device's *current* location is the one attached to the
//!   measurement with the greatest `created_at` ever stored, regardless of
//!   insertion order;
//! - a measurement without an explicit location is assigned the nearest
//!   preceding location from the history as of its own timestamp,
//!   evaluated once, at insertion time;
//! - a timestamp earlier than every known location stores no location at
//!   all.
//!
//! [`MemoryStore`] is the reference implementation of that contract; the
//! Postgres-backed store mirrors it with guarded SQL updates.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::models::{Device, Location, Measurement};

/// One entry of a device's explicit location history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationRecord {
    /// Timestamp of the measurement that carried this location
    pub recorded_at: DateTime<Utc>,
    pub location: Location,
}

/// A measurement as persisted, with its resolved location.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMeasurement {
    pub id: Uuid,
    pub sensor_id: String,
    pub value: f64,
    pub created_at: DateTime<Utc>,
    pub location: Option<Location>,
}

/// Device lookup and batched measurement persistence.
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Fetch a device with its sensors in registered order.
    async fn get_device(&self, device_id: &str) -> anyhow::Result<Option<Device>>;

    /// Persist a validated batch, applying location reconciliation per
    /// measurement.
    async fn save_measurements(
        &self,
        device: &Device,
        measurements: Vec<Measurement>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug)]
struct DeviceState {
    device: Device,
    /// Explicit location history keyed by measurement timestamp.
    locations: BTreeMap<DateTime<Utc>, Location>,
    /// History entry with the greatest timestamp ever stored.
    current_location: Option<LocationRecord>,
    measurements: Vec<StoredMeasurement>,
    /// Per-sensor pointer to the most recent measurement by `created_at`.
    last_measurements: HashMap<String, StoredMeasurement>,
}

/// In-memory store. Reference implementation of the reconciliation
/// contract and the test double for the orchestrator.
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<String, DeviceState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device. Replaces any previous registration under the
    /// same id.
    pub fn add_device(&self, device: Device) {
        self.devices.write().insert(
            device.id.clone(),
            DeviceState {
                device,
                locations: BTreeMap::new(),
                current_location: None,
                measurements: Vec::new(),
                last_measurements: HashMap::new(),
            },
        );
    }

    /// The device's current location, if it ever reported one.
    pub fn current_location(&self, device_id: &str) -> Option<LocationRecord> {
        self.devices
            .read()
            .get(device_id)
            .and_then(|state| state.current_location)
    }

    /// All measurements stored for a device, in insertion order.
    pub fn measurements(&self, device_id: &str) -> Vec<StoredMeasurement> {
        self.devices
            .read()
            .get(device_id)
            .map(|state| state.measurements.clone())
            .unwrap_or_default()
    }

    /// The most recent measurement of a sensor by `created_at`.
    pub fn last_measurement(&self, device_id: &str, sensor_id: &str) -> Option<StoredMeasurement> {
        self.devices
            .read()
            .get(device_id)
            .and_then(|state| state.last_measurements.get(sensor_id))
            .cloned()
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn get_device(&self, device_id: &str) -> anyhow::Result<Option<Device>> {
        Ok(self
            .devices
            .read()
            .get(device_id)
            .map(|state| state.device.clone()))
    }

    async fn save_measurements(
        &self,
        device: &Device,
        measurements: Vec<Measurement>,
    ) -> anyhow::Result<()> {
        let mut devices = self.devices.write();
        let state = devices
            .get_mut(&device.id)
            .ok_or_else(|| anyhow::anyhow!("unknown device {}", device.id))?;

        for measurement in measurements {
            let resolved = match measurement.location {
                Some(location) => {
                    state.locations.insert(measurement.created_at, location);

                    // Advance the current-location pointer only for a
                    // strictly newer timestamp; out-of-order inserts must
                    // not overwrite it.
                    let newer = state
                        .current_location
                        .map_or(true, |current| measurement.created_at > current.recorded_at);
                    if newer {
                        state.current_location = Some(LocationRecord {
                            recorded_at: measurement.created_at,
                            location,
                        });
                    }

                    Some(location)
                }
                // Nearest preceding explicit location as of the
                // measurement's own timestamp, with what is known right
                // now. Never revisited.
                None => state
                    .locations
                    .range(..=measurement.created_at)
                    .next_back()
                    .map(|(_, location)| *location),
            };

            let stored = StoredMeasurement {
                id: Uuid::new_v4(),
                sensor_id: measurement.sensor_id,
                value: measurement.value,
                created_at: measurement.created_at,
                location: resolved,
            };

            let newer = state
                .last_measurements
                .get(&stored.sensor_id)
                .map_or(true, |last| stored.created_at > last.created_at);
            if newer {
                state
                    .last_measurements
                    .insert(stored.sensor_id.clone(), stored.clone());
            }

            state.measurements.push(stored);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sensor;
    use chrono::Duration;

    fn create_test_device() -> Device {
        Device {
            id: "dev-1".to_string(),
            name: "Balcony".to_string(),
            use_auth: false,
            api_key: None,
            sensors: vec![Sensor {
                id: "s-1".to_string(),
                title: "Temperatur".to_string(),
                unit: "°C".to_string(),
                sensor_type: Some("BME280".to_string()),
            }],
        }
    }

    fn at(minutes_ago: i64) -> DateTime<Utc> {
        Utc::now() - Duration::minutes(minutes_ago)
    }

    fn measurement(ts: DateTime<Utc>, location: Option<Location>) -> Measurement {
        Measurement {
            sensor_id: "s-1".to_string(),
            value: 1.0,
            created_at: ts,
            location,
        }
    }

    fn loc(lng: f64, lat: f64) -> Location {
        Location {
            lng,
            lat,
            height: None,
        }
    }

    fn store_with_device() -> (MemoryStore, Device) {
        let store = MemoryStore::new();
        let device = create_test_device();
        store.add_device(device.clone());
        (store, device)
    }

    #[tokio::test]
    async fn test_latest_timestamp_wins_regardless_of_insert_order() {
        let (store, device) = store_with_device();
        let a = loc(7.0, 51.0);
        let b = loc(8.0, 52.0);
        let c = loc(9.0, 53.0);

        store
            .save_measurements(&device, vec![measurement(at(2), Some(a))])
            .await
            .unwrap();
        store
            .save_measurements(&device, vec![measurement(at(0), Some(b))])
            .await
            .unwrap();
        assert_eq!(store.current_location("dev-1").unwrap().location, b);

        // Retroactive insert with an earlier timestamp must not move the
        // pointer.
        store
            .save_measurements(&device, vec![measurement(at(1), Some(c))])
            .await
            .unwrap();
        assert_eq!(store.current_location("dev-1").unwrap().location, b);
    }

    #[tokio::test]
    async fn test_missing_location_infers_nearest_preceding() {
        let (store, device) = store_with_device();
        let a = loc(7.0, 51.0);
        let b = loc(8.0, 52.0);

        store
            .save_measurements(
                &device,
                vec![
                    measurement(at(10), Some(a)),
                    measurement(at(0), Some(b)),
                ],
            )
            .await
            .unwrap();

        // Between the two explicit locations: the earlier one applies.
        store
            .save_measurements(&device, vec![measurement(at(5), None)])
            .await
            .unwrap();

        let stored = store.measurements("dev-1");
        assert_eq!(stored[2].location, Some(a));
    }

    #[tokio::test]
    async fn test_timestamp_before_any_location_stores_none() {
        let (store, device) = store_with_device();

        store
            .save_measurements(&device, vec![measurement(at(10), Some(loc(7.0, 51.0)))])
            .await
            .unwrap();
        store
            .save_measurements(&device, vec![measurement(at(20), None)])
            .await
            .unwrap();

        let stored = store.measurements("dev-1");
        assert_eq!(stored[1].location, None);
    }

    #[tokio::test]
    async fn test_inference_is_not_revisited() {
        let (store, device) = store_with_device();

        // Stored with no location history available at all.
        store
            .save_measurements(&device, vec![measurement(at(5), None)])
            .await
            .unwrap();

        // A location arrives later, timestamped before the measurement.
        store
            .save_measurements(&device, vec![measurement(at(10), Some(loc(7.0, 51.0)))])
            .await
            .unwrap();

        let stored = store.measurements("dev-1");
        assert_eq!(stored[0].location, None);
    }

    #[tokio::test]
    async fn test_within_batch_locations_are_visible() {
        let (store, device) = store_with_device();
        let a = loc(7.0, 51.0);

        store
            .save_measurements(
                &device,
                vec![measurement(at(10), Some(a)), measurement(at(5), None)],
            )
            .await
            .unwrap();

        let stored = store.measurements("dev-1");
        assert_eq!(stored[1].location, Some(a));
    }

    #[tokio::test]
    async fn test_last_measurement_pointer_is_monotonic() {
        let (store, device) = store_with_device();

        let mut newer = measurement(at(0), None);
        newer.value = 2.0;
        store
            .save_measurements(&device, vec![newer])
            .await
            .unwrap();

        let mut older = measurement(at(5), None);
        older.value = 1.0;
        store
            .save_measurements(&device, vec![older])
            .await
            .unwrap();

        let last = store.last_measurement("dev-1", "s-1").unwrap();
        assert_eq!(last.value, 2.0);
    }

    #[tokio::test]
    async fn test_unknown_device_is_an_error() {
        let store = MemoryStore::new();
        let device = create_test_device();
        let result = store
            .save_measurements(&device, vec![measurement(at(0), None)])
            .await;
        assert!(result.is_err());
    }
}
