//! Postgres-backed measurement store.
//!
//! Mirrors the [`MemoryStore`](crate::store::MemoryStore) reconciliation
//! contract with SQL: the current-location pointer on the device row only
//! advances through a timestamp-guarded `UPDATE`, and location inference
//! for location-less measurements is a point-in-time query inside the
//! same transaction, so it sees locations inserted earlier in the batch
//! but is never revisited afterwards.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::models::{Device, Location, Measurement, Sensor};
use crate::store::{LocationRecord, MeasurementStore};

#[derive(Debug, sqlx::FromRow)]
struct DeviceRow {
    id: String,
    name: String,
    use_auth: bool,
    api_key: Option<String>,
}

/// Measurement store backed by PostgreSQL.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new store with a connection pool.
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// The device's current location, if it ever reported one.
    pub async fn current_location(&self, device_id: &str) -> Result<Option<LocationRecord>> {
        let row: Option<(Option<f64>, Option<f64>, Option<f64>, Option<DateTime<Utc>>)> =
            sqlx::query_as(
                r#"
                SELECT current_lng, current_lat, current_height, current_location_at
                FROM devices
                WHERE id = $1
                "#,
            )
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query current location")?;

        Ok(row.and_then(|(lng, lat, height, recorded_at)| {
            match (lng, lat, recorded_at) {
                (Some(lng), Some(lat), Some(recorded_at)) => Some(LocationRecord {
                    recorded_at,
                    location: Location { lng, lat, height },
                }),
                _ => None,
            }
        }))
    }

    /// Get the connection pool (for health checks).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MeasurementStore for PostgresStore {
    async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        let row = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT id, name, use_auth, api_key
            FROM devices
            WHERE id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query device")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let sensors = sqlx::query_as::<_, Sensor>(
            r#"
            SELECT id, title, unit, sensor_type
            FROM sensors
            WHERE device_id = $1
            ORDER BY position
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query sensors")?;

        Ok(Some(Device {
            id: row.id,
            name: row.name,
            use_auth: row.use_auth,
            api_key: row.api_key,
            sensors,
        }))
    }

    #[instrument(skip(self, device, measurements), fields(device_id = %device.id, count = measurements.len()))]
    async fn save_measurements(
        &self,
        device: &Device,
        measurements: Vec<Measurement>,
    ) -> Result<()> {
        let count = measurements.len();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        for measurement in &measurements {
            let resolved = match measurement.location {
                Some(location) => {
                    sqlx::query(
                        r#"
                        INSERT INTO device_locations (device_id, recorded_at, lng, lat, height)
                        VALUES ($1, $2, $3, $4, $5)
                        ON CONFLICT (device_id, recorded_at) DO NOTHING
                        "#,
                    )
                    .bind(&device.id)
                    .bind(measurement.created_at)
                    .bind(location.lng)
                    .bind(location.lat)
                    .bind(location.height)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to insert device location")?;

                    // Guarded pointer update: an out-of-order insert with
                    // an earlier timestamp leaves the current location
                    // untouched.
                    sqlx::query(
                        r#"
                        UPDATE devices
                        SET current_lng = $2, current_lat = $3,
                            current_height = $4, current_location_at = $5
                        WHERE id = $1
                          AND (current_location_at IS NULL OR current_location_at < $5)
                        "#,
                    )
                    .bind(&device.id)
                    .bind(location.lng)
                    .bind(location.lat)
                    .bind(location.height)
                    .bind(measurement.created_at)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to advance current location")?;

                    Some(location)
                }
                None => {
                    // Nearest preceding explicit location as of the
                    // measurement's own timestamp.
                    let row: Option<(f64, f64, Option<f64>)> = sqlx::query_as(
                        r#"
                        SELECT lng, lat, height
                        FROM device_locations
                        WHERE device_id = $1 AND recorded_at <= $2
                        ORDER BY recorded_at DESC
                        LIMIT 1
                        "#,
                    )
                    .bind(&device.id)
                    .bind(measurement.created_at)
                    .fetch_optional(&mut *tx)
                    .await
                    .context("Failed to resolve measurement location")?;

                    row.map(|(lng, lat, height)| Location { lng, lat, height })
                }
            };

            sqlx::query(
                r#"
                INSERT INTO measurements (id, device_id, sensor_id, value, created_at, lng, lat, height)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&device.id)
            .bind(&measurement.sensor_id)
            .bind(measurement.value)
            .bind(measurement.created_at)
            .bind(resolved.map(|l| l.lng))
            .bind(resolved.map(|l| l.lat))
            .bind(resolved.and_then(|l| l.height))
            .execute(&mut *tx)
            .await
            .context("Failed to insert measurement")?;

            sqlx::query(
                r#"
                UPDATE sensors
                SET last_measurement_at = $2, last_value = $3
                WHERE id = $1
                  AND (last_measurement_at IS NULL OR last_measurement_at < $2)
                "#,
            )
            .bind(&measurement.sensor_id)
            .bind(measurement.created_at)
            .bind(measurement.value)
            .execute(&mut *tx)
            .await
            .context("Failed to advance last measurement")?;
        }

        tx.commit().await.context("Failed to commit transaction")?;

        debug!(count, "measurement batch committed");
        metrics::counter!("store.measurements.inserted").increment(count as u64);

        Ok(())
    }
}
