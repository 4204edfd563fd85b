//! Ingestion orchestrator.
//!
//! Ties the pipeline together for one request: resolve the decoder,
//! load the device, enforce its access-token policy, decode, validate
//! every record, and hand the whole batch to storage in a single call.
//! Validation happens before any write, so a request is all-or-nothing.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, instrument};

use crate::decoding::{self, PayloadFormat};
use crate::error::IngestError;
use crate::location;
use crate::models::{within_clock_skew, Device, Measurement};
use crate::store::MeasurementStore;

/// Request context for a batched measurement upload.
#[derive(Debug, Clone, Default)]
pub struct PostMeasurementsOptions {
    /// Content-Type header, if the request carried one
    pub content_type: Option<String>,
    /// Force the luftdaten.info decoder regardless of the header
    pub luftdaten: bool,
    /// Force the hackAIR decoder regardless of the header
    pub hackair: bool,
    /// Authorization header, compared verbatim against the device's key
    pub authorization: Option<String>,
    /// Pre-trusted service channels bypass the device token check
    pub is_trusted_service: bool,
}

/// Body of a single-measurement upload.
#[derive(Debug, Clone, Deserialize)]
pub struct SingleMeasurementBody {
    /// Measured value; numbers and numeric strings are accepted
    pub value: Value,
    /// Optional explicit timestamp, RFC 3339
    #[serde(rename = "createdAt")]
    pub created_at: Option<String>,
    /// Optional location in any of the supported shapes
    #[serde(default)]
    pub location: Option<Value>,
}

/// The ingestion entry points, generic over the storage backend.
pub struct IngestService<S> {
    store: Arc<S>,
}

impl<S> IngestService<S>
where
    S: MeasurementStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Ingest a batched upload in any of the supported formats.
    ///
    /// Returns the number of measurements handed to storage.
    #[instrument(skip(self, body, opts), fields(device_id = %device_id))]
    pub async fn post_new_measurements(
        &self,
        device_id: &str,
        body: &[u8],
        opts: &PostMeasurementsOptions,
    ) -> Result<usize, IngestError> {
        let format = resolve_format(opts)?;
        let device = self.load_device(device_id).await?;
        check_access_token(&device, opts.authorization.as_deref(), opts.is_trusted_service)?;

        let mut measurements = decoding::decode_measurements(body, format, &device.sensors)
            .map_err(|err| {
                metrics::counter!("ingest.requests.undecodable").increment(1);
                IngestError::UnprocessableEntity(err.to_string())
            })?;

        for measurement in &mut measurements {
            validate_measurement(measurement, &device)?;
        }

        let count = measurements.len();
        self.save(&device, measurements).await?;

        info!(count, format = ?format, "measurements ingested");
        metrics::counter!("ingest.measurements.saved").increment(count as u64);
        Ok(count)
    }

    /// Ingest a single measurement for one sensor of a device.
    #[instrument(skip(self, body, authorization), fields(device_id = %device_id, sensor_id = %sensor_id))]
    pub async fn post_single_measurement(
        &self,
        device_id: &str,
        sensor_id: &str,
        body: SingleMeasurementBody,
        authorization: Option<&str>,
        is_trusted_service: bool,
    ) -> Result<(), IngestError> {
        let Some(value) = decoding::coerce_f64(&body.value) else {
            return Err(IngestError::UnprocessableEntity(
                "Invalid measurement value: expected a number".to_string(),
            ));
        };

        let device = self.load_device(device_id).await?;
        if device.sensor(sensor_id).is_none() {
            return Err(IngestError::NotFound(format!(
                "Sensor {sensor_id} not found on device {device_id}"
            )));
        }
        check_access_token(&device, authorization, is_trusted_service)?;

        let created_at = match &body.created_at {
            Some(raw) => decoding::parse_timestamp(raw)
                .map_err(|err| IngestError::UnprocessableEntity(err.to_string()))?,
            None => Utc::now(),
        };

        let mut measurement = Measurement {
            sensor_id: sensor_id.to_string(),
            value,
            created_at,
            location: body.location.as_ref().and_then(location::parse),
        };
        validate_measurement(&mut measurement, &device)?;

        self.save(&device, vec![measurement]).await?;
        metrics::counter!("ingest.measurements.saved").increment(1);
        Ok(())
    }

    async fn load_device(&self, device_id: &str) -> Result<Device, IngestError> {
        self.store
            .get_device(device_id)
            .await
            .map_err(log_internal)?
            .ok_or_else(|| IngestError::NotFound(format!("Device {device_id} not found")))
    }

    async fn save(&self, device: &Device, measurements: Vec<Measurement>) -> Result<(), IngestError> {
        self.store
            .save_measurements(device, measurements)
            .await
            .map_err(log_internal)
    }
}

/// The vendor flags override the header; otherwise the normalized
/// Content-Type picks the decoder, defaulting to JSON when no header was
/// sent.
fn resolve_format(opts: &PostMeasurementsOptions) -> Result<PayloadFormat, IngestError> {
    if opts.luftdaten {
        return Ok(PayloadFormat::Luftdaten);
    }
    if opts.hackair {
        return Ok(PayloadFormat::Hackair);
    }

    let content_type = opts.content_type.as_deref().unwrap_or("application/json");
    PayloadFormat::from_content_type(content_type)
        .ok_or_else(|| IngestError::UnsupportedMediaType(content_type.to_string()))
}

/// Token policy: devices with `use_auth` require the Authorization header
/// to equal their key verbatim, unless the caller is a pre-trusted service
/// channel.
fn check_access_token(
    device: &Device,
    authorization: Option<&str>,
    is_trusted_service: bool,
) -> Result<(), IngestError> {
    if !device.use_auth || is_trusted_service {
        return Ok(());
    }

    let valid = matches!(
        (device.api_key.as_deref(), authorization),
        (Some(expected), Some(given)) if expected == given
    );
    if valid {
        Ok(())
    } else {
        metrics::counter!("ingest.auth.rejected").increment(1);
        Err(IngestError::Unauthorized)
    }
}

/// Per-record validation, applied to every decoded measurement before
/// anything is written.
fn validate_measurement(measurement: &mut Measurement, device: &Device) -> Result<(), IngestError> {
    if device.sensor(&measurement.sensor_id).is_none() {
        return Err(IngestError::UnprocessableEntity(format!(
            "Measurement for unknown sensor {}",
            measurement.sensor_id
        )));
    }

    if !within_clock_skew(measurement.created_at) {
        return Err(IngestError::UnprocessableEntity(format!(
            "Timestamp {} is more than 5 minutes in the future",
            measurement.created_at.to_rfc3339()
        )));
    }

    if let Some(location) = &mut measurement.location {
        location.lng = location::normalize_longitude(location.lng);
        if !location::valid_lng_lat(location.lng, location.lat) {
            return Err(IngestError::UnprocessableEntity(
                "Invalid location coordinates".to_string(),
            ));
        }
    }

    Ok(())
}

fn log_internal(err: anyhow::Error) -> IngestError {
    error!(error = %err, "unexpected ingestion failure");
    IngestError::Internal(err)
}
