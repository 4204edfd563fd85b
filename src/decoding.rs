//! Format decoders: raw request payload + content type in, canonical
//! measurements out.
//!
//! Decoding is synchronous, CPU-bound and free of I/O; the orchestrator
//! owns device lookup and persistence. Individual readings degrade softly
//! (non-numeric values and unresolvable vendor fields are dropped with a
//! warning), structural problems fail the whole payload.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::binary_decoder;
use crate::location;
use crate::models::{Location, Measurement, Sensor};
use crate::sensor_matcher;

/// Decoder-level failures. The orchestrator wraps these as
/// unprocessable-entity errors, preserving the message.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Payload is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("Expected a JSON array of measurements or an object keyed by sensor id")]
    UnexpectedJsonShape,

    #[error("Malformed measurement record: {0}")]
    MalformedRecord(String),

    #[error("Invalid timestamp '{0}': expected RFC 3339")]
    InvalidTimestamp(String),

    #[error("Timestamp {created_at} is more than 5 minutes in the future")]
    TimestampInFuture { created_at: DateTime<Utc> },

    #[error("Timestamp {secs} is not a representable instant")]
    UnrepresentableTimestamp { secs: u32 },

    #[error("No applicable sensors found for any {vendor} readings")]
    NoResolvableReadings { vendor: &'static str },

    #[error("Empty payload: expected at least one measurement")]
    EmptyPayload,

    #[error("Invalid binary payload: length {len} is not a multiple of the {frame_len}-byte frame")]
    BadFrameLength { len: usize, frame_len: usize },

    #[error("Binary frame at offset {offset} is truncated")]
    TruncatedFrame { offset: usize },

    #[error("Too many measurements. Please submit at most 2500 measurements at once (got {count})")]
    TooManyMeasurements { count: usize },
}

/// The wire formats the pipeline can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// `application/json`: array of records or object keyed by sensor id
    Json,
    /// `text/csv`: `sensorId,value[,createdAt[,lng,lat[,height]]]` rows
    Csv,
    /// luftdaten.info push payload (forced via flag, not a content type)
    Luftdaten,
    /// hackAIR push payload (forced via flag, not a content type)
    Hackair,
    /// `application/sbx-bytes`: 16-byte binary frames
    Bytes,
    /// `application/sbx-bytes-ts`: 20-byte binary frames with timestamp
    BytesTimestamp,
}

impl PayloadFormat {
    /// Normalize a Content-Type header to a decoder.
    ///
    /// Matching is case-insensitive with parameters stripped: any MIME
    /// type containing `json` or `csv` maps to the JSON or CSV decoder;
    /// the binary formats require an exact match. Anything else has no
    /// decoder.
    pub fn from_content_type(raw: &str) -> Option<Self> {
        let mime = raw
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();

        if mime.contains("json") {
            return Some(PayloadFormat::Json);
        }
        if mime.contains("csv") {
            return Some(PayloadFormat::Csv);
        }
        match mime.as_str() {
            "application/sbx-bytes" => Some(PayloadFormat::Bytes),
            "application/sbx-bytes-ts" => Some(PayloadFormat::BytesTimestamp),
            _ => None,
        }
    }
}

/// Decode a raw request body into canonical measurements.
pub fn decode_measurements(
    body: &[u8],
    format: PayloadFormat,
    sensors: &[Sensor],
) -> Result<Vec<Measurement>, DecodeError> {
    match format {
        PayloadFormat::Json => decode_json(body),
        PayloadFormat::Csv => decode_csv(body),
        PayloadFormat::Luftdaten => decode_luftdaten(body, sensors),
        PayloadFormat::Hackair => decode_hackair(body, sensors),
        PayloadFormat::Bytes => binary_decoder::decode_frames(body, sensors, false),
        PayloadFormat::BytesTimestamp => binary_decoder::decode_frames(body, sensors, true),
    }
}

/// JSON bodies come in two shapes: an array of record objects, or an
/// object keyed by sensor id whose values are either a bare value or a
/// `[value, createdAt?, location?]` tuple.
fn decode_json(body: &[u8]) -> Result<Vec<Measurement>, DecodeError> {
    let payload: Value = serde_json::from_slice(body)?;

    match payload {
        Value::Array(records) => {
            let mut measurements = Vec::with_capacity(records.len());
            for record in &records {
                let Value::Object(fields) = record else {
                    return Err(DecodeError::MalformedRecord(
                        "expected an object per measurement".to_string(),
                    ));
                };

                let sensor_id = fields
                    .get("sensor")
                    .or_else(|| fields.get("sensor_id"))
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| {
                        DecodeError::MalformedRecord("missing sensor id".to_string())
                    })?;

                let Some(value) = fields.get("value").and_then(coerce_f64) else {
                    warn!(sensor_id, "dropping measurement with non-numeric value");
                    continue;
                };

                measurements.push(Measurement {
                    sensor_id: sensor_id.to_string(),
                    value,
                    created_at: parse_created_at(fields.get("createdAt"))?,
                    location: fields.get("location").and_then(|raw| location::parse(raw)),
                });
            }
            Ok(measurements)
        }
        Value::Object(entries) => {
            let mut measurements = Vec::with_capacity(entries.len());
            for (sensor_id, entry) in &entries {
                match entry {
                    Value::Array(parts) => {
                        if parts.is_empty() || parts.len() > 3 {
                            return Err(DecodeError::MalformedRecord(format!(
                                "expected [value, createdAt?, location?] for sensor {sensor_id}"
                            )));
                        }
                        let Some(value) = coerce_f64(&parts[0]) else {
                            warn!(sensor_id = %sensor_id, "dropping measurement with non-numeric value");
                            continue;
                        };
                        measurements.push(Measurement {
                            sensor_id: sensor_id.clone(),
                            value,
                            created_at: parse_created_at(parts.get(1))?,
                            location: parts.get(2).and_then(|raw| location::parse(raw)),
                        });
                    }
                    scalar => {
                        let Some(value) = coerce_f64(scalar) else {
                            warn!(sensor_id = %sensor_id, "dropping measurement with non-numeric value");
                            continue;
                        };
                        measurements.push(Measurement::now(sensor_id.clone(), value));
                    }
                }
            }
            Ok(measurements)
        }
        _ => Err(DecodeError::UnexpectedJsonShape),
    }
}

/// Newline-delimited `sensorId,value[,createdAt[,lng,lat[,height]]]` rows,
/// whitespace trimmed per field. A location is only parsed when both lng
/// and lat fields are present.
fn decode_csv(body: &[u8]) -> Result<Vec<Measurement>, DecodeError> {
    let text = std::str::from_utf8(body)?;

    let mut measurements = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 2 || fields.len() > 6 {
            return Err(DecodeError::MalformedRecord(format!(
                "line {}: expected 2 to 6 comma-separated fields",
                index + 1
            )));
        }

        let sensor_id = fields[0];
        if sensor_id.is_empty() {
            return Err(DecodeError::MalformedRecord(format!(
                "line {}: missing sensor id",
                index + 1
            )));
        }

        let value = fields[1].parse::<f64>().ok().filter(|v| v.is_finite());
        let Some(value) = value else {
            warn!(line = index + 1, "dropping CSV row with non-numeric value");
            continue;
        };

        let created_at = match fields.get(2) {
            Some(&raw) if !raw.is_empty() => parse_timestamp(raw)?,
            _ => Utc::now(),
        };

        let location = match (fields.get(3), fields.get(4)) {
            (Some(&lng), Some(&lat)) => {
                let parsed = parse_csv_location(lng, lat, fields.get(5).copied());
                if parsed.is_none() {
                    warn!(line = index + 1, "unparseable location in CSV row");
                }
                parsed
            }
            _ => None,
        };

        measurements.push(Measurement {
            sensor_id: sensor_id.to_string(),
            value,
            created_at,
            location,
        });
    }

    Ok(measurements)
}

fn parse_csv_location(lng: &str, lat: &str, height: Option<&str>) -> Option<Location> {
    let lng: f64 = lng.parse().ok()?;
    let lat: f64 = lat.parse().ok()?;
    let height = height
        .filter(|h| !h.is_empty())
        .and_then(|h| h.parse().ok());
    Some(Location {
        lng: location::normalize_longitude(lng),
        lat,
        height,
    })
}

#[derive(Debug, Deserialize)]
struct LuftdatenBody {
    sensordatavalues: Vec<LuftdatenReading>,
}

#[derive(Debug, Deserialize)]
struct LuftdatenReading {
    value_type: String,
    value: Value,
}

/// luftdaten.info push format. Readings that match no sensor are dropped;
/// a payload where nothing resolves is rejected as a whole.
fn decode_luftdaten(body: &[u8], sensors: &[Sensor]) -> Result<Vec<Measurement>, DecodeError> {
    let payload: LuftdatenBody = serde_json::from_slice(body)?;

    let mut measurements = Vec::with_capacity(payload.sensordatavalues.len());
    for reading in &payload.sensordatavalues {
        let Some(sensor_id) = sensor_matcher::resolve_luftdaten(&reading.value_type, sensors)
        else {
            warn!(value_type = %reading.value_type, "no matching sensor for luftdaten reading");
            continue;
        };
        let Some(value) = coerce_f64(&reading.value) else {
            warn!(value_type = %reading.value_type, "dropping non-numeric luftdaten value");
            continue;
        };
        measurements.push(Measurement::now(sensor_id, value));
    }

    if measurements.is_empty() {
        return Err(DecodeError::NoResolvableReadings {
            vendor: "luftdaten.info",
        });
    }
    Ok(measurements)
}

#[derive(Debug, Deserialize)]
struct HackairBody {
    reading: serde_json::Map<String, Value>,
}

/// hackAIR push format: an object of pollutant readings keyed by field
/// name. Same drop/fail semantics as luftdaten.
fn decode_hackair(body: &[u8], sensors: &[Sensor]) -> Result<Vec<Measurement>, DecodeError> {
    let payload: HackairBody = serde_json::from_slice(body)?;

    let mut measurements = Vec::with_capacity(payload.reading.len());
    for (key, raw) in &payload.reading {
        let Some(sensor_id) = sensor_matcher::resolve_hackair(key, sensors) else {
            warn!(key = %key, "no matching sensor for hackAIR reading");
            continue;
        };
        let Some(value) = coerce_f64(raw) else {
            warn!(key = %key, "dropping non-numeric hackAIR value");
            continue;
        };
        measurements.push(Measurement::now(sensor_id, value));
    }

    if measurements.is_empty() {
        return Err(DecodeError::NoResolvableReadings { vendor: "hackAIR" });
    }
    Ok(measurements)
}

/// Devices send values as JSON numbers or numeric strings; both coerce to
/// a finite f64 or nothing.
pub(crate) fn coerce_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// RFC 3339 timestamp, converted to UTC.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DecodeError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DecodeError::InvalidTimestamp(raw.to_string()))
}

/// An absent or null `createdAt` defaults to decode-time now.
fn parse_created_at(raw: Option<&Value>) -> Result<DateTime<Utc>, DecodeError> {
    match raw {
        None | Some(Value::Null) => Ok(Utc::now()),
        Some(Value::String(s)) => parse_timestamp(s),
        Some(other) => Err(DecodeError::InvalidTimestamp(other.to_string())),
    }
}
