//! Decoders for the compact binary measurement formats.
//!
//! Constrained devices upload fixed-width frames instead of JSON: 12 bytes
//! of raw sensor id followed by a little-endian float32 value, and in the
//! timestamped variant a little-endian uint32 of unix seconds. The sensor
//! id bytes are hex-encoded (two digits per byte, zero-padded) before the
//! lookup against the device's sensors.

use chrono::{DateTime, TimeZone, Utc};
use tracing::warn;

use crate::decoding::DecodeError;
use crate::models::{within_clock_skew, Measurement, Sensor};

/// Raw sensor id bytes at the start of every frame.
const SENSOR_ID_LEN: usize = 12;
/// Frame length without a timestamp: sensor id + float32 value.
pub const FRAME_LEN: usize = 16;
/// Frame length with a trailing uint32 unix-seconds timestamp.
pub const FRAME_LEN_TS: usize = 20;
/// Hard per-request record cap. Bounds worst-case CPU and memory per
/// upload, not a performance knob.
pub const MAX_FRAMES: usize = 2500;

/// Decode one frame starting at `offset`.
///
/// Returns `Ok(None)` when the frame's sensor id matches none of the
/// device's sensors; unknown ids are skipped, not fatal. A decoded
/// timestamp further in the future than the tolerated clock skew fails the
/// whole upload.
pub fn extract_frame(
    buf: &[u8],
    offset: usize,
    sensors: &[Sensor],
    with_timestamp: bool,
) -> Result<Option<Measurement>, DecodeError> {
    let frame_len = if with_timestamp { FRAME_LEN_TS } else { FRAME_LEN };
    let frame = buf
        .get(offset..offset + frame_len)
        .ok_or(DecodeError::TruncatedFrame { offset })?;

    let sensor_id = hex_encode(&frame[..SENSOR_ID_LEN]);
    let Some(sensor) = sensors.iter().find(|s| s.id.eq_ignore_ascii_case(&sensor_id)) else {
        warn!(sensor_id = %sensor_id, "skipping frame for unknown sensor");
        return Ok(None);
    };

    let value = f32::from_le_bytes([frame[12], frame[13], frame[14], frame[15]]) as f64;

    let created_at = if with_timestamp {
        let secs = u32::from_le_bytes([frame[16], frame[17], frame[18], frame[19]]);
        let created_at = unix_seconds(secs)?;
        if !within_clock_skew(created_at) {
            return Err(DecodeError::TimestampInFuture { created_at });
        }
        created_at
    } else {
        Utc::now()
    };

    Ok(Some(Measurement {
        sensor_id: sensor.id.clone(),
        value,
        created_at,
        location: None,
    }))
}

/// Decode a whole binary upload of back-to-back frames.
pub fn decode_frames(
    body: &[u8],
    sensors: &[Sensor],
    with_timestamp: bool,
) -> Result<Vec<Measurement>, DecodeError> {
    let frame_len = if with_timestamp { FRAME_LEN_TS } else { FRAME_LEN };

    if body.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }
    if body.len() % frame_len != 0 {
        return Err(DecodeError::BadFrameLength {
            len: body.len(),
            frame_len,
        });
    }

    let count = body.len() / frame_len;
    if count > MAX_FRAMES {
        return Err(DecodeError::TooManyMeasurements { count });
    }

    let mut measurements = Vec::with_capacity(count);
    for i in 0..count {
        if let Some(measurement) = extract_frame(body, i * frame_len, sensors, with_timestamp)? {
            if measurement.value.is_finite() {
                measurements.push(measurement);
            } else {
                warn!(
                    sensor_id = %measurement.sensor_id,
                    "dropping non-finite value from binary frame"
                );
            }
        }
    }

    Ok(measurements)
}

/// Lowercase hex, two digits per byte, zero-padded.
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A uint32 of unix seconds is always a representable instant.
fn unix_seconds(secs: u32) -> Result<DateTime<Utc>, DecodeError> {
    Utc.timestamp_opt(i64::from(secs), 0)
        .single()
        .ok_or(DecodeError::UnrepresentableTimestamp { secs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const SENSOR_ID: &str = "5386026e26cd0c65fe9bb0ec";

    fn create_test_sensors() -> Vec<Sensor> {
        vec![Sensor {
            id: SENSOR_ID.to_string(),
            title: "Temperatur".to_string(),
            unit: "°C".to_string(),
            sensor_type: Some("BME280".to_string()),
        }]
    }

    fn id_bytes(hex: &str) -> Vec<u8> {
        hex.as_bytes()
            .chunks(2)
            .map(|pair| u8::from_str_radix(std::str::from_utf8(pair).unwrap(), 16).unwrap())
            .collect()
    }

    fn frame(hex_id: &str, value: f32) -> Vec<u8> {
        let mut buf = id_bytes(hex_id);
        buf.extend_from_slice(&value.to_le_bytes());
        buf
    }

    fn frame_ts(hex_id: &str, value: f32, at: DateTime<Utc>) -> Vec<u8> {
        let mut buf = frame(hex_id, value);
        buf.extend_from_slice(&(at.timestamp() as u32).to_le_bytes());
        buf
    }

    #[test]
    fn test_roundtrip_without_timestamp() {
        let sensors = create_test_sensors();
        let body = frame(SENSOR_ID, 21.4);

        let decoded = decode_frames(&body, &sensors, false).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].sensor_id, SENSOR_ID);
        assert!((decoded[0].value - 21.4).abs() < 1e-6);
        assert!(decoded[0].location.is_none());
    }

    #[test]
    fn test_roundtrip_with_timestamp() {
        let sensors = create_test_sensors();
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let body = frame_ts(SENSOR_ID, -3.25, at);

        let decoded = decode_frames(&body, &sensors, true).unwrap();
        assert_eq!(decoded[0].created_at, at);
        assert!((decoded[0].value - -3.25).abs() < 1e-6);
    }

    #[test]
    fn test_sensor_id_lookup_is_case_insensitive() {
        let mut sensors = create_test_sensors();
        sensors[0].id = SENSOR_ID.to_uppercase();
        let body = frame(SENSOR_ID, 1.0);

        let decoded = decode_frames(&body, &sensors, false).unwrap();
        assert_eq!(decoded[0].sensor_id, SENSOR_ID.to_uppercase());
    }

    #[test]
    fn test_unknown_sensor_is_skipped_not_fatal() {
        let sensors = create_test_sensors();
        let body = frame("aaaaaaaaaaaaaaaaaaaaaaaa", 1.0);

        let decoded = decode_frames(&body, &sensors, false).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_length_must_be_frame_multiple() {
        let sensors = create_test_sensors();
        let mut body = frame(SENSOR_ID, 1.0);
        body.push(0);

        assert!(matches!(
            decode_frames(&body, &sensors, false),
            Err(DecodeError::BadFrameLength { len: 17, frame_len: 16 })
        ));
    }

    #[test]
    fn test_empty_payload_fails() {
        let sensors = create_test_sensors();
        assert!(matches!(
            decode_frames(&[], &sensors, false),
            Err(DecodeError::EmptyPayload)
        ));
    }

    #[test]
    fn test_frame_cap() {
        let sensors = create_test_sensors();
        let one = frame(SENSOR_ID, 1.0);
        let body: Vec<u8> = one
            .iter()
            .copied()
            .cycle()
            .take(FRAME_LEN * (MAX_FRAMES + 1))
            .collect();

        let err = decode_frames(&body, &sensors, false).unwrap_err();
        assert!(err.to_string().contains("Too many measurements"));
    }

    #[test]
    fn test_future_timestamp_fails_whole_batch() {
        let sensors = create_test_sensors();
        let mut body = frame_ts(SENSOR_ID, 1.0, Utc::now());
        body.extend(frame_ts(SENSOR_ID, 2.0, Utc::now() + Duration::minutes(10)));

        assert!(matches!(
            decode_frames(&body, &sensors, true),
            Err(DecodeError::TimestampInFuture { .. })
        ));
    }

    #[test]
    fn test_nan_value_is_dropped() {
        let sensors = create_test_sensors();
        let body = frame(SENSOR_ID, f32::NAN);

        let decoded = decode_frames(&body, &sensors, false).unwrap();
        assert!(decoded.is_empty());
    }
}
