//! Normalization and validation of device-reported locations.
//!
//! Devices encode positions in several shapes (`[lng, lat, height?]`
//! arrays, `{lng, lat}` objects, `{longitude, latitude}` objects). This
//! module converts all of them into the canonical [`Location`] and
//! enforces the coordinate range invariant. Malformed location data never
//! aborts an otherwise valid measurement; it degrades to `None`.

use serde_json::Value;
use tracing::warn;

use crate::models::Location;

/// Inclusive longitude bounds in degrees.
pub const LNG_RANGE: (f64, f64) = (-180.0, 180.0);
/// Inclusive latitude bounds in degrees.
pub const LAT_RANGE: (f64, f64) = (-90.0, 90.0);

/// Collapse the antimeridian: `+180` and `-180` are the same meridian, and
/// the canonical representation is `-180`. Values strictly inside the range
/// pass through unchanged.
pub fn normalize_longitude(lng: f64) -> f64 {
    if lng == LNG_RANGE.1 {
        LNG_RANGE.0
    } else {
        lng
    }
}

/// Hard range check applied at the orchestration layer, where an
/// out-of-range coordinate is fatal for the request.
pub fn valid_lng_lat(lng: f64, lat: f64) -> bool {
    lng.is_finite()
        && lat.is_finite()
        && (LNG_RANGE.0..=LNG_RANGE.1).contains(&lng)
        && (LAT_RANGE.0..=LAT_RANGE.1).contains(&lat)
}

/// Parse a location out of a JSON fragment.
///
/// Accepts a 2-3 element `[lng, lat, height?]` array, an object with
/// `lng`/`lat` (+ optional `height`), or an object with
/// `longitude`/`latitude` (+ optional `height`). Any other shape, or any
/// non-numeric coordinate, yields `None`. Longitudes are normalized on the
/// way in, so every `Location` in the system satisfies the canonical-form
/// invariant.
pub fn parse(raw: &Value) -> Option<Location> {
    let parsed = match raw {
        Value::Null => return None,
        Value::Array(items) if items.len() == 2 || items.len() == 3 => {
            let lng = as_coord(&items[0]);
            let lat = as_coord(&items[1]);
            let height = items.get(2).and_then(as_coord);
            lng.zip(lat).map(|(lng, lat)| Location { lng, lat, height })
        }
        Value::Object(map) => {
            let lng = map.get("lng").or_else(|| map.get("longitude")).and_then(as_coord);
            let lat = map.get("lat").or_else(|| map.get("latitude")).and_then(as_coord);
            let height = map.get("height").and_then(as_coord);
            lng.zip(lat).map(|(lng, lat)| Location { lng, lat, height })
        }
        _ => None,
    };

    match parsed {
        Some(mut location) => {
            location.lng = normalize_longitude(location.lng);
            Some(location)
        }
        None => {
            warn!(raw = %raw, "unparseable location, storing measurement without one");
            None
        }
    }
}

/// Coordinates arrive as JSON numbers or numeric strings, depending on the
/// device firmware.
fn as_coord(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
