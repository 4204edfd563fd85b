//! Heuristic matching of vendor field keys to local sensors.
//!
//! Third-party citizen-sensor firmwares never agree on sensor naming, so
//! mapping a vendor reading onto a device's sensors is a best-effort fuzzy
//! resolution over static alias tables, not an exact schema mapping. A
//! failed resolution is always a soft "skip this reading" (`None`), never
//! an error.

use crate::models::Sensor;

/// luftdaten.info phenomenon key -> matchable title fragments.
///
/// Keys are the part of the `value_type` after the chip prefix
/// (`BME280_temperature` -> `temperature`); fragments are matched against
/// lowercased sensor titles.
const LUFTDATEN_ALIASES: &[(&str, &[&str])] = &[
    ("temperature", &["temperatur"]),
    ("humidity", &["rel. luftfeuchte", "luftfeuchtigkeit"]),
    ("pressure", &["luftdruck", "druck"]),
    ("p0", &["pm1", "pm01"]),
    ("p1", &["pm10"]),
    ("p2", &["pm2.5", "pm25"]),
    ("signal", &["rssi", "signalstärke"]),
];

/// hackAIR phenomenon key -> matchable title fragments.
///
/// hackAIR reading keys lead with the pollutant
/// (`PM2.5_AirPollutantValue`), so the phenomenon is the part before the
/// first underscore.
const HACKAIR_ALIASES: &[(&str, &[&str])] = &[
    ("pm2.5", &["pm2.5", "pm25", "pm 2.5"]),
    ("pm10", &["pm10", "pm 10"]),
];

/// Resolve a luftdaten.info `value_type` to a sensor id of the device.
///
/// The key splits at the first underscore into a hardware-type prefix and a
/// phenomenon (`SDS011_P1` -> `sds011`, `p1`). Bare `temperature`,
/// `humidity` and `signal` keys are sent by older firmwares without a chip
/// prefix; those imply `dht`, `dht` and `wifi` respectively.
pub fn resolve_luftdaten(value_type: &str, sensors: &[Sensor]) -> Option<String> {
    let key = value_type.to_lowercase();
    let (prefix, phenomenon) = match key.split_once('_') {
        Some((prefix, phenomenon)) => (Some(prefix), phenomenon),
        None => (implicit_prefix(&key), key.as_str()),
    };
    find_sensor(sensors, prefix, phenomenon, LUFTDATEN_ALIASES)
}

/// Resolve a hackAIR reading key to a sensor id of the device. hackAIR
/// payloads carry no hardware type, so only titles are matched.
pub fn resolve_hackair(reading_key: &str, sensors: &[Sensor]) -> Option<String> {
    let key = reading_key.to_lowercase();
    let phenomenon = key.split_once('_').map_or(key.as_str(), |(p, _)| p);
    find_sensor(sensors, None, phenomenon, HACKAIR_ALIASES)
}

/// Implicit hardware prefix for prefix-less luftdaten keys.
fn implicit_prefix(key: &str) -> Option<&'static str> {
    match key {
        "temperature" | "humidity" => Some("dht"),
        "signal" => Some("wifi"),
        _ => None,
    }
}

/// Scan the device's sensors in their registered order and return the id of
/// the first one matching the phenomenon. A sensor matches when its
/// hardware type (if it has one) starts with the vendor prefix and its
/// lowercased title equals the phenomenon key or contains one of the
/// aliases.
fn find_sensor(
    sensors: &[Sensor],
    prefix: Option<&str>,
    phenomenon: &str,
    table: &[(&str, &[&str])],
) -> Option<String> {
    let aliases = table
        .iter()
        .find(|(key, _)| *key == phenomenon)
        .map(|(_, aliases)| *aliases)?;

    sensors
        .iter()
        .find(|sensor| {
            let type_matches = match (prefix, sensor.sensor_type.as_deref()) {
                (Some(prefix), Some(sensor_type)) => {
                    sensor_type.to_lowercase().starts_with(prefix)
                }
                // No prefix to enforce, or no hardware type to check it
                // against.
                _ => true,
            };
            if !type_matches {
                return false;
            }

            let title = sensor.title.to_lowercase();
            title == phenomenon || aliases.iter().any(|alias| title.contains(alias))
        })
        .map(|sensor| sensor.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_sensor(id: &str, title: &str, sensor_type: Option<&str>) -> Sensor {
        Sensor {
            id: id.to_string(),
            title: title.to_string(),
            unit: "-".to_string(),
            sensor_type: sensor_type.map(str::to_string),
        }
    }

    fn create_test_sensors() -> Vec<Sensor> {
        vec![
            create_test_sensor("s-temp", "Temperatur", Some("BME280")),
            create_test_sensor("s-hum", "rel. Luftfeuchte", Some("BME280")),
            create_test_sensor("s-press", "Luftdruck", Some("BME280")),
            create_test_sensor("s-pm10", "PM10", Some("SDS011")),
            create_test_sensor("s-pm25", "PM2.5", Some("SDS011")),
        ]
    }

    #[test]
    fn test_resolves_prefixed_value_type() {
        let sensors = create_test_sensors();
        assert_eq!(
            resolve_luftdaten("BME280_temperature", &sensors),
            Some("s-temp".to_string())
        );
        assert_eq!(
            resolve_luftdaten("BME280_humidity", &sensors),
            Some("s-hum".to_string())
        );
        assert_eq!(
            resolve_luftdaten("SDS011_P1", &sensors),
            Some("s-pm10".to_string())
        );
        assert_eq!(
            resolve_luftdaten("SDS011_P2", &sensors),
            Some("s-pm25".to_string())
        );
    }

    #[test]
    fn test_prefix_must_match_hardware_type() {
        // The device has a BME280, not a DS18B20; the reading must not
        // land on its temperature sensor.
        let sensors = create_test_sensors();
        assert_eq!(resolve_luftdaten("DS18B20_temperature", &sensors), None);
    }

    #[test]
    fn test_bare_keys_imply_dht_prefix() {
        let sensors = vec![create_test_sensor("s-1", "Temperatur", Some("DHT22"))];
        assert_eq!(
            resolve_luftdaten("temperature", &sensors),
            Some("s-1".to_string())
        );

        // Same title on a BME280 must not match the implicit dht prefix.
        let sensors = vec![create_test_sensor("s-1", "Temperatur", Some("BME280"))];
        assert_eq!(resolve_luftdaten("temperature", &sensors), None);
    }

    #[test]
    fn test_missing_hardware_type_passes_prefix_check() {
        let sensors = vec![create_test_sensor("s-1", "Temperatur", None)];
        assert_eq!(
            resolve_luftdaten("BME280_temperature", &sensors),
            Some("s-1".to_string())
        );
    }

    #[test]
    fn test_unknown_phenomenon_is_soft_skip() {
        let sensors = create_test_sensors();
        assert_eq!(resolve_luftdaten("BME280_radon", &sensors), None);
        assert_eq!(resolve_hackair("ozone", &sensors), None);
    }

    #[test]
    fn test_first_match_wins_in_sensor_order() {
        let sensors = vec![
            create_test_sensor("s-a", "Temperatur innen", Some("BME280")),
            create_test_sensor("s-b", "Temperatur", Some("BME280")),
        ];
        assert_eq!(
            resolve_luftdaten("BME280_temperature", &sensors),
            Some("s-a".to_string())
        );
    }

    #[test]
    fn test_hackair_pollutant_keys() {
        let sensors = create_test_sensors();
        assert_eq!(
            resolve_hackair("PM2.5_AirPollutantValue", &sensors),
            Some("s-pm25".to_string())
        );
        assert_eq!(
            resolve_hackair("PM10_AirPollutantValue", &sensors),
            Some("s-pm10".to_string())
        );
    }
}
