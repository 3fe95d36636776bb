//! Core domain model for observation sync.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

pub const CRATE_NAME: &str = "obsync-core";

/// Latest stored observation time for a (station, level) pair; `None` before the first ingest.
pub type Watermark = Option<DateTime<Utc>>;

/// Lenient numeric coercion used for catalog attributes and CSV cells.
///
/// Empty or non-numeric input maps to `NaN` instead of failing.
pub fn coerce_number(raw: &str) -> f64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointGeometry {
    pub longitude: f64,
    pub latitude: f64,
    pub altitude: f64,
}

impl PointGeometry {
    pub fn new(longitude: f64, latitude: f64, altitude: f64) -> Self {
        Self {
            longitude,
            latitude,
            altitude,
        }
    }

    pub fn coordinates(&self) -> [f64; 3] {
        [self.longitude, self.latitude, self.altitude]
    }

    pub fn to_geojson(&self) -> JsonValue {
        json!({
            "type": "Point",
            "coordinates": self.coordinates().map(finite_or_null),
        })
    }
}

fn finite_or_null(value: f64) -> JsonValue {
    if value.is_finite() {
        json!(value)
    } else {
        JsonValue::Null
    }
}

/// Station attributes exactly as a catalog row reports them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StationAttributes {
    pub station_id: String,
    pub station_name: String,
    pub longitude: String,
    pub latitude: String,
    pub altitude: String,
}

impl StationAttributes {
    pub fn normalize(&self) -> Station {
        Station {
            station_id: self.station_id.trim().to_string(),
            station_name: self.station_name.trim().to_string(),
            longitude: coerce_number(&self.longitude),
            latitude: coerce_number(&self.latitude),
            altitude: coerce_number(&self.altitude),
        }
    }
}

/// Canonical station document. One per `station_id` in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub station_id: String,
    pub station_name: String,
    pub longitude: f64,
    pub latitude: f64,
    pub altitude: f64,
}

impl Station {
    pub fn position(&self) -> PointGeometry {
        PointGeometry::new(self.longitude, self.latitude, self.altitude)
    }

    pub fn to_feature(&self) -> JsonValue {
        json!({
            "type": "Feature",
            "geometry": self.position().to_geojson(),
            "properties": {
                "stationId": self.station_id,
                "stationName": self.station_name,
            },
        })
    }
}

/// A discovered catalog object. Consumed once by the transform step, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataObject {
    pub object_url: String,
    pub download_url: String,
    pub file_name: String,
    pub station: StationAttributes,
    pub level: Option<f64>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl DataObject {
    pub fn station_id(&self) -> &str {
        &self.station.station_id
    }
}

/// One accepted observation row, shaped as a point feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub time: DateTime<Utc>,
    pub level: f64,
    pub station_id: String,
    pub station_name: String,
    #[serde(with = "nan_as_null")]
    pub values: BTreeMap<String, f64>,
    pub geometry: PointGeometry,
}

impl Observation {
    pub fn value(&self, variable: &str) -> Option<f64> {
        self.values.get(variable).copied()
    }

    pub fn to_feature(&self) -> JsonValue {
        let mut properties = serde_json::Map::new();
        properties.insert("stationId".into(), json!(self.station_id));
        properties.insert("stationName".into(), json!(self.station_name));
        properties.insert("samplingHeight".into(), finite_or_null(self.level));
        for (name, value) in &self.values {
            properties.insert(name.clone(), finite_or_null(*value));
        }
        json!({
            "type": "Feature",
            "time": self.time.to_rfc3339_opts(SecondsFormat::Millis, true),
            "level": finite_or_null(self.level),
            "geometry": self.geometry.to_geojson(),
            "properties": properties,
        })
    }
}

/// Serde adapter for variable maps: JSON has no `NaN`, so it round-trips through `null`.
pub mod nan_as_null {
    use std::collections::BTreeMap;

    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        values: &BTreeMap<String, f64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(values.len()))?;
        for (name, value) in values {
            let value = value.is_finite().then_some(*value);
            map.serialize_entry(name, &value)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, f64>, D::Error> {
        let raw = BTreeMap::<String, Option<f64>>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(name, value)| (name, value.unwrap_or(f64::NAN)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn coercion_maps_garbage_to_nan() {
        assert_eq!(coerce_number(" 12.5 "), 12.5);
        assert_eq!(coerce_number("-3e2"), -300.0);
        assert!(coerce_number("").is_nan());
        assert!(coerce_number("n/a").is_nan());
    }

    #[test]
    fn station_feature_uses_lon_lat_alt_order() {
        let station = StationAttributes {
            station_id: " SAC ".into(),
            station_name: "Saclay".into(),
            longitude: "2.142".into(),
            latitude: "48.7227".into(),
            altitude: "160".into(),
        }
        .normalize();

        assert_eq!(station.station_id, "SAC");
        let feature = station.to_feature();
        assert_eq!(feature["geometry"]["coordinates"], json!([2.142, 48.7227, 160.0]));
        assert_eq!(feature["properties"]["stationId"], "SAC");
    }

    #[test]
    fn nan_values_survive_a_json_trip() {
        let observation = Observation {
            time: Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).single().unwrap(),
            level: 2.0,
            station_id: "S1".into(),
            station_name: "Station One".into(),
            values: BTreeMap::from([("rn".to_string(), f64::NAN)]),
            geometry: PointGeometry::new(1.0, 2.0, 12.0),
        };

        let text = serde_json::to_string(&observation).unwrap();
        assert!(text.contains("\"rn\":null"));
        let back: Observation = serde_json::from_str(&text).unwrap();
        assert!(back.value("rn").unwrap().is_nan());

        let feature = observation.to_feature();
        assert_eq!(feature["properties"]["rn"], JsonValue::Null);
        assert_eq!(feature["time"], "2026-10-01T12:00:00.000Z");
    }
}
