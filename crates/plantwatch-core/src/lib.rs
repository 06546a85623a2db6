//! Core domain model for the plant monitoring pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "plantwatch-core";

/// Stable identifier of a monitored plant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One untyped record as returned by the plant API, key order preserved.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub JsonMap<String, JsonValue>);

impl RawRecord {
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) {
        self.0.insert(key.into(), value);
    }
}

impl From<JsonMap<String, JsonValue>> for RawRecord {
    fn from(value: JsonMap<String, JsonValue>) -> Self {
        Self(value)
    }
}

/// Data-quality classification attached to a reading.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorTag {
    LowMoisture,
    LowTemperature,
    HighTemperature,
    NegativeValue,
    SensorError,
    NotFound,
}

impl ErrorTag {
    pub const ALL: [ErrorTag; 6] = [
        ErrorTag::LowMoisture,
        ErrorTag::LowTemperature,
        ErrorTag::HighTemperature,
        ErrorTag::NegativeValue,
        ErrorTag::SensorError,
        ErrorTag::NotFound,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorTag::LowMoisture => "low_moisture",
            ErrorTag::LowTemperature => "low_temperature",
            ErrorTag::HighTemperature => "high_temperature",
            ErrorTag::NegativeValue => "negative_value",
            ErrorTag::SensorError => "sensor_error",
            ErrorTag::NotFound => "not_found",
        }
    }

    /// Short human label used in alert digests.
    pub fn label(self) -> &'static str {
        match self {
            ErrorTag::LowMoisture => "Low soil moisture",
            ErrorTag::LowTemperature => "Low temperature",
            ErrorTag::HighTemperature => "High temperature",
            ErrorTag::NegativeValue => "Negative reading",
            ErrorTag::SensorError => "Sensor error",
            ErrorTag::NotFound => "Plant not found",
        }
    }
}

impl fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown error tag: {0}")]
pub struct UnknownErrorTag(pub String);

impl FromStr for ErrorTag {
    type Err = UnknownErrorTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| UnknownErrorTag(s.to_string()))
    }
}

/// One timestamped measurement for a plant, after validation and classification.
///
/// When `error_tag` is `None` every measurement field is present and the
/// numeric fields are non-negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub entity_id: EntityId,
    pub temperature: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub recorded_at: Option<DateTime<Utc>>,
    pub last_watered_at: Option<DateTime<Utc>>,
    pub error_tag: Option<ErrorTag>,
    /// Message reported by the sensor itself, kept verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

/// Measurements of a clean reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurements {
    pub temperature: f64,
    pub soil_moisture: f64,
    pub recorded_at: DateTime<Utc>,
    pub last_watered_at: DateTime<Utc>,
}

impl Reading {
    pub fn is_clean(&self) -> bool {
        self.error_tag.is_none()
    }

    pub fn measurements(&self) -> Option<Measurements> {
        if !self.is_clean() {
            return None;
        }
        Some(Measurements {
            temperature: self.temperature?,
            soil_moisture: self.soil_moisture?,
            recorded_at: self.recorded_at?,
            last_watered_at: self.last_watered_at?,
        })
    }
}

/// A reading as held by the fact store, keyed by an increasing row id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReading {
    pub reading_id: i64,
    #[serde(flatten)]
    pub reading: Reading,
}

/// Record of a reading that was included in a dispatched alert digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub sent_at: DateTime<Utc>,
    #[serde(flatten)]
    pub reading: Reading,
}

impl AlertRecord {
    pub fn entity_id(&self) -> EntityId {
        self.reading.entity_id
    }
}

/// Per-plant aggregate of one day of clean readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub entity_id: EntityId,
    pub avg_temperature: f64,
    pub avg_soil_moisture: f64,
    pub reading_count: u64,
    pub last_watered_at: DateTime<Utc>,
    pub date: NaiveDate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 5, h, 0, 0).single().expect("ts")
    }

    #[test]
    fn error_tags_round_trip_through_their_wire_names() {
        for tag in ErrorTag::ALL {
            assert_eq!(tag.as_str().parse::<ErrorTag>(), Ok(tag));
            let json = serde_json::to_string(&tag).unwrap();
            assert_eq!(json, format!("\"{}\"", tag.as_str()));
        }
        assert!("hot".parse::<ErrorTag>().is_err());
    }

    #[test]
    fn measurements_only_exist_for_clean_readings() {
        let mut reading = Reading {
            entity_id: EntityId(4),
            temperature: Some(21.0),
            soil_moisture: Some(55.0),
            recorded_at: Some(ts(14)),
            last_watered_at: Some(ts(9)),
            error_tag: None,
            error_detail: None,
        };
        let m = reading.measurements().expect("clean reading");
        assert_eq!(m.temperature, 21.0);
        assert_eq!(m.last_watered_at, ts(9));

        reading.error_tag = Some(ErrorTag::HighTemperature);
        assert!(reading.measurements().is_none());
    }

    #[test]
    fn alert_record_flattens_the_reading_snapshot() {
        let record = AlertRecord {
            sent_at: ts(15),
            reading: Reading {
                entity_id: EntityId(2),
                temperature: None,
                soil_moisture: None,
                recorded_at: None,
                last_watered_at: None,
                error_tag: Some(ErrorTag::SensorError),
                error_detail: Some("plant sensor fault".into()),
            },
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["entity_id"], 2);
        assert_eq!(value["error_tag"], "sensor_error");
        assert_eq!(value["sent_at"], "2025-06-05T15:00:00Z");

        let back: AlertRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
