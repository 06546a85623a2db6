//! Raw API records to typed, classified readings.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use plantwatch_acquire::{error_message, NOT_FOUND_MESSAGE};
use plantwatch_core::{EntityId, ErrorTag, RawRecord, Reading};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("plant {entity_id}: cannot parse {field} timestamp {value:?}")]
    Timestamp {
        entity_id: EntityId,
        field: &'static str,
        value: String,
    },
}

/// Thresholds for the data-quality tags.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassificationRules {
    /// `soil_moisture` strictly below this is `low_moisture`.
    pub low_moisture_below: f64,
    /// `temperature` at or below this is `low_temperature`.
    pub low_temperature_at_or_below: f64,
    /// `temperature` at or above this is `high_temperature`.
    pub high_temperature_at_or_above: f64,
}

impl Default for ClassificationRules {
    fn default() -> Self {
        Self {
            low_moisture_below: 30.0,
            low_temperature_at_or_below: 10.0,
            high_temperature_at_or_above: 30.0,
        }
    }
}

impl ClassificationRules {
    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading rules file {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing rules file {}", path.display()))
    }

    /// Tag for one row. Later rules overwrite earlier ones, so a negative
    /// value always wins.
    pub fn classify(
        &self,
        entity_id: EntityId,
        temperature: Option<f64>,
        soil_moisture: Option<f64>,
        incoming_error: Option<&str>,
    ) -> Option<ErrorTag> {
        let mut tag = incoming_error.map(|message| {
            if message == NOT_FOUND_MESSAGE {
                ErrorTag::NotFound
            } else {
                ErrorTag::SensorError
            }
        });
        if soil_moisture.is_some_and(|m| m < self.low_moisture_below) {
            tag = Some(ErrorTag::LowMoisture);
        }
        if temperature.is_some_and(|t| t <= self.low_temperature_at_or_below) {
            tag = Some(ErrorTag::LowTemperature);
        }
        if temperature.is_some_and(|t| t >= self.high_temperature_at_or_above) {
            tag = Some(ErrorTag::HighTemperature);
        }
        let negative = entity_id.0 < 0
            || temperature.is_some_and(|t| t < 0.0)
            || soil_moisture.is_some_and(|m| m < 0.0);
        if negative {
            tag = Some(ErrorTag::NegativeValue);
        }
        tag
    }
}

/// Output of one transform pass, in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassifiedBatch {
    pub readings: Vec<Reading>,
    /// Rows rejected at admission.
    pub dropped: usize,
}

impl ClassifiedBatch {
    pub fn error_rows(&self) -> Vec<Reading> {
        self.readings
            .iter()
            .filter(|reading| !reading.is_clean())
            .cloned()
            .collect()
    }
}

enum Coerced<T> {
    Missing,
    Value(T),
    Invalid,
}

impl<T> Coerced<T> {
    fn is_invalid(&self) -> bool {
        matches!(self, Coerced::Invalid)
    }

    fn value(self) -> Option<T> {
        match self {
            Coerced::Value(v) => Some(v),
            Coerced::Missing | Coerced::Invalid => None,
        }
    }
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// First non-blank value under the wire name or its canonical alias.
fn field<'a>(record: &'a RawRecord, names: &[&str]) -> Option<&'a JsonValue> {
    names
        .iter()
        .filter_map(|name| record.get(name))
        .find(|value| !is_blank(value))
}

fn coerce_f64(value: Option<&JsonValue>) -> Coerced<f64> {
    let parsed = match value {
        None => return Coerced::Missing,
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Coerced::Value(v),
        _ => Coerced::Invalid,
    }
}

fn coerce_entity_id(value: Option<&JsonValue>) -> Coerced<EntityId> {
    if let Some(JsonValue::Number(n)) = value {
        if let Some(id) = n.as_i64() {
            return Coerced::Value(EntityId(id));
        }
    }
    if let Some(JsonValue::String(s)) = value {
        if let Ok(id) = s.trim().parse::<i64>() {
            return Coerced::Value(EntityId(id));
        }
    }
    match coerce_f64(value) {
        Coerced::Value(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => {
            Coerced::Value(EntityId(v as i64))
        }
        Coerced::Missing => Coerced::Missing,
        _ => Coerced::Invalid,
    }
}

const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Naive timestamps are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    OFFSET_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(raw, fmt).ok())
        .map(|at| at.with_timezone(&Utc))
        .or_else(|| {
            NAIVE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|at| at.and_utc())
        })
}

fn timestamp(
    entity_id: EntityId,
    field: &'static str,
    value: Option<&JsonValue>,
) -> Result<Option<DateTime<Utc>>, TransformError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = value.as_str().and_then(parse_timestamp);
    match parsed {
        Some(at) => Ok(Some(at)),
        None => Err(TransformError::Timestamp {
            entity_id,
            field,
            value: value.as_str().map_or_else(|| value.to_string(), str::to_string),
        }),
    }
}

#[derive(Debug, Clone, Default)]
pub struct Transformer {
    rules: ClassificationRules,
}

impl Transformer {
    pub fn new(rules: ClassificationRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ClassificationRules {
        &self.rules
    }

    /// Select, validate and classify a batch. Only an unparseable timestamp on
    /// an admitted row fails the batch; every other problem drops the row.
    pub fn transform(&self, records: &[RawRecord]) -> Result<ClassifiedBatch, TransformError> {
        let mut batch = ClassifiedBatch::default();
        for record in records {
            match self.transform_record(record)? {
                Some(reading) => batch.readings.push(reading),
                None => batch.dropped += 1,
            }
        }
        info!(
            input = records.len(),
            kept = batch.readings.len(),
            dropped = batch.dropped,
            flagged = batch.readings.iter().filter(|r| !r.is_clean()).count(),
            "transformed batch"
        );
        Ok(batch)
    }

    fn transform_record(&self, record: &RawRecord) -> Result<Option<Reading>, TransformError> {
        let Coerced::Value(entity_id) = coerce_entity_id(field(record, &["plant_id", "entity_id"]))
        else {
            debug!("dropping row without a usable plant id");
            return Ok(None);
        };
        let incoming_error = field(record, &["error", "error_detail"]).and_then(error_message);
        let temperature = coerce_f64(field(record, &["temperature"]));
        let soil_moisture = coerce_f64(field(record, &["soil_moisture"]));
        if temperature.is_invalid() || soil_moisture.is_invalid() {
            debug!(%entity_id, "dropping row with a non-numeric measurement");
            return Ok(None);
        }
        let recorded_raw = field(record, &["recording_taken", "recorded_at"]);
        let watered_raw = field(record, &["last_watered", "last_watered_at"]);

        let temperature = temperature.value();
        let soil_moisture = soil_moisture.value();
        let complete = temperature.is_some()
            && soil_moisture.is_some()
            && recorded_raw.is_some()
            && watered_raw.is_some();
        if incoming_error.is_none() && !complete {
            debug!(%entity_id, "dropping incomplete row");
            return Ok(None);
        }

        let recorded_at = timestamp(entity_id, "recorded_at", recorded_raw)?;
        let last_watered_at = timestamp(entity_id, "last_watered_at", watered_raw)?;
        let error_tag =
            self.rules
                .classify(entity_id, temperature, soil_moisture, incoming_error.as_deref());

        Ok(Some(Reading {
            entity_id,
            temperature,
            soil_moisture,
            recorded_at,
            last_watered_at,
            error_tag,
            error_detail: incoming_error,
        }))
    }
}
