use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use plantwatch_core::{DailySummary, EntityId, StoredReading};
use plantwatch_storage::{FactStore, FactStoreError, ObjectStore, ObjectStoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

pub const DAILY_SUMMARY_PREFIX: &str = "daily_summaries/";

pub fn archive_key(date: NaiveDate) -> String {
    format!(
        "{DAILY_SUMMARY_PREFIX}plant_readings_{}.csv",
        date.format("%Y-%m-%d")
    )
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("reading the fact store: {0}")]
    Read(#[source] FactStoreError),
    #[error("encoding daily summaries: {0}")]
    Encode(#[from] csv::Error),
    #[error("reading existing archive {key}: {source}")]
    Existing {
        key: String,
        #[source]
        source: ObjectStoreError,
    },
    #[error("writing archive {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: ObjectStoreError,
    },
    #[error("purging archived readings: {0}")]
    Purge(#[source] FactStoreError),
}

#[derive(Default)]
struct Totals {
    temperature: f64,
    soil_moisture: f64,
    count: u64,
    last_watered_at: Option<DateTime<Utc>>,
}

/// Per-plant means over clean rows, ascending by plant. Plants with only
/// flagged rows are left out.
pub fn summarise(rows: &[StoredReading], date: NaiveDate) -> Vec<DailySummary> {
    let mut totals: BTreeMap<EntityId, Totals> = BTreeMap::new();
    for row in rows {
        let Some(m) = row.reading.measurements() else {
            continue;
        };
        let entry = totals.entry(row.reading.entity_id).or_default();
        entry.temperature += m.temperature;
        entry.soil_moisture += m.soil_moisture;
        entry.count += 1;
        entry.last_watered_at = entry.last_watered_at.max(Some(m.last_watered_at));
    }

    totals
        .into_iter()
        .filter_map(|(entity_id, t)| {
            Some(DailySummary {
                entity_id,
                avg_temperature: t.temperature / t.count as f64,
                avg_soil_moisture: t.soil_moisture / t.count as f64,
                reading_count: t.count,
                last_watered_at: t.last_watered_at?,
                date,
            })
        })
        .collect()
}

#[derive(Serialize)]
struct SummaryRow {
    plant_id: i64,
    avg_temperature: f64,
    avg_soil_moisture: f64,
    recording_count: u64,
    last_watered: DateTime<Utc>,
    date: NaiveDate,
}

impl From<&DailySummary> for SummaryRow {
    fn from(s: &DailySummary) -> Self {
        Self {
            plant_id: s.entity_id.0,
            avg_temperature: s.avg_temperature,
            avg_soil_moisture: s.avg_soil_moisture,
            recording_count: s.reading_count,
            last_watered: s.last_watered_at,
            date: s.date,
        }
    }
}

pub fn encode_csv(summaries: &[DailySummary], with_header: bool) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(with_header)
        .from_writer(Vec::new());
    for summary in summaries {
        writer.serialize(SummaryRow::from(summary))?;
    }
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveOutcome {
    pub date: NaiveDate,
    pub rows_read: usize,
    pub summaries: usize,
    /// Set when an archive object was written.
    pub archive_key: Option<String>,
    pub purged: u64,
}

impl ArchiveOutcome {
    pub fn message(&self) -> String {
        match &self.archive_key {
            Some(key) => format!(
                "archived {} plant summaries to {key} and purged {} readings",
                self.summaries, self.purged
            ),
            None if self.rows_read == 0 => "no readings to archive".to_string(),
            None => format!(
                "no clean readings to archive; purged {} readings",
                self.purged
            ),
        }
    }
}

pub struct Archiver {
    facts: Arc<dyn FactStore>,
    objects: Arc<dyn ObjectStore>,
}

impl Archiver {
    pub fn new(facts: Arc<dyn FactStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { facts, objects }
    }

    /// Summarise everything in the fact store under `date`, write the archive
    /// and only then purge the rows that were read.
    pub async fn run(&self, date: NaiveDate) -> Result<ArchiveOutcome, ArchiveError> {
        let rows = self.facts.read_all().await.map_err(|err| {
            error!(error = %err, "failed to read readings for archiving");
            ArchiveError::Read(err)
        })?;
        let mut outcome = ArchiveOutcome {
            date,
            rows_read: rows.len(),
            summaries: 0,
            archive_key: None,
            purged: 0,
        };
        let Some(through) = rows.iter().map(|r| r.reading_id).max() else {
            info!(%date, "fact store is empty; nothing to archive");
            return Ok(outcome);
        };

        let summaries = summarise(&rows, date);
        outcome.summaries = summaries.len();
        if summaries.is_empty() {
            info!(%date, rows = rows.len(), "no clean readings to summarise");
        } else {
            let key = archive_key(date);
            self.append_summaries(&key, &summaries).await?;
            info!(%date, %key, plants = summaries.len(), "daily summary archived");
            outcome.archive_key = Some(key);
        }

        outcome.purged = self.facts.purge_through(through).await.map_err(|err| {
            error!(error = %err, through, "failed to purge archived readings");
            ArchiveError::Purge(err)
        })?;
        info!(purged = outcome.purged, through, "purged archived readings");
        Ok(outcome)
    }

    async fn append_summaries(
        &self,
        key: &str,
        summaries: &[DailySummary],
    ) -> Result<(), ArchiveError> {
        let existing = self.objects.get(key).await.map_err(|source| {
            error!(%key, error = %source, "failed to read existing archive");
            ArchiveError::Existing {
                key: key.to_string(),
                source,
            }
        })?;

        let body = match existing.filter(|bytes| !bytes.is_empty()) {
            Some(mut bytes) => {
                if !bytes.ends_with(b"\n") {
                    bytes.push(b'\n');
                }
                bytes.extend(encode_csv(summaries, false)?);
                bytes
            }
            None => encode_csv(summaries, true)?,
        };

        self.objects.put(key, &body).await.map_err(|source| {
            error!(%key, error = %source, "failed to write archive");
            ArchiveError::Write {
                key: key.to_string(),
                source,
            }
        })
    }
}
