use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plantwatch_core::{EntityId, ErrorTag, Reading, StoredReading};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum FactStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("reading {reading_id} is unreadable: {message}")]
    CorruptRow { reading_id: i64, message: String },
}

/// Short-term store of classified readings, emptied by the archiver.
#[async_trait]
pub trait FactStore: Send + Sync {
    /// Insert readings in one unit; readings already present for the same
    /// plant and `recorded_at` are skipped. Returns the number inserted.
    async fn insert(&self, readings: &[Reading]) -> Result<u64, FactStoreError>;
    /// Every held reading in ascending `reading_id` order.
    async fn read_all(&self) -> Result<Vec<StoredReading>, FactStoreError>;
    /// Delete readings with `reading_id <= through`. Returns the number deleted.
    async fn purge_through(&self, through: i64) -> Result<u64, FactStoreError>;
}

#[derive(Debug, Clone)]
pub struct PgFactStore {
    pool: PgPool,
}

impl PgFactStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to the fact store")?;
        info!("connected to postgres fact store");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        info!("running fact store migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running fact store migrations")?;
        Ok(())
    }
}

fn stored_reading_from_row(row: &PgRow) -> Result<StoredReading, FactStoreError> {
    let reading_id: i64 = row.try_get("reading_id")?;
    let error_tag: Option<String> = row.try_get("error_tag")?;
    let error_tag = error_tag
        .map(|raw| raw.parse::<ErrorTag>())
        .transpose()
        .map_err(|err| FactStoreError::CorruptRow {
            reading_id,
            message: err.to_string(),
        })?;

    Ok(StoredReading {
        reading_id,
        reading: Reading {
            entity_id: EntityId(row.try_get("plant_id")?),
            temperature: row.try_get("temperature")?,
            soil_moisture: row.try_get("soil_moisture")?,
            recorded_at: row.try_get::<Option<DateTime<Utc>>, _>("recorded_at")?,
            last_watered_at: row.try_get::<Option<DateTime<Utc>>, _>("last_watered_at")?,
            error_tag,
            error_detail: row.try_get("error_detail")?,
        },
    })
}

#[async_trait]
impl FactStore for PgFactStore {
    async fn insert(&self, readings: &[Reading]) -> Result<u64, FactStoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for reading in readings {
            let result = sqlx::query(
                r#"
                INSERT INTO plant_readings
                    (plant_id, temperature, soil_moisture, recorded_at,
                     last_watered_at, error_tag, error_detail)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (plant_id, recorded_at) WHERE recorded_at IS NOT NULL
                DO NOTHING
                "#,
            )
            .bind(reading.entity_id.0)
            .bind(reading.temperature)
            .bind(reading.soil_moisture)
            .bind(reading.recorded_at)
            .bind(reading.last_watered_at)
            .bind(reading.error_tag.map(ErrorTag::as_str))
            .bind(reading.error_detail.as_deref())
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn read_all(&self) -> Result<Vec<StoredReading>, FactStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT reading_id, plant_id, temperature, soil_moisture, recorded_at,
                   last_watered_at, error_tag, error_detail
              FROM plant_readings
             ORDER BY reading_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(stored_reading_from_row).collect()
    }

    async fn purge_through(&self, through: i64) -> Result<u64, FactStoreError> {
        let result = sqlx::query("DELETE FROM plant_readings WHERE reading_id <= $1")
            .bind(through)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// In-process fact store with the same idempotency rule as the database.
#[derive(Debug, Default)]
pub struct MemoryFactStore {
    state: Mutex<MemoryFacts>,
}

#[derive(Debug, Default)]
struct MemoryFacts {
    next_id: i64,
    rows: Vec<StoredReading>,
}

impl MemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FactStore for MemoryFactStore {
    async fn insert(&self, readings: &[Reading]) -> Result<u64, FactStoreError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0u64;
        for reading in readings {
            let duplicate = reading.recorded_at.is_some()
                && state.rows.iter().any(|held| {
                    held.reading.entity_id == reading.entity_id
                        && held.reading.recorded_at == reading.recorded_at
                });
            if duplicate {
                continue;
            }
            state.next_id += 1;
            let reading_id = state.next_id;
            state.rows.push(StoredReading {
                reading_id,
                reading: reading.clone(),
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn read_all(&self) -> Result<Vec<StoredReading>, FactStoreError> {
        Ok(self.state.lock().await.rows.clone())
    }

    async fn purge_through(&self, through: i64) -> Result<u64, FactStoreError> {
        let mut state = self.state.lock().await;
        let before = state.rows.len();
        state.rows.retain(|held| held.reading_id > through);
        Ok((before - state.rows.len()) as u64)
    }
}
