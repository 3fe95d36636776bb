//! Persistence contract shared by every store backend.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use obsync_core::{Observation, Station, Watermark};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// PostgreSQL accepts at most 65535 bind parameters per statement and an
/// observation row binds eight.
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize / 8;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to store: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("{action} failed: {source}")]
    Query {
        action: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("serializing observation values: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("store connection already closed")]
    Closed,
}

impl StoreError {
    pub(crate) fn query(action: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| StoreError::Query { action, source }
    }
}

/// Expiry window for stored observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention_secs: i64,
}

impl RetentionPolicy {
    pub fn from_secs(retention_secs: i64) -> Self {
        Self {
            retention_secs: retention_secs.max(0),
        }
    }

    /// Observations strictly older than this instant are expired.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(self.retention_secs)
    }
}

/// Geospatially and temporally indexed document store for stations and observations.
///
/// Observation writes are append-only and perform no deduplication; callers filter
/// against the watermark before writing. Station writes are upserts keyed by id.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    fn backend(&self) -> &'static str;

    fn retention(&self) -> RetentionPolicy;

    /// Create collections and indexes if missing. Safe to repeat.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Most recent stored time for the pair among observations carrying `variable`.
    async fn latest_observation_time(
        &self,
        station_id: &str,
        level: f64,
        variable: &str,
    ) -> Result<Watermark, StoreError>;

    /// Append one batch. Returns the number of rows written.
    async fn insert_observations(&self, batch: &[Observation]) -> Result<usize, StoreError>;

    /// Insert-or-update each station by `station_id`. Returns the number of rows touched.
    async fn upsert_stations(&self, stations: &[Station]) -> Result<usize, StoreError>;

    /// Delete observations older than the retention window as seen from `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn station_count(&self) -> Result<usize, StoreError>;

    async fn observation_count(&self, station_id: &str, level: f64) -> Result<usize, StoreError>;

    async fn close(&self);
}

/// Opens a store handle for the duration of one sync run.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ObservationStore>, StoreError>;
}

/// Append observations in bounded chunks.
///
/// Chunks are written in order, so a failure leaves a prefix of `observations` stored.
pub async fn write_observations_chunked(
    store: &dyn ObservationStore,
    observations: &[Observation],
    chunk_size: usize,
) -> Result<usize, StoreError> {
    let mut written = 0usize;
    for (index, chunk) in observations
        .chunks(chunk_size.clamp(1, MAX_CHUNK_SIZE))
        .enumerate()
    {
        written += store.insert_observations(chunk).await?;
        debug!(chunk = index, rows = chunk.len(), "observation chunk written");
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn retention_cutoff_subtracts_window() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).single().unwrap();
        let policy = RetentionPolicy::from_secs(7 * 24 * 60 * 60);
        assert_eq!(
            policy.cutoff(now),
            Utc.with_ymd_and_hms(2026, 10, 11, 0, 0, 0).single().unwrap()
        );
        assert_eq!(RetentionPolicy::from_secs(-5).retention_secs, 0);
    }
}
