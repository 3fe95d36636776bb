//! In-process store with the same contract as the PostgreSQL backend.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obsync_core::{Observation, Station, Watermark};
use tokio::sync::Mutex;

use crate::store::{ObservationStore, RetentionPolicy, StoreConnector, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    stations: BTreeMap<String, Station>,
    observations: Vec<Observation>,
    rejected_stations: BTreeSet<String>,
    failing_inserts: usize,
}

#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    retention: RetentionPolicy,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            retention,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reopen after `close`, keeping the stored documents.
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Fault injection: any station batch containing `station_id` is rejected.
    pub async fn reject_station(&self, station_id: &str) {
        self.state
            .lock()
            .await
            .rejected_stations
            .insert(station_id.to_string());
    }

    /// Fault injection: the next `count` observation batches are rejected.
    pub async fn fail_next_inserts(&self, count: usize) {
        self.state.lock().await.failing_inserts = count;
    }

    pub async fn stations(&self) -> Vec<Station> {
        self.state.lock().await.stations.values().cloned().collect()
    }

    pub async fn observations(&self) -> Vec<Observation> {
        self.state.lock().await.observations.clone()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObservationStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.ensure_open()
    }

    async fn latest_observation_time(
        &self,
        station_id: &str,
        level: f64,
        variable: &str,
    ) -> Result<Watermark, StoreError> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        Ok(state
            .observations
            .iter()
            // Exact float match on level, as in the SQL backend. Known risk.
            .filter(|obs| obs.station_id == station_id && obs.level == level)
            .filter(|obs| obs.values.contains_key(variable))
            .map(|obs| obs.time)
            .max())
    }

    async fn insert_observations(&self, batch: &[Observation]) -> Result<usize, StoreError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if state.failing_inserts > 0 {
            state.failing_inserts -= 1;
            return Err(StoreError::Rejected("observation batch rejected".into()));
        }
        state.observations.extend_from_slice(batch);
        Ok(batch.len())
    }

    async fn upsert_stations(&self, stations: &[Station]) -> Result<usize, StoreError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if let Some(bad) = stations
            .iter()
            .find(|station| state.rejected_stations.contains(&station.station_id))
        {
            return Err(StoreError::Rejected(format!(
                "station {} rejected",
                bad.station_id
            )));
        }
        for station in stations {
            state
                .stations
                .insert(station.station_id.clone(), station.clone());
        }
        Ok(stations.len())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let cutoff = self.retention.cutoff(now);
        let mut state = self.state.lock().await;
        let before = state.observations.len();
        state.observations.retain(|obs| obs.time >= cutoff);
        Ok((before - state.observations.len()) as u64)
    }

    async fn station_count(&self) -> Result<usize, StoreError> {
        self.ensure_open()?;
        Ok(self.state.lock().await.stations.len())
    }

    async fn observation_count(&self, station_id: &str, level: f64) -> Result<usize, StoreError> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        Ok(state
            .observations
            .iter()
            .filter(|obs| obs.station_id == station_id && obs.level == level)
            .count())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A shared memory store survives across runs: connecting reopens it.
#[async_trait]
impl StoreConnector for Arc<MemoryStore> {
    async fn connect(&self) -> Result<Arc<dyn ObservationStore>, StoreError> {
        self.reopen();
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::write_observations_chunked;
    use chrono::{Duration, TimeZone};
    use obsync_core::PointGeometry;

    fn observation(station_id: &str, level: f64, time: DateTime<Utc>) -> Observation {
        Observation {
            time,
            level,
            station_id: station_id.to_string(),
            station_name: format!("{station_id} name"),
            values: BTreeMap::from([("rn".to_string(), 1.0)]),
            geometry: PointGeometry::new(1.0, 2.0, 3.0 + level),
        }
    }

    fn station(id: &str, name: &str) -> Station {
        Station {
            station_id: id.into(),
            station_name: name.into(),
            longitude: 1.0,
            latitude: 2.0,
            altitude: 3.0,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn watermark_is_scoped_to_station_level_and_variable() {
        let store = MemoryStore::new(RetentionPolicy::from_secs(86_400 * 30));
        assert_eq!(store.latest_observation_time("S1", 2.0, "rn").await.unwrap(), None);

        let mut other_variable = observation("S1", 2.0, t0() + Duration::hours(5));
        other_variable.values = BTreeMap::from([("co2".to_string(), 1.0)]);
        store
            .insert_observations(&[
                observation("S1", 2.0, t0()),
                observation("S1", 2.0, t0() + Duration::hours(1)),
                observation("S1", 10.0, t0() + Duration::hours(3)),
                observation("S2", 2.0, t0() + Duration::hours(4)),
                other_variable,
            ])
            .await
            .unwrap();

        assert_eq!(
            store.latest_observation_time("S1", 2.0, "rn").await.unwrap(),
            Some(t0() + Duration::hours(1))
        );
    }

    #[tokio::test]
    async fn levels_match_only_on_exact_float_equality() {
        let store = MemoryStore::new(RetentionPolicy::from_secs(86_400 * 30));
        store
            .insert_observations(&[observation("S1", 2.0, t0())])
            .await
            .unwrap();

        assert_eq!(
            store.latest_observation_time("S1", "2".parse().unwrap(), "rn").await.unwrap(),
            Some(t0())
        );
        assert_eq!(
            store.latest_observation_time("S1", 2.0 + 1e-9, "rn").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn station_upsert_is_last_write_wins() {
        let store = MemoryStore::new(RetentionPolicy::from_secs(60));
        store.upsert_stations(&[station("S1", "first")]).await.unwrap();
        store.upsert_stations(&[station("S1", "second")]).await.unwrap();
        assert_eq!(store.station_count().await.unwrap(), 1);
        assert_eq!(store.stations().await[0].station_name, "second");
    }

    #[tokio::test]
    async fn expired_observations_disappear_after_purge() {
        let store = MemoryStore::new(RetentionPolicy::from_secs(3_600));
        store
            .insert_observations(&[observation("S1", 2.0, t0())])
            .await
            .unwrap();
        assert_eq!(store.observation_count("S1", 2.0).await.unwrap(), 1);

        let purged = store.purge_expired(t0() + Duration::minutes(30)).await.unwrap();
        assert_eq!(purged, 0);
        assert_eq!(store.observation_count("S1", 2.0).await.unwrap(), 1);

        let purged = store.purge_expired(t0() + Duration::hours(2)).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.observation_count("S1", 2.0).await.unwrap(), 0);
        assert_eq!(store.latest_observation_time("S1", 2.0, "rn").await.unwrap(), None);
    }

    #[tokio::test]
    async fn chunked_writes_leave_a_prefix_on_failure() {
        let store = MemoryStore::new(RetentionPolicy::from_secs(86_400));
        let rows: Vec<_> = (0..5)
            .map(|h| observation("S1", 2.0, t0() + Duration::hours(h)))
            .collect();

        assert_eq!(write_observations_chunked(&store, &rows[..2], 2).await.unwrap(), 2);
        store.fail_next_inserts(1).await;
        let err = write_observations_chunked(&store, &rows[2..], 2).await;
        assert!(matches!(err, Err(StoreError::Rejected(_))));
        assert_eq!(store.observation_count("S1", 2.0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn closed_store_refuses_work() {
        let store = MemoryStore::new(RetentionPolicy::from_secs(60));
        store.close().await;
        assert!(matches!(store.station_count().await, Err(StoreError::Closed)));
        store.reopen();
        assert_eq!(store.station_count().await.unwrap(), 0);
    }
}
