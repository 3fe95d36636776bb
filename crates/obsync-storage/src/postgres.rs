//! PostgreSQL backend. Documents are rows with a JSONB payload and a generated point column.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obsync_core::{Observation, Station, Watermark};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use crate::store::{
    ObservationStore, RetentionPolicy, StoreConnector, StoreError, MAX_CHUNK_SIZE,
};

const OBSERVATION_INSERT_COLUMNS: &[&str] = &[
    "station_id",
    "station_name",
    "level",
    "time",
    "longitude",
    "latitude",
    "altitude",
    "variables",
];

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS stations (
    station_id TEXT NOT NULL,
    station_name TEXT NOT NULL,
    longitude DOUBLE PRECISION NOT NULL,
    latitude DOUBLE PRECISION NOT NULL,
    altitude DOUBLE PRECISION NOT NULL,
    position POINT GENERATED ALWAYS AS (point(longitude, latitude)) STORED,
    feature JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX IF NOT EXISTS stations_station_id_key ON stations (station_id);
CREATE INDEX IF NOT EXISTS stations_position_gist ON stations USING gist (position);
CREATE TABLE IF NOT EXISTS observations (
    id BIGSERIAL PRIMARY KEY,
    station_id TEXT NOT NULL,
    station_name TEXT NOT NULL,
    level DOUBLE PRECISION NOT NULL,
    time TIMESTAMPTZ NOT NULL,
    longitude DOUBLE PRECISION NOT NULL,
    latitude DOUBLE PRECISION NOT NULL,
    altitude DOUBLE PRECISION NOT NULL,
    position POINT GENERATED ALWAYS AS (point(longitude, latitude)) STORED,
    variables JSONB NOT NULL,
    inserted_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS observations_station_id_idx ON observations (station_id);
CREATE INDEX IF NOT EXISTS observations_station_time_idx ON observations (station_id, time DESC);
CREATE INDEX IF NOT EXISTS observations_station_level_time_idx ON observations (station_id, level, time DESC);
CREATE INDEX IF NOT EXISTS observations_position_gist ON observations USING gist (position);
CREATE INDEX IF NOT EXISTS observations_expiry_idx ON observations (time)
"#;

// `level = $2` is exact float equality: heights that differ only below f64
// precision, or a stream whose catalog height text changes, split into two
// watermarks. Known risk, left unnormalized.
const LATEST_TIME_SQL: &str = "SELECT time FROM observations \
     WHERE station_id = $1 AND level = $2 AND variables ? $3 \
     ORDER BY time DESC LIMIT 1";

const UPSERT_STATION_SQL: &str = "INSERT INTO stations \
     (station_id, station_name, longitude, latitude, altitude, feature, updated_at) \
     VALUES ($1, $2, $3, $4, $5, $6, now()) \
     ON CONFLICT (station_id) DO UPDATE SET \
     station_name = EXCLUDED.station_name, \
     longitude = EXCLUDED.longitude, \
     latitude = EXCLUDED.latitude, \
     altitude = EXCLUDED.altitude, \
     feature = EXCLUDED.feature, \
     updated_at = EXCLUDED.updated_at";

/// Split the bootstrap script into individual statements.
pub fn schema_statements() -> Vec<&'static str> {
    SCHEMA_SQL
        .split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .collect()
}

pub struct PgObservationStore {
    pool: PgPool,
    retention: RetentionPolicy,
}

impl PgObservationStore {
    pub async fn connect(
        database_url: &str,
        retention: RetentionPolicy,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(StoreError::Connect)?;
        Ok(Self { pool, retention })
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.pool.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Connects a fresh pool per run; the run closes it on exit.
#[derive(Debug, Clone)]
pub struct PgConnector {
    database_url: String,
    retention: RetentionPolicy,
}

impl PgConnector {
    pub fn new(database_url: impl Into<String>, retention: RetentionPolicy) -> Self {
        Self {
            database_url: database_url.into(),
            retention,
        }
    }
}

#[async_trait]
impl StoreConnector for PgConnector {
    async fn connect(&self) -> Result<Arc<dyn ObservationStore>, StoreError> {
        let store = PgObservationStore::connect(&self.database_url, self.retention).await?;
        Ok(Arc::new(store))
    }
}

#[async_trait]
impl ObservationStore for PgObservationStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        for statement in schema_statements() {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::query("creating schema"))?;
        }
        info!(retention_secs = self.retention.retention_secs, "store schema ready");
        Ok(())
    }

    async fn latest_observation_time(
        &self,
        station_id: &str,
        level: f64,
        variable: &str,
    ) -> Result<Watermark, StoreError> {
        self.ensure_open()?;
        sqlx::query_scalar::<_, DateTime<Utc>>(LATEST_TIME_SQL)
            .bind(station_id)
            .bind(level)
            .bind(variable)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::query("reading watermark"))
    }

    async fn insert_observations(&self, batch: &[Observation]) -> Result<usize, StoreError> {
        self.ensure_open()?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut written = 0usize;
        for rows in batch.chunks(MAX_CHUNK_SIZE) {
            let mut variables = Vec::with_capacity(rows.len());
            for observation in rows {
                variables.push(values_document(observation)?);
            }

            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO observations ({}) ",
                OBSERVATION_INSERT_COLUMNS.join(", ")
            ));
            builder.push_values(rows.iter().zip(variables), |mut row, (obs, doc)| {
                row.push_bind(obs.station_id.clone())
                    .push_bind(obs.station_name.clone())
                    .push_bind(obs.level)
                    .push_bind(obs.time)
                    .push_bind(obs.geometry.longitude)
                    .push_bind(obs.geometry.latitude)
                    .push_bind(obs.geometry.altitude)
                    .push_bind(doc);
            });

            let result = builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(StoreError::query("inserting observations"))?;
            debug!(rows = result.rows_affected(), "observations inserted");
            written += result.rows_affected() as usize;
        }
        Ok(written)
    }

    async fn upsert_stations(&self, stations: &[Station]) -> Result<usize, StoreError> {
        self.ensure_open()?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::query("opening station transaction"))?;
        for station in stations {
            sqlx::query(UPSERT_STATION_SQL)
                .bind(&station.station_id)
                .bind(&station.station_name)
                .bind(station.longitude)
                .bind(station.latitude)
                .bind(station.altitude)
                .bind(station.to_feature())
                .execute(&mut *tx)
                .await
                .map_err(StoreError::query("upserting station"))?;
        }
        tx.commit()
            .await
            .map_err(StoreError::query("committing station transaction"))?;
        Ok(stations.len())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let result = sqlx::query("DELETE FROM observations WHERE time < $1")
            .bind(self.retention.cutoff(now))
            .execute(&self.pool)
            .await
            .map_err(StoreError::query("purging expired observations"))?;
        Ok(result.rows_affected())
    }

    async fn station_count(&self) -> Result<usize, StoreError> {
        self.ensure_open()?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stations")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::query("counting stations"))?;
        Ok(count.max(0) as usize)
    }

    async fn observation_count(&self, station_id: &str, level: f64) -> Result<usize, StoreError> {
        self.ensure_open()?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM observations WHERE station_id = $1 AND level = $2",
        )
        .bind(station_id)
        .bind(level)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::query("counting observations"))?;
        Ok(count.max(0) as usize)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn values_document(observation: &Observation) -> Result<serde_json::Value, StoreError> {
    let values: BTreeMap<&str, Option<f64>> = observation
        .values
        .iter()
        .map(|(name, value)| (name.as_str(), value.is_finite().then_some(*value)))
        .collect();
    Ok(serde_json::to_value(values)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use obsync_core::PointGeometry;

    #[test]
    fn schema_covers_every_declared_index() {
        let statements = schema_statements();
        assert_eq!(statements.len(), 9);
        assert!(statements
            .iter()
            .any(|s| s.contains("UNIQUE INDEX") && s.contains("stations (station_id)")));
        assert!(statements
            .iter()
            .any(|s| s.contains("(station_id, level, time DESC)")));
        assert_eq!(
            statements.iter().filter(|s| s.contains("USING gist")).count(),
            2
        );
    }

    #[test]
    fn largest_chunk_fits_the_bind_parameter_limit() {
        let binds = MAX_CHUNK_SIZE * OBSERVATION_INSERT_COLUMNS.len();
        assert!(binds <= u16::MAX as usize);
        assert!(binds + OBSERVATION_INSERT_COLUMNS.len() > u16::MAX as usize);
    }

    #[test]
    fn watermark_query_is_index_ordered_and_limited() {
        assert!(LATEST_TIME_SQL.contains("ORDER BY time DESC LIMIT 1"));
        assert!(LATEST_TIME_SQL.contains("variables ? $3"));
    }

    #[test]
    fn stored_values_encode_nan_as_null() {
        let observation = Observation {
            time: Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).single().unwrap(),
            level: 2.0,
            station_id: "S1".into(),
            station_name: "One".into(),
            values: BTreeMap::from([("rn".to_string(), f64::NAN), ("co2".to_string(), 412.5)]),
            geometry: PointGeometry::new(0.0, 0.0, 2.0),
        };
        let doc = values_document(&observation).unwrap();
        assert_eq!(doc, serde_json::json!({"co2": 412.5, "rn": null}));
    }
}
