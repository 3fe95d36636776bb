//! Tabular payload -> point observations, filtered against the watermark.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use obsync_core::{coerce_number, DataObject, Observation, PointGeometry, Watermark};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("reading csv payload: {0}")]
    Csv(#[from] csv::Error),
    #[error("payload has no `{column}` column")]
    MissingColumn { column: String },
    #[error("data object {file_name} has no measurement level")]
    MissingLevel { file_name: String },
}

/// Header + rows of one downloaded CSV.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Parse a comma-separated payload with a header row. `#` lines are comments.
    pub fn from_csv(payload: &[u8]) -> Result<Self, TransformError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .from_reader(payload);

        let columns = reader
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            rows.push(record?.iter().map(str::to_string).collect());
        }
        Ok(Self { columns, rows })
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Per-object transform result; counts feed the run summary and logs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOutcome {
    /// Accepted observations, ascending by time.
    pub observations: Vec<Observation>,
    /// Rows at or before the watermark, or repeating an accepted time.
    pub skipped: usize,
    /// Rows whose timestamp could not be read.
    pub rejected: usize,
}

impl TransformOutcome {
    pub fn accepted(&self) -> usize {
        self.observations.len()
    }
}

#[derive(Debug, Clone)]
pub struct RecordTransformer {
    time_column: String,
    variables: Vec<String>,
}

impl RecordTransformer {
    pub fn new(time_column: impl Into<String>, variables: Vec<String>) -> Self {
        Self {
            time_column: time_column.into(),
            variables,
        }
    }

    /// Pure: the store is never touched here.
    pub fn transform(
        &self,
        object: &DataObject,
        table: &Table,
        watermark: Watermark,
    ) -> Result<TransformOutcome, TransformError> {
        self.transform_retained(object, table, watermark, None)
    }

    /// As [`transform`](Self::transform), additionally skipping rows older than
    /// `retained_from`. Those would be removed by the next retention sweep, which
    /// would drop the watermark and let the same rows in again.
    pub fn transform_retained(
        &self,
        object: &DataObject,
        table: &Table,
        watermark: Watermark,
        retained_from: Option<DateTime<Utc>>,
    ) -> Result<TransformOutcome, TransformError> {
        let level = object.level.ok_or_else(|| TransformError::MissingLevel {
            file_name: object.file_name.clone(),
        })?;
        let time_index =
            table
                .column_index(&self.time_column)
                .ok_or_else(|| TransformError::MissingColumn {
                    column: self.time_column.clone(),
                })?;
        let variable_indexes: Vec<(&str, Option<usize>)> = self
            .variables
            .iter()
            .map(|name| (name.as_str(), table.column_index(name)))
            .collect();

        let station = object.station.normalize();
        let geometry = PointGeometry::new(
            station.longitude,
            station.latitude,
            station.altitude + level,
        );

        let mut outcome = TransformOutcome::default();
        let mut seen = HashSet::new();
        for row in &table.rows {
            let Some(time) = row.get(time_index).and_then(|raw| parse_timestamp(raw)) else {
                outcome.rejected += 1;
                continue;
            };
            let expired = retained_from.is_some_and(|cutoff| time < cutoff);
            let already_stored = watermark.is_some_and(|latest| time <= latest);
            if expired || already_stored || !seen.insert(time) {
                outcome.skipped += 1;
                continue;
            }

            let values: BTreeMap<String, f64> = variable_indexes
                .iter()
                .map(|(name, index)| {
                    let value = index
                        .and_then(|i| row.get(i))
                        .map(|raw| coerce_number(raw))
                        .unwrap_or(f64::NAN);
                    (name.to_string(), value)
                })
                .collect();

            outcome.observations.push(Observation {
                time,
                level,
                station_id: station.station_id.clone(),
                station_name: station.station_name.clone(),
                values,
                geometry,
            });
        }

        outcome.observations.sort_by_key(|obs| obs.time);
        Ok(outcome)
    }
}

/// UTC timestamps as written by the portal; naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
