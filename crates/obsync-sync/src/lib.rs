//! Incremental sync of catalog data objects into the observation store.

mod config;
mod orchestrator;
mod pipeline;
mod reconcile;
mod schedule;
mod transform;
mod watermark;

use std::sync::Arc;

use anyhow::Result;
use obsync_catalog::IcosCatalog;
use obsync_storage::PgConnector;

pub use config::SyncConfig;
pub use orchestrator::{
    observation_job_pipeline, observation_task_pipeline, station_job_pipeline, Clock, JobContext,
    JobKind, JobSummary, SyncError, SyncRunSummary, SyncRunner, TaskContext,
};
pub use pipeline::{Decision, FailurePolicy, Pipeline, Stage};
pub use reconcile::{reconcile_stations, StationReconciler};
pub use schedule::maybe_build_scheduler;
pub use transform::{parse_timestamp, RecordTransformer, Table, TransformError, TransformOutcome};
pub use watermark::resolve_watermark;

pub const CRATE_NAME: &str = "obsync-sync";

/// Runner wired to PostgreSQL and the live catalog from environment configuration.
pub fn runner_from_env() -> SyncRunner {
    let config = SyncConfig::from_env();
    let store = Arc::new(PgConnector::new(
        config.database_url.clone(),
        config.retention(),
    ));
    let catalog = Arc::new(IcosCatalog::new(config.catalog_config()));
    SyncRunner::new(config, store, catalog)
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    runner_from_env().sync_all().await
}
