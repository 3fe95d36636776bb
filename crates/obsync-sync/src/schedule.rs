//! Cron trigger for recurring full syncs.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::orchestrator::{SyncError, SyncRunner};

/// Scheduler firing `sync_all` on the configured cron, or `None` when disabled.
///
/// A trigger that lands while a previous run is still active is skipped.
pub async fn maybe_build_scheduler(runner: Arc<SyncRunner>) -> Result<Option<JobScheduler>> {
    if !runner.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = runner.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let runner = runner.clone();
        Box::pin(async move {
            match runner.sync_all().await {
                Ok(summary) => info!(
                    stations = summary.stations.stations_written,
                    accepted = summary.observations.accepted_records,
                    "scheduled sync finished"
                ),
                Err(err)
                    if matches!(
                        err.downcast_ref::<SyncError>(),
                        Some(SyncError::AlreadyRunning)
                    ) =>
                {
                    warn!("previous sync still running; trigger skipped")
                }
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
