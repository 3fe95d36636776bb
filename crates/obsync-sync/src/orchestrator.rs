//! Sync orchestration: observation and station jobs expressed as stage pipelines.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obsync_catalog::{CatalogConnector, CatalogError, CatalogQuery, CatalogSession};
use obsync_core::{DataObject, Station, Watermark};
use obsync_storage::{write_observations_chunked, ObservationStore, StoreConnector, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::pipeline::{Decision, FailurePolicy, Pipeline, Stage};
use crate::reconcile::reconcile_stations;
use crate::transform::{RecordTransformer, Table, TransformError, TransformOutcome};
use crate::watermark::resolve_watermark;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync run is already in progress")]
    AlreadyRunning,
    #[error("opening catalog session")]
    Session(#[source] CatalogError),
    #[error("discovering data objects")]
    Discovery(#[source] CatalogError),
    #[error("data object {file_name} for station {station_id} failed")]
    Object {
        station_id: String,
        file_name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("persistence failed")]
    Persistence(#[from] StoreError),
    #[error("run cancelled after {processed} data objects")]
    Cancelled { processed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Observations,
    Stations,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub run_id: Uuid,
    pub job: JobKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub discovered_objects: usize,
    pub processed_objects: usize,
    pub failed_objects: usize,
    pub accepted_records: usize,
    pub skipped_records: usize,
    pub rejected_records: usize,
    pub written_records: usize,
    pub purged_records: u64,
    pub stations_discovered: usize,
    pub stations_written: usize,
    pub stations_failed: usize,
}

impl JobSummary {
    fn new(run_id: Uuid, job: JobKind, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            job,
            started_at,
            finished_at: None,
            discovered_objects: 0,
            processed_objects: 0,
            failed_objects: 0,
            accepted_records: 0,
            skipped_records: 0,
            rejected_records: 0,
            written_records: 0,
            purged_records: 0,
            stations_discovered: 0,
            stations_written: 0,
            stations_failed: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub stations: JobSummary,
    pub observations: JobSummary,
}

/// Job-level state shared by every stage of one run.
pub struct JobContext {
    pub run_id: Uuid,
    pub kind: JobKind,
    /// Reference instant for the discovery window and the retention sweep.
    pub now: DateTime<Utc>,
    pub summary: JobSummary,
    config: Arc<SyncConfig>,
    store_connector: Arc<dyn StoreConnector>,
    catalog_connector: Arc<dyn CatalogConnector>,
    cancel: CancellationToken,
    transformer: Arc<RecordTransformer>,
    store: Option<Arc<dyn ObservationStore>>,
    session: Option<Arc<dyn CatalogSession>>,
    objects: Vec<DataObject>,
    stations: Vec<Station>,
}

impl JobContext {
    fn store(&self) -> Result<Arc<dyn ObservationStore>> {
        self.store.clone().context("store is not connected")
    }

    fn session(&self) -> Result<Arc<dyn CatalogSession>> {
        self.session.clone().context("catalog session is not open")
    }
}

/// Per-object state for one pass of the task pipeline.
pub struct TaskContext {
    pub run_id: Uuid,
    pub object: DataObject,
    pub watermark: Watermark,
    /// Rows older than this are already expired and are never written.
    pub retained_from: DateTime<Utc>,
    pub accepted: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub written: usize,
    store: Arc<dyn ObservationStore>,
    session: Arc<dyn CatalogSession>,
    transformer: Arc<RecordTransformer>,
    variable: String,
    chunk_size: usize,
    payload: Option<Vec<u8>>,
    outcome: Option<TransformOutcome>,
}

struct ConnectStore;

#[async_trait]
impl Stage<JobContext> for ConnectStore {
    fn name(&self) -> &'static str {
        "connect-store"
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<()> {
        let store = ctx
            .store_connector
            .connect()
            .await
            .map_err(SyncError::Persistence)?;
        info!(backend = store.backend(), "store connected");
        ctx.store = Some(store.clone());
        store.ensure_schema().await.map_err(SyncError::Persistence)?;
        Ok(())
    }
}

struct PurgeExpired;

#[async_trait]
impl Stage<JobContext> for PurgeExpired {
    fn name(&self) -> &'static str {
        "purge-expired"
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<()> {
        let store = ctx.store()?;
        let purged = store
            .purge_expired(ctx.now)
            .await
            .map_err(SyncError::Persistence)?;
        if purged > 0 {
            info!(
                purged,
                retention_secs = store.retention().retention_secs,
                "expired observations removed"
            );
        }
        ctx.summary.purged_records = purged;
        Ok(())
    }
}

struct OpenSession;

#[async_trait]
impl Stage<JobContext> for OpenSession {
    fn name(&self) -> &'static str {
        "open-session"
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<()> {
        let session = ctx
            .catalog_connector
            .connect(ctx.run_id)
            .await
            .map_err(SyncError::Session)?;
        ctx.session = Some(Arc::from(session));
        Ok(())
    }
}

struct DiscoverObjects;

#[async_trait]
impl Stage<JobContext> for DiscoverObjects {
    fn name(&self) -> &'static str {
        "discover"
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<()> {
        let session = ctx.session()?;
        let query = match ctx.kind {
            JobKind::Observations => CatalogQuery::for_history(
                ctx.config.object_spec_filter.clone(),
                ctx.config.history_secs,
                ctx.now,
            ),
            JobKind::Stations => CatalogQuery::for_history(
                ctx.config.station_spec_filter.clone(),
                ctx.config.history_secs,
                ctx.now,
            )
            .without_sampling_height(),
        };
        let objects = session
            .discover(&query)
            .await
            .map_err(SyncError::Discovery)?;
        info!(
            discovered = objects.len(),
            filter = %query.spec_filter,
            since = %query.since,
            "catalog discovery complete"
        );
        ctx.summary.discovered_objects = objects.len();
        ctx.objects = objects;
        Ok(())
    }
}

/// Runs the task pipeline for each object, oldest submission first, one at a time.
struct ProcessObjects;

#[async_trait]
impl Stage<JobContext> for ProcessObjects {
    fn name(&self) -> &'static str {
        "process-objects"
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<()> {
        let store = ctx.store()?;
        let session = ctx.session()?;
        let policy = FailurePolicy::from_fault_tolerant(ctx.config.observations_fault_tolerant);
        let tasks = observation_task_pipeline();
        let retained_from = store.retention().cutoff(ctx.now);

        let mut objects = std::mem::take(&mut ctx.objects);
        objects.sort_by_key(|object| object.submitted_at);

        for object in objects {
            if ctx.cancel.is_cancelled() {
                warn!(
                    processed = ctx.summary.processed_objects,
                    "cancellation requested; stopping"
                );
                return Err(SyncError::Cancelled {
                    processed: ctx.summary.processed_objects,
                }
                .into());
            }

            let span = info_span!(
                "sync_object",
                station_id = %object.station_id(),
                file = %object.file_name
            );
            let mut task = TaskContext {
                run_id: ctx.run_id,
                object,
                watermark: None,
                retained_from,
                accepted: 0,
                skipped: 0,
                rejected: 0,
                written: 0,
                store: store.clone(),
                session: session.clone(),
                transformer: ctx.transformer.clone(),
                variable: ctx.config.primary_variable().to_string(),
                chunk_size: ctx.config.chunk_size,
                payload: None,
                outcome: None,
            };
            let result = tasks.run(&mut task).instrument(span).await;

            ctx.summary.accepted_records += task.accepted;
            ctx.summary.skipped_records += task.skipped;
            ctx.summary.rejected_records += task.rejected;
            ctx.summary.written_records += task.written;

            let Err(err) = result else {
                ctx.summary.processed_objects += 1;
                continue;
            };
            if err.chain().any(|cause| cause.is::<StoreError>()) {
                return Err(err);
            }

            ctx.summary.failed_objects += 1;
            warn!(
                station_id = %task.object.station_id(),
                file = %task.object.file_name,
                error = %format!("{err:#}"),
                "data object failed"
            );
            if policy.decide() == Decision::Abort {
                return Err(SyncError::Object {
                    station_id: task.object.station_id().to_string(),
                    file_name: task.object.file_name.clone(),
                    source: err.into(),
                }
                .into());
            }
        }
        Ok(())
    }
}

struct ReconcileStations;

#[async_trait]
impl Stage<JobContext> for ReconcileStations {
    fn name(&self) -> &'static str {
        "reconcile-stations"
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<()> {
        let objects = std::mem::take(&mut ctx.objects);
        ctx.stations = reconcile_stations(objects.iter().map(|object| &object.station));
        ctx.summary.stations_discovered = ctx.stations.len();
        info!(
            rows = objects.len(),
            stations = ctx.stations.len(),
            "stations reconciled"
        );
        Ok(())
    }
}

/// Upserts stations in chunks; under the tolerant policy a failed chunk is retried
/// station by station so one bad document cannot block the others.
struct WriteStations;

#[async_trait]
impl Stage<JobContext> for WriteStations {
    fn name(&self) -> &'static str {
        "write-stations"
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<()> {
        let store = ctx.store()?;
        let policy = FailurePolicy::from_fault_tolerant(ctx.config.stations_fault_tolerant);
        let stations = std::mem::take(&mut ctx.stations);
        let mut last_error = None;

        for chunk in stations.chunks(ctx.config.chunk_size.max(1)) {
            match store.upsert_stations(chunk).await {
                Ok(written) => ctx.summary.stations_written += written,
                Err(err) if policy.decide() == Decision::Abort => {
                    return Err(SyncError::Persistence(err).into());
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        size = chunk.len(),
                        "station chunk failed; writing one by one"
                    );
                    for station in chunk {
                        match store.upsert_stations(std::slice::from_ref(station)).await {
                            Ok(written) => ctx.summary.stations_written += written,
                            Err(err) => {
                                ctx.summary.stations_failed += 1;
                                warn!(
                                    station_id = %station.station_id,
                                    error = %err,
                                    "station upsert failed"
                                );
                                last_error = Some(err);
                            }
                        }
                    }
                }
            }
        }

        if ctx.summary.stations_written == 0 {
            if let Some(err) = last_error {
                return Err(SyncError::Persistence(err).into());
            }
        }
        info!(
            written = ctx.summary.stations_written,
            failed = ctx.summary.stations_failed,
            "stations synchronized"
        );
        Ok(())
    }
}

/// Closes the store and drops the catalog session. Idempotent.
struct ReleaseResources;

#[async_trait]
impl Stage<JobContext> for ReleaseResources {
    fn name(&self) -> &'static str {
        "release"
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<()> {
        if let Some(store) = ctx.store.take() {
            store.close().await;
        }
        ctx.session.take();
        ctx.objects.clear();
        ctx.stations.clear();
        Ok(())
    }
}

struct ResolveWatermark;

#[async_trait]
impl Stage<TaskContext> for ResolveWatermark {
    fn name(&self) -> &'static str {
        "resolve-watermark"
    }

    async fn run(&self, task: &mut TaskContext) -> Result<()> {
        let level = task.object.level.ok_or_else(|| TransformError::MissingLevel {
            file_name: task.object.file_name.clone(),
        })?;
        task.watermark = resolve_watermark(
            task.store.as_ref(),
            task.object.station_id(),
            level,
            &task.variable,
        )
        .await
        .map_err(SyncError::Persistence)?;
        Ok(())
    }
}

struct DownloadPayload;

#[async_trait]
impl Stage<TaskContext> for DownloadPayload {
    fn name(&self) -> &'static str {
        "download"
    }

    async fn run(&self, task: &mut TaskContext) -> Result<()> {
        let payload = task
            .session
            .download(&task.object)
            .await
            .with_context(|| format!("downloading {}", task.object.download_url))?;
        task.payload = Some(payload);
        Ok(())
    }
}

struct TransformRecords;

#[async_trait]
impl Stage<TaskContext> for TransformRecords {
    fn name(&self) -> &'static str {
        "transform"
    }

    async fn run(&self, task: &mut TaskContext) -> Result<()> {
        let payload = task.payload.take().context("no payload downloaded")?;
        let table = Table::from_csv(&payload)?;
        let outcome = task.transformer.transform_retained(
            &task.object,
            &table,
            task.watermark,
            Some(task.retained_from),
        )?;

        task.accepted = outcome.accepted();
        task.skipped = outcome.skipped;
        task.rejected = outcome.rejected;
        let station_id = task.object.station_id();
        if task.accepted > 0 {
            info!(
                station_id,
                accepted = task.accepted,
                skipped = task.skipped,
                rejected = task.rejected,
                "found {} new observations for station {}",
                task.accepted,
                station_id
            );
        } else {
            info!(
                station_id,
                skipped = task.skipped,
                rejected = task.rejected,
                "no new observation data found for station {}",
                station_id
            );
        }
        task.outcome = Some(outcome);
        Ok(())
    }
}

struct PersistObservations;

#[async_trait]
impl Stage<TaskContext> for PersistObservations {
    fn name(&self) -> &'static str {
        "persist"
    }

    async fn run(&self, task: &mut TaskContext) -> Result<()> {
        let Some(outcome) = &task.outcome else {
            return Ok(());
        };
        task.written = write_observations_chunked(
            task.store.as_ref(),
            &outcome.observations,
            task.chunk_size,
        )
        .await
        .map_err(SyncError::Persistence)?;
        Ok(())
    }
}

struct ClearOutputs;

#[async_trait]
impl Stage<TaskContext> for ClearOutputs {
    fn name(&self) -> &'static str {
        "clear-outputs"
    }

    async fn run(&self, task: &mut TaskContext) -> Result<()> {
        task.payload = None;
        task.outcome = None;
        Ok(())
    }
}

pub fn observation_job_pipeline() -> Pipeline<JobContext> {
    Pipeline::new()
        .before(ConnectStore)
        .before(PurgeExpired)
        .before(OpenSession)
        .before(DiscoverObjects)
        .stage(ProcessObjects)
        .after(ReleaseResources)
        .on_error(ReleaseResources)
}

pub fn station_job_pipeline() -> Pipeline<JobContext> {
    Pipeline::new()
        .before(ConnectStore)
        .before(OpenSession)
        .before(DiscoverObjects)
        .stage(ReconcileStations)
        .stage(WriteStations)
        .after(ReleaseResources)
        .on_error(ReleaseResources)
}

pub fn observation_task_pipeline() -> Pipeline<TaskContext> {
    Pipeline::new()
        .before(ResolveWatermark)
        .stage(DownloadPayload)
        .stage(TransformRecords)
        .stage(PersistObservations)
        .after(ClearOutputs)
        .on_error(ClearOutputs)
}

/// Drives sync jobs. At most one job runs at a time per runner.
pub struct SyncRunner {
    config: Arc<SyncConfig>,
    store: Arc<dyn StoreConnector>,
    catalog: Arc<dyn CatalogConnector>,
    transformer: Arc<RecordTransformer>,
    clock: Clock,
    cancel: CancellationToken,
    inflight: Mutex<()>,
}

impl SyncRunner {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn StoreConnector>,
        catalog: Arc<dyn CatalogConnector>,
    ) -> Self {
        let transformer = Arc::new(RecordTransformer::new(
            config.time_column.clone(),
            config.variables.clone(),
        ));
        Self {
            config: Arc::new(config),
            store,
            catalog,
            transformer,
            clock: Arc::new(Utc::now),
            cancel: CancellationToken::new(),
            inflight: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Cancelling stops a running observation job before its next data object.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn sync_observations(&self) -> Result<JobSummary> {
        let _guard = self.begin()?;
        self.run_job(JobKind::Observations).await
    }

    pub async fn sync_stations(&self) -> Result<JobSummary> {
        let _guard = self.begin()?;
        self.run_job(JobKind::Stations).await
    }

    /// Stations first, then observations, under one single-flight guard.
    pub async fn sync_all(&self) -> Result<SyncRunSummary> {
        let _guard = self.begin()?;
        let stations = self.run_job(JobKind::Stations).await?;
        let observations = self.run_job(JobKind::Observations).await?;
        Ok(SyncRunSummary {
            stations,
            observations,
        })
    }

    /// Create collections and indexes, then disconnect.
    pub async fn migrate(&self) -> Result<()> {
        let _guard = self.begin()?;
        let store = self.store.connect().await.context("connecting to store")?;
        let result = store.ensure_schema().await.context("creating schema");
        store.close().await;
        result
    }

    /// Run the retention sweep alone. Returns the number of removed observations.
    pub async fn purge(&self) -> Result<u64> {
        let _guard = self.begin()?;
        let store = self.store.connect().await.context("connecting to store")?;
        let result = store
            .purge_expired((self.clock)())
            .await
            .context("purging expired observations");
        store.close().await;
        result
    }

    fn begin(&self) -> Result<MutexGuard<'_, ()>, SyncError> {
        self.inflight.try_lock().map_err(|_| SyncError::AlreadyRunning)
    }

    async fn run_job(&self, kind: JobKind) -> Result<JobSummary> {
        let run_id = Uuid::new_v4();
        let now = (self.clock)();
        let mut ctx = JobContext {
            run_id,
            kind,
            now,
            summary: JobSummary::new(run_id, kind, now),
            config: self.config.clone(),
            store_connector: self.store.clone(),
            catalog_connector: self.catalog.clone(),
            cancel: self.cancel.clone(),
            transformer: self.transformer.clone(),
            store: None,
            session: None,
            objects: Vec::new(),
            stations: Vec::new(),
        };
        let pipeline = match kind {
            JobKind::Observations => observation_job_pipeline(),
            JobKind::Stations => station_job_pipeline(),
        };

        let span = info_span!("sync_job", %run_id, job = ?kind);
        let result = pipeline.run(&mut ctx).instrument(span).await;
        ctx.summary.finished_at = Some(Utc::now());

        match result {
            Ok(()) => {
                info!(
                    %run_id,
                    job = ?kind,
                    discovered = ctx.summary.discovered_objects,
                    accepted = ctx.summary.accepted_records,
                    skipped = ctx.summary.skipped_records,
                    failed = ctx.summary.failed_objects,
                    stations = ctx.summary.stations_written,
                    "sync job complete"
                );
                Ok(ctx.summary)
            }
            Err(err) => {
                error!(%run_id, job = ?kind, error = %format!("{err:#}"), "sync job failed");
                Err(err)
            }
        }
    }
}
