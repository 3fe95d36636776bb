//! Watermark resolution against the store.

use obsync_core::Watermark;
use obsync_storage::{ObservationStore, StoreError};
use tracing::debug;

/// Latest stored time for (station, level) among rows carrying `variable`.
///
/// `None` is the expected state for a pair that was never ingested. Never cached.
pub async fn resolve_watermark(
    store: &dyn ObservationStore,
    station_id: &str,
    level: f64,
    variable: &str,
) -> Result<Watermark, StoreError> {
    let watermark = store
        .latest_observation_time(station_id, level, variable)
        .await?;
    match watermark {
        Some(latest) => debug!(station_id, level, %latest, "resolved watermark"),
        None => debug!(station_id, level, "no stored observations yet"),
    }
    Ok(watermark)
}
