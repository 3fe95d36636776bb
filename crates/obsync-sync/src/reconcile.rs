//! Station reconciliation: one canonical document per station id per run.

use std::collections::HashMap;

use obsync_core::{Station, StationAttributes};
use tracing::debug;

/// Merges repeated discoveries by `station_id`; the last one observed wins.
#[derive(Debug, Default)]
pub struct StationReconciler {
    order: Vec<String>,
    by_id: HashMap<String, Station>,
    observed: usize,
    ignored: usize,
}

impl StationReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, attributes: &StationAttributes) {
        self.observed += 1;
        let station = attributes.normalize();
        if station.station_id.is_empty() {
            self.ignored += 1;
            return;
        }
        if !self.by_id.contains_key(&station.station_id) {
            self.order.push(station.station_id.clone());
        } else {
            debug!(station_id = %station.station_id, "station rediscovered; replacing");
        }
        self.by_id.insert(station.station_id.clone(), station);
    }

    pub fn observed(&self) -> usize {
        self.observed
    }

    pub fn ignored(&self) -> usize {
        self.ignored
    }

    /// Canonical stations in first-discovery order.
    pub fn finish(self) -> Vec<Station> {
        let Self {
            order, mut by_id, ..
        } = self;
        order.iter().filter_map(|id| by_id.remove(id)).collect()
    }
}

pub fn reconcile_stations<'a, I>(discovered: I) -> Vec<Station>
where
    I: IntoIterator<Item = &'a StationAttributes>,
{
    let mut reconciler = StationReconciler::new();
    for attributes in discovered {
        reconciler.observe(attributes);
    }
    reconciler.finish()
}
