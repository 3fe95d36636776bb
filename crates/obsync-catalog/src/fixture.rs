//! Fixture-first catalog: discovery rows and CSV payloads served from memory or disk.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use obsync_core::DataObject;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{parse_discovery, CatalogConnector, CatalogError, CatalogQuery, CatalogSession};

#[derive(Debug, Default)]
struct FixtureState {
    objects: Vec<DataObject>,
    payloads: HashMap<String, Vec<u8>>,
    fail_discovery: bool,
    queries: Vec<CatalogQuery>,
}

#[derive(Debug, Default)]
struct SessionCounters {
    opened: AtomicUsize,
    released: AtomicUsize,
}

/// Connector whose sessions answer from fixtures instead of the network.
#[derive(Debug, Clone, Default)]
pub struct FixtureCatalog {
    state: Arc<RwLock<FixtureState>>,
    counters: Arc<SessionCounters>,
}

impl FixtureCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `discovery.json` (SPARQL JSON) and every CSV named by it from `dir/objects/`.
    pub async fn from_dir(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let discovery_path = dir.join("discovery.json");
        let body = tokio::fs::read(&discovery_path)
            .await
            .with_context(|| format!("reading {}", discovery_path.display()))?;
        let objects = parse_discovery(&body)
            .with_context(|| format!("parsing {}", discovery_path.display()))?;

        let catalog = Self::new();
        for object in &objects {
            let payload_path = dir.join("objects").join(&object.file_name);
            if let Ok(payload) = tokio::fs::read(&payload_path).await {
                catalog.set_payload(&object.download_url, payload).await;
            }
        }
        catalog.set_objects(objects).await;
        Ok(catalog)
    }

    pub async fn set_objects(&self, objects: Vec<DataObject>) {
        self.state.write().await.objects = objects;
    }

    pub async fn set_payload(&self, download_url: &str, payload: impl Into<Vec<u8>>) {
        self.state
            .write()
            .await
            .payloads
            .insert(download_url.to_string(), payload.into());
    }

    pub async fn remove_payload(&self, download_url: &str) {
        self.state.write().await.payloads.remove(download_url);
    }

    pub async fn fail_discovery(&self, fail: bool) {
        self.state.write().await.fail_discovery = fail;
    }

    pub async fn queries(&self) -> Vec<CatalogQuery> {
        self.state.read().await.queries.clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_released(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogConnector for FixtureCatalog {
    async fn connect(&self, _run_id: Uuid) -> Result<Box<dyn CatalogSession>, CatalogError> {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FixtureSession {
            state: self.state.clone(),
            counters: self.counters.clone(),
        }))
    }
}

pub struct FixtureSession {
    state: Arc<RwLock<FixtureState>>,
    counters: Arc<SessionCounters>,
}

impl Drop for FixtureSession {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CatalogSession for FixtureSession {
    async fn discover(&self, query: &CatalogQuery) -> Result<Vec<DataObject>, CatalogError> {
        let mut state = self.state.write().await;
        state.queries.push(query.clone());
        if state.fail_discovery {
            return Err(CatalogError::Session(anyhow::anyhow!(
                "catalog endpoint unreachable"
            )));
        }
        Ok(state.objects.clone())
    }

    async fn download(&self, object: &DataObject) -> Result<Vec<u8>, CatalogError> {
        self.state
            .read()
            .await
            .payloads
            .get(&object.download_url)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound {
                url: object.download_url.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use obsync_core::StationAttributes;

    fn object(url: &str) -> DataObject {
        DataObject {
            object_url: url.to_string(),
            download_url: url.to_string(),
            file_name: "a.csv".into(),
            station: StationAttributes {
                station_id: "S1".into(),
                ..Default::default()
            },
            level: Some(2.0),
            submitted_at: None,
        }
    }

    #[tokio::test]
    async fn sessions_are_counted_when_dropped() {
        let catalog = FixtureCatalog::new();
        catalog.set_objects(vec![object("https://x/1")]).await;
        catalog.set_payload("https://x/1", "TIMESTAMP,rn\n").await;

        let session = catalog.connect(Uuid::new_v4()).await.unwrap();
        let query = CatalogQuery::for_history("radon", 60, Utc::now());
        let objects = session.discover(&query).await.unwrap();
        assert_eq!(session.download(&objects[0]).await.unwrap(), b"TIMESTAMP,rn\n");
        assert_eq!(catalog.sessions_released(), 0);
        drop(session);

        assert_eq!(catalog.sessions_opened(), 1);
        assert_eq!(catalog.sessions_released(), 1);
        assert_eq!(catalog.queries().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_payload_is_not_found() {
        let catalog = FixtureCatalog::new();
        let session = catalog.connect(Uuid::new_v4()).await.unwrap();
        let err = session.download(&object("https://x/2")).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { .. }));
    }

    #[tokio::test]
    async fn loads_discovery_and_payloads_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = r#"{"results":{"bindings":[{
            "object":{"value":"https://meta.icos-cp.eu/objects/abc"},
            "fileName":{"value":"HTM_RN.zip"},
            "stationId":{"value":"HTM"},
            "samplingHeight":{"value":"150.0"}
        }]}}"#;
        tokio::fs::write(dir.path().join("discovery.json"), discovery)
            .await
            .unwrap();
        tokio::fs::create_dir(dir.path().join("objects")).await.unwrap();
        tokio::fs::write(dir.path().join("objects").join("HTM_RN.csv"), "TIMESTAMP,rn\n")
            .await
            .unwrap();

        let catalog = FixtureCatalog::from_dir(dir.path()).await.unwrap();
        let session = catalog.connect(Uuid::new_v4()).await.unwrap();
        let objects = session
            .discover(&CatalogQuery::for_history("radon", 60, Utc::now()))
            .await
            .unwrap();

        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].download_url, "https://data.icos-cp.eu/csv/abc");
        assert_eq!(objects[0].level, Some(150.0));
        assert_eq!(session.download(&objects[0]).await.unwrap(), b"TIMESTAMP,rn\n");
    }
}
