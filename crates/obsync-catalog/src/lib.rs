//! Catalog discovery contracts + the ICOS carbon portal implementation.

mod fixture;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use obsync_core::{coerce_number, DataObject, StationAttributes};
use obsync_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub use fixture::{FixtureCatalog, FixtureSession};

pub const CRATE_NAME: &str = "obsync-catalog";

pub const DEFAULT_SPARQL_URL: &str = "https://meta.icos-cp.eu/sparql";
pub const DEFAULT_AUTH_URL: &str = "https://cpauth.icos-cp.eu/password/login";

const METADATA_OBJECT_PREFIX: &str = "meta.icos-cp.eu/objects";
const CSV_OBJECT_PREFIX: &str = "data.icos-cp.eu/csv";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed catalog response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("catalog row {row} is missing binding `{binding}`")]
    MissingBinding { row: usize, binding: &'static str },
    #[error("catalog session failed: {0}")]
    Session(#[source] anyhow::Error),
    #[error("no payload available for {url}")]
    NotFound { url: String },
}

/// Parameterized discovery query: objects whose spec label contains `spec_filter`,
/// submitted after `since`, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogQuery {
    pub spec_filter: String,
    pub since: DateTime<Utc>,
    pub with_sampling_height: bool,
}

impl CatalogQuery {
    pub fn for_history(
        spec_filter: impl Into<String>,
        history_secs: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            spec_filter: spec_filter.into(),
            since: now - Duration::seconds(history_secs.max(0)),
            with_sampling_height: true,
        }
    }

    pub fn without_sampling_height(mut self) -> Self {
        self.with_sampling_height = false;
        self
    }

    pub fn to_sparql(&self) -> String {
        let (height_var, height_triple) = if self.with_sampling_height {
            (
                " ?samplingHeight",
                "\n  ?acquisition cpmeta:hasSamplingHeight ?samplingHeight .",
            )
        } else {
            ("", "")
        };
        format!(
            r#"prefix cpmeta: <http://meta.icos-cp.eu/ontologies/cpmeta/>
prefix prov: <http://www.w3.org/ns/prov#>
prefix rdfs: <http://www.w3.org/2000/01/rdf-schema#>
prefix xsd: <http://www.w3.org/2001/XMLSchema#>

select (str(?submTime) as ?time) ?object ?spec ?fileName ?station{height_var} ?stationId ?stationName ?latitude ?longitude ?altitude where {{
  ?object cpmeta:hasObjectSpec ?specUri .
  ?object cpmeta:wasSubmittedBy/prov:endedAtTime ?submTime .
  ?object cpmeta:hasName ?fileName .
  ?object cpmeta:wasAcquiredBy ?acquisition .
  ?acquisition prov:wasAssociatedWith ?station .{height_triple}
  ?station cpmeta:hasLatitude ?latitude .
  ?station cpmeta:hasLongitude ?longitude .
  ?station cpmeta:hasElevation ?altitude .
  ?station cpmeta:hasStationId ?stationId .
  ?station cpmeta:hasName ?stationName .
  ?specUri rdfs:label ?spec .
  filter contains(?spec, "{filter}")
  filter (?submTime > "{since}"^^xsd:dateTime)
}}
order by desc(?submTime)"#,
            filter = escape_literal(&self.spec_filter),
            since = self.since.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
    }
}

fn escape_literal(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Data is served as CSV from a sibling host of the metadata landing page.
pub fn csv_download_url(object_url: &str) -> String {
    object_url.replace(METADATA_OBJECT_PREFIX, CSV_OBJECT_PREFIX)
}

pub fn csv_file_name(file_name: &str) -> String {
    match file_name.strip_suffix(".zip") {
        Some(stem) => format!("{stem}.csv"),
        None => file_name.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    #[serde(default)]
    bindings: Vec<HashMap<String, SparqlBinding>>,
}

#[derive(Debug, Deserialize)]
struct SparqlBinding {
    value: String,
}

/// Parse a SPARQL JSON result document into discovered objects, in response order.
pub fn parse_discovery(body: &[u8]) -> Result<Vec<DataObject>, CatalogError> {
    let response: SparqlResponse = serde_json::from_slice(body)?;
    response
        .results
        .bindings
        .iter()
        .enumerate()
        .map(|(row, bindings)| row_to_object(row, bindings))
        .collect()
}

fn row_to_object(
    row: usize,
    bindings: &HashMap<String, SparqlBinding>,
) -> Result<DataObject, CatalogError> {
    let optional = |key: &str| bindings.get(key).map(|b| b.value.clone());
    let required = |key: &'static str| {
        optional(key).ok_or(CatalogError::MissingBinding { row, binding: key })
    };

    let object_url = required("object")?;
    let file_name = required("fileName")?;
    let station = StationAttributes {
        station_id: required("stationId")?,
        station_name: optional("stationName").unwrap_or_default(),
        longitude: optional("longitude").unwrap_or_default(),
        latitude: optional("latitude").unwrap_or_default(),
        altitude: optional("altitude").unwrap_or_default(),
    };
    let level = optional("samplingHeight")
        .map(|raw| coerce_number(&raw))
        .filter(|level| !level.is_nan());
    let submitted_at = optional("time")
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|ts| ts.with_timezone(&Utc));

    Ok(DataObject {
        download_url: csv_download_url(&object_url),
        file_name: csv_file_name(&file_name),
        object_url,
        station,
        level,
        submitted_at,
    })
}

/// A live, authenticated conversation with the catalog for one sync run.
///
/// Dropping the session releases it.
#[async_trait]
pub trait CatalogSession: Send + Sync {
    async fn discover(&self, query: &CatalogQuery) -> Result<Vec<DataObject>, CatalogError>;

    async fn download(&self, object: &DataObject) -> Result<Vec<u8>, CatalogError>;
}

#[async_trait]
pub trait CatalogConnector: Send + Sync {
    async fn connect(&self, run_id: Uuid) -> Result<Box<dyn CatalogSession>, CatalogError>;
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct IcosCatalogConfig {
    pub sparql_url: String,
    pub auth_url: String,
    pub credentials: Option<Credentials>,
    pub http: HttpClientConfig,
}

impl Default for IcosCatalogConfig {
    fn default() -> Self {
        Self {
            sparql_url: DEFAULT_SPARQL_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            credentials: None,
            http: HttpClientConfig::default(),
        }
    }
}

pub struct IcosCatalog {
    config: IcosCatalogConfig,
}

impl IcosCatalog {
    pub fn new(config: IcosCatalogConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CatalogConnector for IcosCatalog {
    async fn connect(&self, run_id: Uuid) -> Result<Box<dyn CatalogSession>, CatalogError> {
        let http = HttpFetcher::new(self.config.http.clone()).map_err(CatalogError::Session)?;
        match &self.config.credentials {
            Some(credentials) => {
                http.login_form(
                    run_id,
                    &self.config.auth_url,
                    &[
                        ("mail", credentials.email.as_str()),
                        ("password", credentials.password.as_str()),
                    ],
                )
                .await?;
                if http.has_session_for(&self.config.auth_url) {
                    info!(%run_id, "catalog session established");
                } else {
                    warn!(%run_id, "login accepted but no session cookie was set");
                }
            }
            None => warn!(%run_id, "no catalog credentials configured; downloading anonymously"),
        }
        Ok(Box::new(IcosSession {
            run_id,
            sparql_url: self.config.sparql_url.clone(),
            http,
        }))
    }
}

struct IcosSession {
    run_id: Uuid,
    sparql_url: String,
    http: HttpFetcher,
}

#[async_trait]
impl CatalogSession for IcosSession {
    async fn discover(&self, query: &CatalogQuery) -> Result<Vec<DataObject>, CatalogError> {
        let response = self
            .http
            .post_text(
                self.run_id,
                "catalog-discovery",
                &self.sparql_url,
                &query.to_sparql(),
                "application/json",
            )
            .await?;
        parse_discovery(&response.body)
    }

    async fn download(&self, object: &DataObject) -> Result<Vec<u8>, CatalogError> {
        let response = self
            .http
            .get_bytes(self.run_id, object.station_id(), &object.download_url)
            .await?;
        Ok(response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const DISCOVERY_JSON: &str = r#"{
      "head": {"vars": ["time", "object", "fileName", "samplingHeight", "stationId"]},
      "results": {"bindings": [
        {
          "time": {"type": "literal", "value": "2026-10-17T08:15:00.000Z"},
          "object": {"type": "uri", "value": "https://meta.icos-cp.eu/objects/abc123"},
          "fileName": {"type": "literal", "value": "ICOS_ATC_L2_SAC_100.zip"},
          "samplingHeight": {"type": "literal", "value": "100.0"},
          "stationId": {"type": "literal", "value": "SAC"},
          "stationName": {"type": "literal", "value": "Saclay"},
          "longitude": {"type": "literal", "value": "2.142"},
          "latitude": {"type": "literal", "value": "48.7227"},
          "altitude": {"type": "literal", "value": "160"}
        }
      ]}
    }"#;

    #[test]
    fn query_embeds_filter_and_lower_bound() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).single().unwrap();
        let query = CatalogQuery::for_history("radon \"data\"", 86_400, now);
        let text = query.to_sparql();

        assert!(text.contains(r#"filter contains(?spec, "radon \"data\"")"#));
        assert!(text.contains(r#"?submTime > "2026-10-17T12:00:00Z"^^xsd:dateTime"#));
        assert!(text.contains("?acquisition cpmeta:hasSamplingHeight ?samplingHeight ."));
        assert!(text.trim_end().ends_with("order by desc(?submTime)"));

        let stations = query.without_sampling_height().to_sparql();
        assert!(!stations.contains("samplingHeight"));
    }

    #[test]
    fn discovery_rows_become_csv_objects() {
        let objects = parse_discovery(DISCOVERY_JSON.as_bytes()).expect("parse");
        assert_eq!(objects.len(), 1);
        let object = &objects[0];
        assert_eq!(object.download_url, "https://data.icos-cp.eu/csv/abc123");
        assert_eq!(object.file_name, "ICOS_ATC_L2_SAC_100.csv");
        assert_eq!(object.level, Some(100.0));
        assert_eq!(object.station_id(), "SAC");
        assert_eq!(object.station.normalize().altitude, 160.0);
        assert_eq!(
            object.submitted_at,
            Some(Utc.with_ymd_and_hms(2026, 10, 17, 8, 15, 0).single().unwrap())
        );
    }

    #[test]
    fn rows_without_station_id_are_malformed() {
        let body = r#"{"results": {"bindings": [
            {"object": {"value": "https://meta.icos-cp.eu/objects/x"}, "fileName": {"value": "x.zip"}}
        ]}}"#;
        let err = parse_discovery(body.as_bytes()).expect_err("missing binding");
        assert!(matches!(
            err,
            CatalogError::MissingBinding { row: 0, binding: "stationId" }
        ));
        assert!(matches!(
            parse_discovery(b"<html>"),
            Err(CatalogError::Malformed(_))
        ));
    }

    #[test]
    fn non_zip_names_and_foreign_urls_are_kept() {
        assert_eq!(csv_file_name("plain.csv"), "plain.csv");
        assert_eq!(
            csv_download_url("https://example.org/objects/1"),
            "https://example.org/objects/1"
        );
    }
}
