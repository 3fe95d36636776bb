//! Document store persistence + HTTP fetch utilities for obsync.

mod http;
mod memory;
mod postgres;
mod store;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::MemoryStore;
pub use postgres::{schema_statements, PgConnector, PgObservationStore};
pub use store::{
    write_observations_chunked, ObservationStore, RetentionPolicy, StoreConnector, StoreError,
    DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE,
};

pub const CRATE_NAME: &str = "obsync-storage";
