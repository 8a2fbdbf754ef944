//! Persistence and HTTP fetch utilities for Homepedia.

pub mod http;
pub mod memory;
pub mod postgres;
pub mod store;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RequestPacer, RetryDisposition,
};
pub use memory::MemoryPropertyStore;
pub use postgres::{PgPropertyStore, PgStoreConfig};
pub use store::{PropertyStore, StoreError, UpsertOutcome, WriteFailure};

pub const CRATE_NAME: &str = "homepedia-storage";
