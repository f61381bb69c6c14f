//! Source connectors: fetching raw monthly payloads.
//!
//! - `connector`: the SourceConnector trait, payloads, errors
//! - `http`: regulator open-data portal over HTTP
//! - `directory`: local exports and offline mirrors
//! - `retry` / `circuit_breaker`: transient-failure handling
//! - `fetch`: target grouping and fetch reports

pub mod circuit_breaker;
pub mod connector;
pub mod directory;
pub mod fetch;
pub mod http;
pub mod retry;

pub use circuit_breaker::CircuitBreaker;
pub use connector::{ConnectorError, RawPayload, SourceConnector};
pub use directory::{DirectoryConnector, DirectoryLayout};
pub use fetch::{fetch_targets, months_of, FetchReport, FetchTarget, UnavailableTarget};
pub use http::{HttpConnector, DEFAULT_BASE_URL};
pub use retry::RetryPolicy;
