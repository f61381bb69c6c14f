//! Source connector trait and structured error types.
//!
//! The SourceConnector trait abstracts over where a dataset comes from (the
//! regulator's open-data endpoint, a local mirror, a directory of manual
//! exports) so the pipeline can swap implementations and tests can run
//! offline.

use crate::domain::{DatasetKind, PayloadFormat, YearMonth};
use thiserror::Error;

/// Raw bytes of one dataset for one month, before normalization.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub kind: DatasetKind,
    pub month: YearMonth,
    /// URL or path the bytes were read from.
    pub origin: String,
    pub format: PayloadFormat,
    pub bytes: Vec<u8>,
}

/// Structured error types for connector operations.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    #[error("{kind} for {month} is not published")]
    NotPublished { kind: DatasetKind, month: YearMonth },

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by source (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("hard stop: source has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error reading {path}: {message}")]
    Io { path: String, message: String },

    #[error("connector '{connector}' cannot serve {kind}")]
    Unsupported {
        connector: String,
        kind: DatasetKind,
    },
}

impl ConnectorError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectorError::NetworkUnreachable(_) | ConnectorError::RateLimited { .. } => true,
            ConnectorError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The month simply has no file; not an availability problem.
    pub fn is_not_published(&self) -> bool {
        matches!(self, ConnectorError::NotPublished { .. })
    }
}

/// A source of one dataset kind.
///
/// Implementations handle retries themselves; `fetch` returning `Err` means
/// the month is unavailable for this run.
pub trait SourceConnector: Send + Sync {
    /// Human-readable name of this connector.
    fn name(&self) -> &str;

    /// The dataset this connector serves.
    fn kind(&self) -> DatasetKind;

    /// Fetch the payload for one reporting month.
    fn fetch(&self, month: YearMonth) -> Result<RawPayload, ConnectorError>;

    /// Whether the connector is currently accepting requests.
    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ConnectorError::NetworkUnreachable("timeout".into()).is_transient());
        assert!(ConnectorError::RateLimited { retry_after_secs: 1 }.is_transient());
        assert!(ConnectorError::HttpStatus {
            status: 503,
            url: "u".into()
        }
        .is_transient());
        assert!(!ConnectorError::HttpStatus {
            status: 400,
            url: "u".into()
        }
        .is_transient());
        assert!(!ConnectorError::CircuitBreakerTripped.is_transient());
        let missing = ConnectorError::NotPublished {
            kind: DatasetKind::DailyReport,
            month: YearMonth::new(2024, 1).unwrap(),
        };
        assert!(!missing.is_transient());
        assert!(missing.is_not_published());
    }
}
