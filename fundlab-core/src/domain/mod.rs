//! Domain types for fund filings: identifiers, records, provenance.

pub mod fund;
pub mod ids;
pub mod provenance;
pub mod records;

pub use fund::Fund;
pub use ids::{FundId, IdError, YearMonth};
pub use provenance::{DatasetKind, PayloadFormat, Provenance};
pub use records::{
    CotistasRecord, DatedSet, PortfolioHolding, PortfolioSnapshot, QuotaRecord, RecordKind,
    Staged,
};
