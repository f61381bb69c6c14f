//! Normalizer: raw payloads → canonical records.
//!
//! - Archives are opened and their entries routed to an entity by file name
//! - Each entity's columns are resolved through the era valid for the month
//! - Bad rows are skipped and counted; bad headers fail the payload
//! - Same-key rows within a payload are combined before leaving this module

pub mod archive;
mod fields;
mod parsers;
pub mod schema;

use crate::data::RawPayload;
use crate::domain::{
    CotistasRecord, DatasetKind, FundId, PayloadFormat, PortfolioHolding, QuotaRecord, YearMonth,
};
use chrono::NaiveDate;
use parsers::Parsed;
use schema::{mapping_for, Entity};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{info, warn};

/// At most this many row errors are kept per payload; the rest are counted.
pub const MAX_RECORDED_ERRORS: usize = 100;

/// Why a single row was skipped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("invalid fund identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("invalid number '{value}' in {field}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("invalid date '{0}'")]
    InvalidDate(String),

    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },

    #[error("malformed row: {0}")]
    Malformed(String),
}

/// Why a whole payload could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("unreadable archive: {0}")]
    Archive(String),

    #[error("{entity}: required column '{column}' not found")]
    MissingColumn { entity: &'static str, column: String },

    #[error("no entry for {0} found in payload")]
    NoMatchingEntry(DatasetKind),

    #[error("malformed CSV: {0}")]
    Csv(String),
}

/// A skipped row and where it was.
#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub source: String,
    pub line: u64,
    pub error: ParseError,
}

/// Records parsed from one table plus what was dropped.
#[derive(Debug, Clone)]
pub struct ParseOutcome<T> {
    pub records: Vec<T>,
    pub skipped: usize,
    /// Rows for funds nobody asked for.
    pub filtered: usize,
    pub errors: Vec<RowError>,
}

impl<T> Default for ParseOutcome<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            skipped: 0,
            filtered: 0,
            errors: Vec::new(),
        }
    }
}

impl<T> ParseOutcome<T> {
    pub(crate) fn skip(&mut self, source: &str, line: u64, error: ParseError) {
        self.skipped += 1;
        if self.errors.len() < MAX_RECORDED_ERRORS {
            self.errors.push(RowError {
                source: source.to_string(),
                line,
                error,
            });
        }
    }
}

/// Which funds the normalizer keeps.
#[derive(Debug, Clone)]
pub enum FundFilter {
    All,
    Only(BTreeSet<FundId>),
}

impl FundFilter {
    pub fn only(ids: impl IntoIterator<Item = FundId>) -> Self {
        FundFilter::Only(ids.into_iter().collect())
    }

    pub fn admits(&self, id: &FundId) -> bool {
        match self {
            FundFilter::All => true,
            FundFilter::Only(ids) => ids.contains(id),
        }
    }
}

/// Canonical records extracted from one payload.
#[derive(Debug, Clone)]
pub struct NormalizedBatch {
    pub kind: DatasetKind,
    pub month: YearMonth,
    pub quotas: Vec<QuotaRecord>,
    pub cotistas: Vec<CotistasRecord>,
    pub holdings: Vec<PortfolioHolding>,
    pub skipped: usize,
    pub filtered: usize,
    pub errors: Vec<RowError>,
}

impl NormalizedBatch {
    fn new(kind: DatasetKind, month: YearMonth) -> Self {
        Self {
            kind,
            month,
            quotas: Vec::new(),
            cotistas: Vec::new(),
            holdings: Vec::new(),
            skipped: 0,
            filtered: 0,
            errors: Vec::new(),
        }
    }

    pub fn record_count(&self) -> usize {
        self.quotas.len() + self.cotistas.len() + self.holdings.len()
    }

    fn absorb(&mut self, outcome: ParseOutcome<Parsed>) {
        self.skipped += outcome.skipped;
        self.filtered += outcome.filtered;
        let room = MAX_RECORDED_ERRORS.saturating_sub(self.errors.len());
        self.errors.extend(outcome.errors.into_iter().take(room));
        for parsed in outcome.records {
            match parsed {
                Parsed::Quota(q) => self.quotas.push(q),
                Parsed::Cotistas(c) => self.cotistas.push(c),
                Parsed::Holding(h) => self.holdings.push(h),
            }
        }
    }

    /// Combine rows sharing a key and sort everything by key.
    ///
    /// Quotas keep the last row. Cotistas sum holder counts and keep the last
    /// net asset value. Holdings with the same line key sum market value.
    fn combine(&mut self) {
        let mut quotas: BTreeMap<(FundId, NaiveDate), QuotaRecord> = BTreeMap::new();
        for q in self.quotas.drain(..) {
            quotas.insert((q.fund_id.clone(), q.date), q);
        }
        self.quotas = quotas.into_values().collect();

        let mut cotistas: BTreeMap<(FundId, NaiveDate), CotistasRecord> = BTreeMap::new();
        for c in self.cotistas.drain(..) {
            match cotistas.get_mut(&(c.fund_id.clone(), c.date)) {
                Some(existing) => {
                    existing.holder_count = match (existing.holder_count, c.holder_count) {
                        (Some(a), Some(b)) => Some(a + b),
                        (a, b) => a.or(b),
                    };
                    existing.net_asset_value = c.net_asset_value.or(existing.net_asset_value);
                }
                None => {
                    cotistas.insert((c.fund_id.clone(), c.date), c);
                }
            }
        }
        self.cotistas = cotistas.into_values().collect();

        type HoldingKey = (FundId, NaiveDate, String, Option<String>, Option<String>);
        let mut holdings: BTreeMap<HoldingKey, PortfolioHolding> = BTreeMap::new();
        for h in self.holdings.drain(..) {
            let key = (
                h.fund_id.clone(),
                h.date,
                h.asset_type.clone(),
                h.issuer.clone(),
                h.instrument_id.clone(),
            );
            match holdings.get_mut(&key) {
                Some(existing) => existing.market_value += h.market_value,
                None => {
                    holdings.insert(key, h);
                }
            }
        }
        self.holdings = holdings.into_values().collect();
    }
}

fn entity_for_entry(kind: DatasetKind, file_name: &str) -> Option<Entity> {
    match kind {
        DatasetKind::DailyReport => Some(Entity::DailyQuotas),
        DatasetKind::MonthlyReport if file_name.contains("carteira") => {
            Some(Entity::MonthlyHoldings)
        }
        DatasetKind::MonthlyReport if file_name.contains("cotist") => Some(Entity::MonthlyCotistas),
        DatasetKind::PortfolioComposition if file_name.contains("blc_") => {
            Some(Entity::CompositionHoldings)
        }
        DatasetKind::PortfolioComposition if file_name.contains("_pl_") => {
            Some(Entity::CompositionNetAssets)
        }
        _ => None,
    }
}

fn entity_for_table(kind: DatasetKind) -> Option<Entity> {
    match kind {
        DatasetKind::HolderProfile => Some(Entity::HolderProfile),
        DatasetKind::ExchangeReference => Some(Entity::ExchangeQuotas),
        DatasetKind::WebPortal => Some(Entity::PortalQuotas),
        _ => None,
    }
}

/// Normalize one raw payload into canonical records.
pub fn normalize_payload(
    payload: &RawPayload,
    filter: &FundFilter,
) -> Result<NormalizedBatch, PayloadError> {
    let mut batch = NormalizedBatch::new(payload.kind, payload.month);

    match payload.format {
        PayloadFormat::Archive => {
            let entries = archive::read_entries(&payload.bytes)?;
            let mut matched = 0;
            for entry in &entries {
                let Some(entity) = entity_for_entry(payload.kind, &entry.file_name()) else {
                    continue;
                };
                matched += 1;
                let text = fields::decode_text(&entry.bytes);
                let mapping = mapping_for(entity, payload.month);
                let outcome = parsers::parse_table(&entry.name, &text, b';', mapping, filter)?;
                batch.absorb(outcome);
            }
            if matched == 0 {
                return Err(PayloadError::NoMatchingEntry(payload.kind));
            }
        }
        PayloadFormat::Delimited => {
            let entity =
                entity_for_table(payload.kind).ok_or(PayloadError::NoMatchingEntry(payload.kind))?;
            let text = fields::decode_text(&payload.bytes);
            let delimiter = fields::sniff_delimiter(&text);
            let mapping = mapping_for(entity, payload.month);
            let outcome = parsers::parse_table(&payload.origin, &text, delimiter, mapping, filter)?;
            batch.absorb(outcome);
        }
    }

    batch.combine();

    if batch.skipped > 0 {
        warn!(
            kind = %payload.kind,
            month = %payload.month,
            skipped = batch.skipped,
            first_error = batch.errors.first().map(|e| e.error.to_string()).unwrap_or_default(),
            "rows skipped"
        );
    }
    info!(
        kind = %payload.kind,
        month = %payload.month,
        records = batch.record_count(),
        skipped = batch.skipped,
        filtered = batch.filtered,
        "normalized"
    );
    Ok(batch)
}
