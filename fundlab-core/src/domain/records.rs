//! Canonical fact records produced by the normalizer.

use super::ids::FundId;
use super::provenance::Provenance;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Records of one kind keyed by date, for a single fund and source.
pub type DatedSet<T> = BTreeMap<NaiveDate, T>;

/// The three record kinds the reconciler adjudicates independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Quotas,
    Cotistas,
    Holdings,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [RecordKind::Quotas, RecordKind::Cotistas, RecordKind::Holdings];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Quotas => "quotas",
            RecordKind::Cotistas => "cotistas",
            RecordKind::Holdings => "holdings",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Daily quota filing for one fund. The daily return is derived downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub fund_id: FundId,
    pub date: NaiveDate,
    pub quota_value: f64,
    pub net_asset_value: Option<f64>,
    pub total_value: Option<f64>,
    pub inflows: Option<f64>,
    pub outflows: Option<f64>,
    pub holder_count: Option<u64>,
}

impl QuotaRecord {
    pub fn new(fund_id: FundId, date: NaiveDate, quota_value: f64) -> Self {
        Self {
            fund_id,
            date,
            quota_value,
            net_asset_value: None,
            total_value: None,
            inflows: None,
            outflows: None,
            holder_count: None,
        }
    }
}

/// Holder count and net asset value at a reporting date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CotistasRecord {
    pub fund_id: FundId,
    pub date: NaiveDate,
    pub holder_count: Option<u64>,
    pub net_asset_value: Option<f64>,
}

/// One line of a fund's portfolio at a reporting date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioHolding {
    pub fund_id: FundId,
    pub date: NaiveDate,
    pub asset_type: String,
    pub issuer: Option<String>,
    pub instrument_id: Option<String>,
    pub market_value: f64,
    /// Share of the snapshot's total market value, 0–100.
    pub percentage: f64,
}

/// Identity of a holding line within a snapshot.
pub type LineKey = (String, Option<String>, Option<String>);

impl PortfolioHolding {
    pub fn line_key(&self) -> LineKey {
        (
            self.asset_type.clone(),
            self.issuer.clone(),
            self.instrument_id.clone(),
        )
    }
}

/// All holdings of a fund at one date; the unit of uniqueness for holdings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub fund_id: FundId,
    pub date: NaiveDate,
    pub holdings: Vec<PortfolioHolding>,
}

impl PortfolioSnapshot {
    /// Build a snapshot from raw lines.
    ///
    /// Lines sharing a line key are summed, non-positive values dropped, and
    /// percentages recomputed against the snapshot total. Holdings come out
    /// sorted by line key.
    pub fn from_lines(fund_id: FundId, date: NaiveDate, lines: Vec<PortfolioHolding>) -> Self {
        let mut combined: BTreeMap<LineKey, f64> = BTreeMap::new();
        for line in lines {
            if line.market_value.is_nan() || line.market_value <= 0.0 {
                continue;
            }
            *combined.entry(line.line_key()).or_insert(0.0) += line.market_value;
        }

        let total: f64 = combined.values().sum();
        let holdings = combined
            .into_iter()
            .map(|((asset_type, issuer, instrument_id), market_value)| PortfolioHolding {
                fund_id: fund_id.clone(),
                date,
                asset_type,
                issuer,
                instrument_id,
                market_value,
                percentage: if total > 0.0 {
                    market_value / total * 100.0
                } else {
                    0.0
                },
            })
            .collect();

        Self {
            fund_id,
            date,
            holdings,
        }
    }

    pub fn total_market_value(&self) -> f64 {
        self.holdings.iter().map(|h| h.market_value).sum()
    }

    pub fn percentage_sum(&self) -> f64 {
        self.holdings.iter().map(|h| h.percentage).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.holdings.is_empty()
    }
}

/// A record as written to staging, tagged with the source that resolved it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Staged<T> {
    pub record: T,
    pub provenance: Provenance,
}
