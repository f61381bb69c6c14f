//! Agreement and field-wise merging of fallback record sets.
//!
//! Two fallback sets agree when, on every date both cover, every field both
//! populate is equal (money and quotas within a relative tolerance, counts
//! exactly, holding line sets identical). Agreeing sets merge by filling
//! each side's missing fields and dates from the other.

use crate::domain::{CotistasRecord, DatedSet, PortfolioSnapshot, QuotaRecord};
use std::collections::BTreeMap;

/// Relative tolerance for comparing monetary values and quotas.
pub const RELATIVE_TOLERANCE: f64 = 1e-6;

pub fn close(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= RELATIVE_TOLERANCE * scale
}

fn optional_close(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => close(a, b),
        _ => true,
    }
}

fn optional_equal<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// A per-date record that can be compared and merged with another source's.
pub trait Mergeable: Clone {
    fn agrees_with(&self, other: &Self) -> bool;

    /// Fill gaps in `self` from `other`. Only called on agreeing records.
    fn merge_from(&mut self, other: &Self);
}

impl Mergeable for QuotaRecord {
    fn agrees_with(&self, other: &Self) -> bool {
        close(self.quota_value, other.quota_value)
            && optional_close(self.net_asset_value, other.net_asset_value)
            && optional_close(self.total_value, other.total_value)
            && optional_close(self.inflows, other.inflows)
            && optional_close(self.outflows, other.outflows)
            && optional_equal(&self.holder_count, &other.holder_count)
    }

    fn merge_from(&mut self, other: &Self) {
        self.net_asset_value = self.net_asset_value.or(other.net_asset_value);
        self.total_value = self.total_value.or(other.total_value);
        self.inflows = self.inflows.or(other.inflows);
        self.outflows = self.outflows.or(other.outflows);
        self.holder_count = self.holder_count.or(other.holder_count);
    }
}

impl Mergeable for CotistasRecord {
    fn agrees_with(&self, other: &Self) -> bool {
        optional_equal(&self.holder_count, &other.holder_count)
            && optional_close(self.net_asset_value, other.net_asset_value)
    }

    fn merge_from(&mut self, other: &Self) {
        self.holder_count = self.holder_count.or(other.holder_count);
        self.net_asset_value = self.net_asset_value.or(other.net_asset_value);
    }
}

impl Mergeable for PortfolioSnapshot {
    fn agrees_with(&self, other: &Self) -> bool {
        self.holdings.len() == other.holdings.len()
            && self
                .holdings
                .iter()
                .zip(&other.holdings)
                .all(|(a, b)| a.line_key() == b.line_key() && close(a.market_value, b.market_value))
    }

    fn merge_from(&mut self, _other: &Self) {}
}

/// A candidate set the reconciler can adjudicate.
pub trait Reconcilable: Clone {
    fn is_empty(&self) -> bool;
    fn agrees_with(&self, other: &Self) -> bool;
    fn merge(self, other: Self) -> Self;
}

impl<T: Mergeable> Reconcilable for DatedSet<T> {
    fn is_empty(&self) -> bool {
        BTreeMap::is_empty(self)
    }

    fn agrees_with(&self, other: &Self) -> bool {
        self.iter().all(|(date, record)| {
            other
                .get(date)
                .map_or(true, |theirs| record.agrees_with(theirs))
        })
    }

    fn merge(mut self, other: Self) -> Self {
        for (date, theirs) in other {
            match self.get_mut(&date) {
                Some(ours) => ours.merge_from(&theirs),
                None => {
                    self.insert(date, theirs);
                }
            }
        }
        self
    }
}
