//! Reconciler: adjudicate primary and fallback candidates per key.
//!
//! For every (fund, month, record kind) in the window:
//! 1. primary records present → `ResolvedPrimary`, fallbacks discarded
//! 2. primary dataset lost this run → `Unresolved(SourceUnavailable)`
//! 3. else one fallback, or several that agree → `ResolvedFallback`
//! 4. else `Unresolved` with a reason; nothing is synthesized
//!
//! Fallback data never blends with primary data. Each key moves from
//! `Missing` to exactly one terminal state.

pub mod candidates;
pub mod merge;

pub use candidates::{BySource, CandidateIndex, FundCandidates};
pub use merge::{Mergeable, Reconcilable};

use crate::domain::{
    CotistasRecord, DatasetKind, DatedSet, FundId, PortfolioSnapshot, Provenance, QuotaRecord,
    RecordKind, YearMonth,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use tracing::debug;

// ── Resolution ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapReason {
    /// Nothing was published for the key.
    NoSource,
    /// A relevant dataset could not be fetched or read.
    SourceUnavailable,
    /// Two fallbacks disagree; needs a product decision.
    ConflictingFallbacks,
}

impl GapReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapReason::NoSource => "no_source",
            GapReason::SourceUnavailable => "source_unavailable",
            GapReason::ConflictingFallbacks => "conflicting_fallbacks",
        }
    }
}

impl fmt::Display for GapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of adjudicating one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    ResolvedPrimary { source: DatasetKind, value: T },
    ResolvedFallback { sources: Vec<DatasetKind>, value: T },
    Unresolved(GapReason),
}

impl<T> Resolution<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Resolution::ResolvedPrimary { value, .. } | Resolution::ResolvedFallback { value, .. } => {
                Some(value)
            }
            Resolution::Unresolved(_) => None,
        }
    }

    pub fn provenance(&self) -> Option<Provenance> {
        match self {
            Resolution::ResolvedPrimary { source, .. } => Some(Provenance::Primary(*source)),
            Resolution::ResolvedFallback { sources, .. } => {
                Some(Provenance::Fallback(sources.clone()))
            }
            Resolution::Unresolved(_) => None,
        }
    }

    pub fn gap_reason(&self) -> Option<GapReason> {
        match self {
            Resolution::Unresolved(reason) => Some(*reason),
            _ => None,
        }
    }

    pub fn state(&self) -> KeyState {
        match self {
            Resolution::ResolvedPrimary { .. } => KeyState::ResolvedPrimary,
            Resolution::ResolvedFallback { .. } => KeyState::ResolvedFallback,
            Resolution::Unresolved(_) => KeyState::Unresolved,
        }
    }
}

// ── Key state machine ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    Missing,
    ResolvedPrimary,
    ResolvedFallback,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: KeyState,
    pub to: KeyState,
}

impl KeyState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, KeyState::Missing)
    }

    /// Only `Missing` may move, and only to a terminal state.
    pub fn advance(self, to: KeyState) -> Result<KeyState, TransitionError> {
        if self.is_terminal() || !to.is_terminal() {
            return Err(TransitionError { from: self, to });
        }
        Ok(to)
    }
}

// ── Gaps ─────────────────────────────────────────────────────────────

/// A key the run could not resolve.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Gap {
    pub fund_id: FundId,
    pub month: YearMonth,
    pub kind: RecordKind,
    pub reason: GapReason,
}

// ── Adjudication ─────────────────────────────────────────────────────

/// Which datasets relevant to a key were lost this run (not fetched or
/// unreadable).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Availability {
    #[default]
    Complete,
    /// Only fallback datasets were lost.
    FallbackLost,
    /// The primary dataset was lost. Fallbacks may not stand in for it.
    PrimaryLost,
}

impl Availability {
    fn of(
        primary: DatasetKind,
        fallbacks: &[DatasetKind],
        month: YearMonth,
        unavailable: &BTreeSet<(DatasetKind, YearMonth)>,
    ) -> Self {
        if unavailable.contains(&(primary, month)) {
            Availability::PrimaryLost
        } else if fallbacks.iter().any(|&f| unavailable.contains(&(f, month))) {
            Availability::FallbackLost
        } else {
            Availability::Complete
        }
    }
}

/// Apply the precedence rules to one key's candidates.
///
/// Without primary records, a lost primary dataset leaves the key
/// unresolved: a filing that exists but was not read is never replaced by
/// fallback data.
pub fn resolve<T: Reconcilable>(
    primary: Option<(DatasetKind, T)>,
    fallbacks: Vec<(DatasetKind, T)>,
    availability: Availability,
) -> Resolution<T> {
    if let Some((source, value)) = primary {
        if !value.is_empty() {
            return Resolution::ResolvedPrimary { source, value };
        }
    }

    if availability == Availability::PrimaryLost {
        return Resolution::Unresolved(GapReason::SourceUnavailable);
    }

    let mut present = fallbacks.into_iter().filter(|(_, v)| !v.is_empty());
    let Some((first_source, mut merged)) = present.next() else {
        return Resolution::Unresolved(match availability {
            Availability::Complete => GapReason::NoSource,
            _ => GapReason::SourceUnavailable,
        });
    };

    let mut sources = vec![first_source];
    for (source, value) in present {
        if !merged.agrees_with(&value) {
            return Resolution::Unresolved(GapReason::ConflictingFallbacks);
        }
        merged = merged.merge(value);
        sources.push(source);
    }

    Resolution::ResolvedFallback {
        sources,
        value: merged,
    }
}

/// Resolutions of every key of one fund, plus the gaps among them.
#[derive(Debug, Clone, Default)]
pub struct FundResolution {
    pub quotas: BTreeMap<YearMonth, Resolution<DatedSet<QuotaRecord>>>,
    pub cotistas: BTreeMap<YearMonth, Resolution<DatedSet<CotistasRecord>>>,
    pub holdings: BTreeMap<YearMonth, Resolution<DatedSet<PortfolioSnapshot>>>,
    pub gaps: Vec<Gap>,
}

fn resolve_kind<T: Mergeable>(
    kind: RecordKind,
    month: YearMonth,
    by_source: &BySource<T>,
    unavailable: &BTreeSet<(DatasetKind, YearMonth)>,
) -> Resolution<DatedSet<T>> {
    let primary_kind = DatasetKind::primary_for(kind);
    let fallback_kinds = DatasetKind::fallbacks_for(kind);
    let offered = by_source.get(&month);
    let take = |source: DatasetKind| offered.and_then(|m| m.get(&source)).cloned();

    let primary = take(primary_kind).map(|set| (primary_kind, set));
    let fallbacks = fallback_kinds
        .iter()
        .filter_map(|&source| take(source).map(|set| (source, set)))
        .collect();
    let availability = Availability::of(primary_kind, fallback_kinds, month, unavailable);

    resolve(primary, fallbacks, availability)
}

/// Adjudicate every key of one fund across the window.
pub fn reconcile_fund(
    fund_id: &FundId,
    window: &[YearMonth],
    candidates: &FundCandidates,
    unavailable: &BTreeSet<(DatasetKind, YearMonth)>,
) -> FundResolution {
    let mut out = FundResolution::default();

    for &month in window {
        let quotas = resolve_kind(RecordKind::Quotas, month, &candidates.quotas, unavailable);
        let cotistas = resolve_kind(RecordKind::Cotistas, month, &candidates.cotistas, unavailable);
        let holdings = resolve_kind(RecordKind::Holdings, month, &candidates.holdings, unavailable);

        for (kind, reason) in [
            (RecordKind::Quotas, quotas.gap_reason()),
            (RecordKind::Cotistas, cotistas.gap_reason()),
            (RecordKind::Holdings, holdings.gap_reason()),
        ] {
            if let Some(reason) = reason {
                out.gaps.push(Gap {
                    fund_id: fund_id.clone(),
                    month,
                    kind,
                    reason,
                });
            }
        }

        out.quotas.insert(month, quotas);
        out.cotistas.insert(month, cotistas);
        out.holdings.insert(month, holdings);
    }

    out.gaps.sort();
    debug!(fund = %fund_id, months = window.len(), gaps = out.gaps.len(), "fund reconciled");
    out
}
