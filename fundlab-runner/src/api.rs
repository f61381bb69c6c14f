//! API documents for the static viewer: `index.json` and `funds/<id>.json`.
//!
//! All documents carry a `schema_version`. Unknown future versions are
//! rejected on load. Missing values serialize as `null`, never as 0.
//!
//! Rounding: quotas 6 dp, money 2 dp, returns 4 dp, percentages 2 dp by
//! asset type and 4 dp by instrument.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use fundlab_core::domain::{Fund, FundId, Provenance, RecordKind, YearMonth};
use fundlab_core::reconcile::GapReason;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::curated::{CuratedGeneration, DailyPoint};
use crate::staging::StagedGeneration;

pub const SCHEMA_VERSION: u32 = 1;

pub fn round_to(value: f64, dp: i32) -> f64 {
    let factor = 10f64.powi(dp);
    let rounded = (value * factor).round() / factor;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

fn round_opt(value: Option<f64>, dp: i32) -> Option<f64> {
    value.map(|v| round_to(v, dp))
}

// ── Index ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSpan {
    pub start: Option<YearMonth>,
    pub end: Option<YearMonth>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: FundId,
    pub name: String,
    pub category: String,
    pub manager: String,
    pub anbima_class: Option<String>,
    pub group: Option<String>,
    pub dataset_path: String,
    pub daily_records: usize,
    pub cotistas_records: usize,
    pub has_portfolio: bool,
    pub gap_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub schema_version: u32,
    pub generation_id: String,
    pub window: WindowSpan,
    pub funds: Vec<IndexEntry>,
}

// ── Per-fund document ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct FundMetadata {
    pub id: FundId,
    pub name: String,
    pub category: String,
    pub manager: String,
    pub anbima_class: Option<String>,
    pub group: Option<String>,
}

impl From<&Fund> for FundMetadata {
    fn from(f: &Fund) -> Self {
        Self {
            id: f.id.clone(),
            name: f.name.clone(),
            category: f.category.clone(),
            manager: f.manager.clone(),
            anbima_class: f.anbima_class.clone(),
            group: f.group.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyRow {
    pub date: NaiveDate,
    pub quota_value: f64,
    pub net_asset_value: Option<f64>,
    pub holder_count: Option<u64>,
    pub return_pct: Option<f64>,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Serialize)]
pub struct CotistasRow {
    pub date: NaiveDate,
    pub holder_count: Option<u64>,
    pub net_asset_value: Option<f64>,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeRow {
    pub date: NaiveDate,
    pub asset_type: String,
    pub market_value: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstrumentRow {
    pub date: NaiveDate,
    pub asset_type: String,
    pub issuer: Option<String>,
    pub instrument_id: Option<String>,
    pub market_value: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Series {
    pub daily: Vec<DailyRow>,
    pub cotistas: Vec<CotistasRow>,
    pub portfolio_by_type: Vec<TypeRow>,
    pub portfolio_by_instrument: Vec<InstrumentRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestQuota {
    pub date: NaiveDate,
    pub quota_value: f64,
    pub net_asset_value: Option<f64>,
    pub holder_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestCotistas {
    pub date: NaiveDate,
    pub holder_count: Option<u64>,
    pub net_asset_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopHolding {
    pub asset_type: String,
    pub issuer: Option<String>,
    pub instrument_id: Option<String>,
    pub market_value: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestHoldingsDoc {
    pub date: NaiveDate,
    pub total: f64,
    pub top: Vec<TopHolding>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GapRow {
    pub month: YearMonth,
    pub kind: RecordKind,
    pub reason: GapReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct FundDocument {
    pub schema_version: u32,
    pub metadata: FundMetadata,
    pub series: Series,
    pub latest_snapshot: Option<LatestQuota>,
    pub latest_cotistas: Option<LatestCotistas>,
    pub latest_holdings: Option<LatestHoldingsDoc>,
    pub gaps: Vec<GapRow>,
}

pub fn dataset_path(id: &FundId) -> String {
    format!("funds/{id}.json")
}

fn daily_row(p: &DailyPoint) -> DailyRow {
    DailyRow {
        date: p.date,
        quota_value: round_to(p.quota_value, 6),
        net_asset_value: round_opt(p.net_asset_value, 2),
        holder_count: p.holder_count,
        return_pct: round_opt(p.return_pct, 4),
        provenance: p.provenance.clone(),
    }
}

pub fn fund_document(
    fund: &Fund,
    staged: &StagedGeneration,
    curated: &CuratedGeneration,
) -> FundDocument {
    let id = &fund.id;
    let daily = curated
        .daily
        .get(id)
        .map(|points| points.iter().map(daily_row).collect())
        .unwrap_or_default();

    let cotistas = staged
        .cotistas_of(id)
        .map(|s| CotistasRow {
            date: s.record.date,
            holder_count: s.record.holder_count,
            net_asset_value: round_opt(s.record.net_asset_value, 2),
            provenance: s.provenance.clone(),
        })
        .collect();

    let mut portfolio_by_type = Vec::new();
    let mut portfolio_by_instrument = Vec::new();
    for s in staged.holdings_of(id) {
        let snapshot = &s.record;
        let total = snapshot.total_market_value();
        let mut by_type: BTreeMap<&str, f64> = BTreeMap::new();
        for h in &snapshot.holdings {
            *by_type.entry(h.asset_type.as_str()).or_insert(0.0) += h.market_value;
            portfolio_by_instrument.push(InstrumentRow {
                date: h.date,
                asset_type: h.asset_type.clone(),
                issuer: h.issuer.clone(),
                instrument_id: h.instrument_id.clone(),
                market_value: round_to(h.market_value, 2),
                percentage: round_to(h.percentage, 4),
            });
        }
        for (asset_type, value) in by_type {
            portfolio_by_type.push(TypeRow {
                date: snapshot.date,
                asset_type: asset_type.to_string(),
                market_value: round_to(value, 2),
                percentage: if total > 0.0 {
                    round_to(value / total * 100.0, 2)
                } else {
                    0.0
                },
            });
        }
    }

    let latest = curated.latest.get(id);
    let latest_snapshot = latest.and_then(|l| l.quota.as_ref()).map(|q| LatestQuota {
        date: q.date,
        quota_value: round_to(q.quota_value, 6),
        net_asset_value: round_opt(q.net_asset_value, 2),
        holder_count: q.holder_count,
    });
    let latest_cotistas = latest.and_then(|l| l.cotistas.as_ref()).map(|c| LatestCotistas {
        date: c.date,
        holder_count: c.holder_count,
        net_asset_value: round_opt(c.net_asset_value, 2),
    });
    let latest_holdings = latest.and_then(|l| l.holdings.as_ref()).map(|h| LatestHoldingsDoc {
        date: h.date,
        total: round_to(h.total, 2),
        top: h
            .top
            .iter()
            .map(|t| TopHolding {
                asset_type: t.asset_type.clone(),
                issuer: t.issuer.clone(),
                instrument_id: t.instrument_id.clone(),
                market_value: round_to(t.market_value, 2),
                percentage: round_to(t.percentage, 2),
            })
            .collect(),
    });

    FundDocument {
        schema_version: SCHEMA_VERSION,
        metadata: FundMetadata::from(fund),
        series: Series {
            daily,
            cotistas,
            portfolio_by_type,
            portfolio_by_instrument,
        },
        latest_snapshot,
        latest_cotistas,
        latest_holdings,
        gaps: staged
            .gaps_of(id)
            .map(|g| GapRow {
                month: g.month,
                kind: g.kind,
                reason: g.reason,
            })
            .collect(),
    }
}

pub fn index_document(
    generation_id: &str,
    staged: &StagedGeneration,
    documents: &[FundDocument],
) -> IndexDocument {
    IndexDocument {
        schema_version: SCHEMA_VERSION,
        generation_id: generation_id.to_string(),
        window: WindowSpan {
            start: staged.window.start(),
            end: staged.window.end(),
        },
        funds: documents
            .iter()
            .map(|d| {
                let m = &d.metadata;
                IndexEntry {
                    id: m.id.clone(),
                    name: m.name.clone(),
                    category: m.category.clone(),
                    manager: m.manager.clone(),
                    anbima_class: m.anbima_class.clone(),
                    group: m.group.clone(),
                    dataset_path: dataset_path(&m.id),
                    daily_records: d.series.daily.len(),
                    cotistas_records: d.series.cotistas.len(),
                    has_portfolio: !d.series.portfolio_by_type.is_empty(),
                    gap_count: d.gaps.len(),
                }
            })
            .collect(),
    }
}

/// Every API file of a generation, as (relative path, bytes).
pub fn render_api(
    generation_id: &str,
    staged: &StagedGeneration,
    curated: &CuratedGeneration,
) -> Result<Vec<(String, Vec<u8>)>> {
    let documents: Vec<FundDocument> = staged
        .funds
        .iter()
        .map(|f| fund_document(f, staged, curated))
        .collect();
    let index = index_document(generation_id, staged, &documents);

    let mut files = Vec::with_capacity(documents.len() + 1);
    files.push((
        "index.json".to_string(),
        serde_json::to_vec_pretty(&index).context("failed to serialize API index")?,
    ));
    for doc in &documents {
        let bytes = serde_json::to_vec_pretty(doc)
            .with_context(|| format!("failed to serialize API document for {}", doc.metadata.id))?;
        files.push((dataset_path(&doc.metadata.id), bytes));
    }
    Ok(files)
}

/// Parse an index document, rejecting unknown schema versions.
pub fn read_index(json: &str) -> Result<IndexDocument> {
    let doc: IndexDocument =
        serde_json::from_str(json).context("failed to deserialize API index")?;
    if doc.schema_version > SCHEMA_VERSION {
        bail!(
            "unsupported schema version {} (max supported: {})",
            doc.schema_version,
            SCHEMA_VERSION
        );
    }
    Ok(doc)
}
