//! Curated layer: derived views computed from a staged generation.
//!
//! - Daily returns per fund against the prior available quota
//! - Daily and monthly rollups by category, manager, and custom group
//! - Latest snapshot per fund (quota, holders, top holdings)
//!
//! Nothing here is ground truth; every value is recomputed from staging.

use crate::staging::StagedGeneration;
use crate::tables::{cell, date_cell, opt_cell, opt_str, ColumnType, Table};
use chrono::NaiveDate;
use fundlab_core::domain::{CotistasRecord, Fund, FundId, PortfolioHolding, Provenance, YearMonth};
use std::collections::BTreeMap;

pub const UNASSIGNED: &str = "(unassigned)";
pub const TOP_HOLDINGS: usize = 10;

// ── Daily returns ────────────────────────────────────────────────────

/// One staged quota with its derived return.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyPoint {
    pub date: NaiveDate,
    pub quota_value: f64,
    pub net_asset_value: Option<f64>,
    pub holder_count: Option<u64>,
    /// Percent change from the prior available date; `None` for the first point.
    pub return_pct: Option<f64>,
    pub provenance: Provenance,
}

/// `(q_t / q_prev - 1) * 100` over consecutive available dates.
///
/// `quotas` must be ordered by date. The first point has no return.
pub fn daily_returns(quotas: &[f64]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(quotas.len());
    let mut prev: Option<f64> = None;
    for &q in quotas {
        out.push(match prev {
            Some(p) if p > 0.0 => Some((q / p - 1.0) * 100.0),
            _ => None,
        });
        prev = Some(q);
    }
    out
}

fn daily_series(staged: &StagedGeneration, fund_id: &FundId) -> Vec<DailyPoint> {
    let rows: Vec<_> = staged.quotas_of(fund_id).collect();
    let values: Vec<f64> = rows.iter().map(|s| s.record.quota_value).collect();
    rows.into_iter()
        .zip(daily_returns(&values))
        .map(|(s, return_pct)| DailyPoint {
            date: s.record.date,
            quota_value: s.record.quota_value,
            net_asset_value: s.record.net_asset_value,
            holder_count: s.record.holder_count,
            return_pct,
            provenance: s.provenance.clone(),
        })
        .collect()
}

// ── Rollups ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Grouping {
    Category,
    Manager,
    Group,
}

impl Grouping {
    pub const ALL: [Grouping; 3] = [Grouping::Category, Grouping::Manager, Grouping::Group];

    pub fn as_str(&self) -> &'static str {
        match self {
            Grouping::Category => "category",
            Grouping::Manager => "manager",
            Grouping::Group => "group",
        }
    }

    /// The fund's label under this grouping; blank labels are unassigned.
    pub fn label(&self, fund: &Fund) -> String {
        let raw = match self {
            Grouping::Category => Some(fund.category.as_str()),
            Grouping::Manager => Some(fund.manager.as_str()),
            Grouping::Group => fund.group.as_deref(),
        };
        match raw.map(str::trim) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => UNASSIGNED.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyRollup {
    pub grouping: Grouping,
    pub label: String,
    pub date: NaiveDate,
    pub mean_quota: f64,
    /// Sum over funds reporting net assets; `None` if none did.
    pub net_assets: Option<f64>,
    pub fund_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonthlyRollup {
    pub grouping: Grouping,
    pub label: String,
    pub month: YearMonth,
    pub fund_count: usize,
    pub month_end_net_assets: Option<f64>,
    /// Mean over funds with quotas at both this and the previous month end.
    pub mean_return_pct: Option<f64>,
}

#[derive(Default)]
struct DailyAcc {
    quota_sum: f64,
    net_assets: Option<f64>,
    funds: usize,
}

#[derive(Default)]
struct MonthlyAcc {
    funds: usize,
    net_assets: Option<f64>,
    return_sum: f64,
    returns: usize,
}

fn add_opt(acc: &mut Option<f64>, value: Option<f64>) {
    if let Some(v) = value {
        *acc = Some(acc.unwrap_or(0.0) + v);
    }
}

/// Last quota of each month for one fund.
fn month_ends(points: &[DailyPoint]) -> BTreeMap<YearMonth, &DailyPoint> {
    let mut ends = BTreeMap::new();
    for p in points {
        ends.insert(YearMonth::from_date(p.date), p);
    }
    ends
}

fn rollups(
    funds: &[Fund],
    series: &BTreeMap<FundId, Vec<DailyPoint>>,
) -> (Vec<DailyRollup>, Vec<MonthlyRollup>) {
    let mut daily: BTreeMap<(Grouping, String, NaiveDate), DailyAcc> = BTreeMap::new();
    let mut monthly: BTreeMap<(Grouping, String, YearMonth), MonthlyAcc> = BTreeMap::new();

    for fund in funds {
        let Some(points) = series.get(&fund.id) else {
            continue;
        };
        let ends = month_ends(points);
        for grouping in Grouping::ALL {
            let label = grouping.label(fund);
            for p in points {
                let acc = daily.entry((grouping, label.clone(), p.date)).or_default();
                acc.quota_sum += p.quota_value;
                add_opt(&mut acc.net_assets, p.net_asset_value);
                acc.funds += 1;
            }
            for (&month, end) in &ends {
                let acc = monthly.entry((grouping, label.clone(), month)).or_default();
                acc.funds += 1;
                add_opt(&mut acc.net_assets, end.net_asset_value);
                if let Some(prev) = ends.get(&month.pred()) {
                    if prev.quota_value > 0.0 {
                        acc.return_sum += (end.quota_value / prev.quota_value - 1.0) * 100.0;
                        acc.returns += 1;
                    }
                }
            }
        }
    }

    let daily = daily
        .into_iter()
        .map(|((grouping, label, date), acc)| DailyRollup {
            grouping,
            label,
            date,
            mean_quota: acc.quota_sum / acc.funds as f64,
            net_assets: acc.net_assets,
            fund_count: acc.funds,
        })
        .collect();
    let monthly = monthly
        .into_iter()
        .map(|((grouping, label, month), acc)| MonthlyRollup {
            grouping,
            label,
            month,
            fund_count: acc.funds,
            month_end_net_assets: acc.net_assets,
            mean_return_pct: (acc.returns > 0).then(|| acc.return_sum / acc.returns as f64),
        })
        .collect();
    (daily, monthly)
}

// ── Latest snapshot ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct LatestHoldings {
    pub date: NaiveDate,
    /// Total market value of the whole snapshot, not only the top lines.
    pub total: f64,
    pub top: Vec<PortfolioHolding>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatestSnapshot {
    pub quota: Option<DailyPoint>,
    pub cotistas: Option<CotistasRecord>,
    pub holdings: Option<LatestHoldings>,
}

fn latest_snapshot(
    staged: &StagedGeneration,
    fund_id: &FundId,
    points: &[DailyPoint],
) -> LatestSnapshot {
    let holdings = staged.holdings_of(fund_id).last().map(|s| {
        let snapshot = &s.record;
        let mut top = snapshot.holdings.clone();
        top.sort_by(|a, b| {
            b.market_value
                .total_cmp(&a.market_value)
                .then_with(|| a.line_key().cmp(&b.line_key()))
        });
        top.truncate(TOP_HOLDINGS);
        LatestHoldings {
            date: snapshot.date,
            total: snapshot.total_market_value(),
            top,
        }
    });
    LatestSnapshot {
        quota: points.last().cloned(),
        cotistas: staged.cotistas_of(fund_id).last().map(|s| s.record.clone()),
        holdings,
    }
}

// ── Generation ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CuratedGeneration {
    pub daily: BTreeMap<FundId, Vec<DailyPoint>>,
    pub daily_rollups: Vec<DailyRollup>,
    pub monthly_rollups: Vec<MonthlyRollup>,
    pub latest: BTreeMap<FundId, LatestSnapshot>,
}

pub fn build_curated(staged: &StagedGeneration) -> CuratedGeneration {
    let daily: BTreeMap<FundId, Vec<DailyPoint>> = staged
        .funds
        .iter()
        .map(|f| (f.id.clone(), daily_series(staged, &f.id)))
        .collect();
    let (daily_rollups, monthly_rollups) = rollups(&staged.funds, &daily);
    let latest = staged
        .funds
        .iter()
        .map(|f| {
            let points = daily.get(&f.id).map(Vec::as_slice).unwrap_or(&[]);
            (f.id.clone(), latest_snapshot(staged, &f.id, points))
        })
        .collect();
    CuratedGeneration {
        daily,
        daily_rollups,
        monthly_rollups,
        latest,
    }
}

pub const CURATED_TABLES: [&str; 8] = [
    "curated_daily_returns",
    "curated_daily_by_category",
    "curated_daily_by_manager",
    "curated_daily_by_group",
    "curated_monthly_by_category",
    "curated_monthly_by_manager",
    "curated_monthly_by_group",
    "curated_latest_snapshot",
];

impl CuratedGeneration {
    pub fn tables(&self) -> Vec<Table> {
        let mut tables = vec![self.daily_returns_table()];
        for grouping in Grouping::ALL {
            tables.push(self.daily_rollup_table(grouping));
        }
        for grouping in Grouping::ALL {
            tables.push(self.monthly_rollup_table(grouping));
        }
        tables.push(self.latest_table());
        tables
    }

    fn daily_returns_table(&self) -> Table {
        let mut t = Table::new(
            "curated_daily_returns",
            &[
                ("fund_id", ColumnType::Text),
                ("date", ColumnType::Date),
                ("quota_value", ColumnType::Number),
                ("return_pct", ColumnType::Number),
                ("provenance", ColumnType::Text),
            ],
        );
        for (id, points) in &self.daily {
            for p in points {
                t.push(vec![
                    cell(id),
                    date_cell(p.date),
                    cell(p.quota_value),
                    opt_cell(p.return_pct),
                    cell(&p.provenance),
                ]);
            }
        }
        t
    }

    fn daily_rollup_table(&self, grouping: Grouping) -> Table {
        let name = match grouping {
            Grouping::Category => "curated_daily_by_category",
            Grouping::Manager => "curated_daily_by_manager",
            Grouping::Group => "curated_daily_by_group",
        };
        let mut t = Table::new(
            name,
            &[
                (grouping.as_str(), ColumnType::Text),
                ("date", ColumnType::Date),
                ("mean_quota", ColumnType::Number),
                ("net_assets", ColumnType::Number),
                ("fund_count", ColumnType::Integer),
            ],
        );
        for r in self.daily_rollups.iter().filter(|r| r.grouping == grouping) {
            t.push(vec![
                r.label.clone(),
                date_cell(r.date),
                cell(r.mean_quota),
                opt_cell(r.net_assets),
                cell(r.fund_count),
            ]);
        }
        t
    }

    fn monthly_rollup_table(&self, grouping: Grouping) -> Table {
        let name = match grouping {
            Grouping::Category => "curated_monthly_by_category",
            Grouping::Manager => "curated_monthly_by_manager",
            Grouping::Group => "curated_monthly_by_group",
        };
        let mut t = Table::new(
            name,
            &[
                (grouping.as_str(), ColumnType::Text),
                ("month", ColumnType::Text),
                ("fund_count", ColumnType::Integer),
                ("month_end_net_assets", ColumnType::Number),
                ("mean_return_pct", ColumnType::Number),
            ],
        );
        for r in self.monthly_rollups.iter().filter(|r| r.grouping == grouping) {
            t.push(vec![
                r.label.clone(),
                cell(r.month),
                cell(r.fund_count),
                opt_cell(r.month_end_net_assets),
                opt_cell(r.mean_return_pct),
            ]);
        }
        t
    }

    fn latest_table(&self) -> Table {
        let mut t = Table::new(
            "curated_latest_snapshot",
            &[
                ("fund_id", ColumnType::Text),
                ("quota_date", ColumnType::Date),
                ("quota_value", ColumnType::Number),
                ("net_asset_value", ColumnType::Number),
                ("holder_count", ColumnType::Integer),
                ("cotistas_date", ColumnType::Date),
                ("cotistas_holder_count", ColumnType::Integer),
                ("portfolio_date", ColumnType::Date),
                ("portfolio_total", ColumnType::Number),
                ("top_issuer", ColumnType::Text),
            ],
        );
        for (id, s) in &self.latest {
            let q = s.quota.as_ref();
            let c = s.cotistas.as_ref();
            let h = s.holdings.as_ref();
            t.push(vec![
                cell(id),
                opt_cell(q.map(|q| date_cell(q.date))),
                opt_cell(q.map(|q| q.quota_value)),
                opt_cell(q.and_then(|q| q.net_asset_value)),
                opt_cell(q.and_then(|q| q.holder_count)),
                opt_cell(c.map(|c| date_cell(c.date))),
                opt_cell(c.and_then(|c| c.holder_count)),
                opt_cell(h.map(|h| date_cell(h.date))),
                opt_cell(h.map(|h| h.total)),
                opt_str(h.and_then(|h| h.top.first()).and_then(|t| t.issuer.as_deref())),
            ]);
        }
        t
    }
}
