//! Staging layer: the deduplicated canonical facts of one run.
//!
//! The orchestrator is the only writer. Per-fund resolutions are folded into
//! a [`StagingBuilder`] one at a time; every (fund, month, kind) key moves
//! through the reconciler's state machine exactly once, and every
//! (fund, date) is unique per record kind. The finished generation renders
//! into CSV tables whose BLAKE3 digest is the generation id.

use crate::tables::{cell, date_cell, opt_cell, opt_str, ColumnType, Table};
use crate::window::ReportingWindow;
use chrono::NaiveDate;
use fundlab_core::data::FetchReport;
use fundlab_core::domain::{
    CotistasRecord, DatasetKind, Fund, FundId, PortfolioSnapshot, QuotaRecord, RecordKind,
    Staged, YearMonth,
};
use fundlab_core::normalize::{NormalizedBatch, PayloadError};
use fundlab_core::reconcile::{FundResolution, Gap, KeyState, Resolution, TransitionError};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("{fund_id} {month} {kind}: {source}")]
    KeyTransition {
        fund_id: FundId,
        month: YearMonth,
        kind: RecordKind,
        #[source]
        source: TransitionError,
    },

    #[error("{fund_id} has two {kind} records for {date}")]
    DuplicateRecord {
        fund_id: FundId,
        date: NaiveDate,
        kind: RecordKind,
    },

    #[error("{0} is not a monitored fund")]
    UnknownFund(FundId),

    #[error("failed to render table {table}: {source}")]
    Render {
        table: &'static str,
        #[source]
        source: csv::Error,
    },
}

// ── Source report ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SourceStatus {
    Fetched,
    NotPublished,
    Unavailable,
    Unreadable,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Fetched => "fetched",
            SourceStatus::NotPublished => "not_published",
            SourceStatus::Unavailable => "unavailable",
            SourceStatus::Unreadable => "unreadable",
        }
    }
}

/// What happened to one dataset for one month.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceReportRow {
    pub kind: DatasetKind,
    pub month: YearMonth,
    pub status: SourceStatus,
    pub records: usize,
    pub skipped: usize,
    pub filtered: usize,
    pub detail: String,
}

// ── Builder ──────────────────────────────────────────────────────────

type DateKey = (FundId, NaiveDate);

pub struct StagingBuilder {
    funds: BTreeMap<FundId, Fund>,
    window: ReportingWindow,
    states: BTreeMap<(FundId, YearMonth, RecordKind), KeyState>,
    quotas: BTreeMap<DateKey, Staged<QuotaRecord>>,
    cotistas: BTreeMap<DateKey, Staged<CotistasRecord>>,
    holdings: BTreeMap<DateKey, Staged<PortfolioSnapshot>>,
    gaps: BTreeSet<Gap>,
    sources: BTreeSet<SourceReportRow>,
}

impl StagingBuilder {
    pub fn new(funds: &[Fund], window: ReportingWindow) -> Self {
        Self {
            funds: funds.iter().map(|f| (f.id.clone(), f.clone())).collect(),
            window,
            states: BTreeMap::new(),
            quotas: BTreeMap::new(),
            cotistas: BTreeMap::new(),
            holdings: BTreeMap::new(),
            gaps: BTreeSet::new(),
            sources: BTreeSet::new(),
        }
    }

    pub fn state(&self, fund_id: &FundId, month: YearMonth, kind: RecordKind) -> KeyState {
        self.states
            .get(&(fund_id.clone(), month, kind))
            .copied()
            .unwrap_or(KeyState::Missing)
    }

    fn advance(
        &mut self,
        fund_id: &FundId,
        month: YearMonth,
        kind: RecordKind,
        to: KeyState,
    ) -> Result<(), StagingError> {
        let key = (fund_id.clone(), month, kind);
        let current = self.states.get(&key).copied().unwrap_or(KeyState::Missing);
        let next = current
            .advance(to)
            .map_err(|source| StagingError::KeyTransition {
                fund_id: fund_id.clone(),
                month,
                kind,
                source,
            })?;
        self.states.insert(key, next);
        Ok(())
    }

    /// Fold one fund's adjudicated keys into the generation.
    pub fn insert_fund(
        &mut self,
        fund_id: &FundId,
        resolution: FundResolution,
    ) -> Result<(), StagingError> {
        if !self.funds.contains_key(fund_id) {
            return Err(StagingError::UnknownFund(fund_id.clone()));
        }

        for (month, res) in resolution.quotas {
            self.advance(fund_id, month, RecordKind::Quotas, res.state())?;
            stage_into(&mut self.quotas, fund_id, RecordKind::Quotas, res)?;
        }
        for (month, res) in resolution.cotistas {
            self.advance(fund_id, month, RecordKind::Cotistas, res.state())?;
            stage_into(&mut self.cotistas, fund_id, RecordKind::Cotistas, res)?;
        }
        for (month, res) in resolution.holdings {
            self.advance(fund_id, month, RecordKind::Holdings, res.state())?;
            stage_into(&mut self.holdings, fund_id, RecordKind::Holdings, res)?;
        }
        self.gaps.extend(resolution.gaps);
        Ok(())
    }

    /// Record fetch outcomes for every dataset and month.
    pub fn record_fetch<T>(&mut self, report: &FetchReport<T>) {
        for &(kind, month) in &report.not_published {
            self.sources.insert(SourceReportRow {
                kind,
                month,
                status: SourceStatus::NotPublished,
                records: 0,
                skipped: 0,
                filtered: 0,
                detail: String::new(),
            });
        }
        let mut unavailable: BTreeMap<(DatasetKind, YearMonth), &str> = BTreeMap::new();
        for target in &report.unavailable {
            unavailable
                .entry((target.kind, target.month))
                .or_insert(target.reason.as_str());
        }
        for ((kind, month), reason) in unavailable {
            self.sources.insert(SourceReportRow {
                kind,
                month,
                status: SourceStatus::Unavailable,
                records: 0,
                skipped: 0,
                filtered: 0,
                detail: reason.to_string(),
            });
        }
    }

    pub fn record_batch(&mut self, batch: &NormalizedBatch) {
        self.sources.insert(SourceReportRow {
            kind: batch.kind,
            month: batch.month,
            status: SourceStatus::Fetched,
            records: batch.record_count(),
            skipped: batch.skipped,
            filtered: batch.filtered,
            detail: batch
                .errors
                .first()
                .map(|e| format!("{} line {}: {}", e.source, e.line, e.error))
                .unwrap_or_default(),
        });
    }

    pub fn record_unreadable(&mut self, kind: DatasetKind, month: YearMonth, error: &PayloadError) {
        self.sources.insert(SourceReportRow {
            kind,
            month,
            status: SourceStatus::Unreadable,
            records: 0,
            skipped: 0,
            filtered: 0,
            detail: error.to_string(),
        });
    }

    pub fn finish(self) -> StagedGeneration {
        StagedGeneration {
            funds: self.funds.into_values().collect(),
            window: self.window,
            quotas: self.quotas.into_values().collect(),
            cotistas: self.cotistas.into_values().collect(),
            holdings: self.holdings.into_values().collect(),
            gaps: self.gaps.into_iter().collect(),
            sources: self.sources.into_iter().collect(),
        }
    }
}

fn stage_into<T: Clone>(
    target: &mut BTreeMap<DateKey, Staged<T>>,
    fund_id: &FundId,
    kind: RecordKind,
    resolution: Resolution<BTreeMap<NaiveDate, T>>,
) -> Result<(), StagingError> {
    let Some(provenance) = resolution.provenance() else {
        return Ok(());
    };
    let Some(records) = resolution.value() else {
        return Ok(());
    };
    for (date, record) in records {
        let key = (fund_id.clone(), *date);
        if target.contains_key(&key) {
            return Err(StagingError::DuplicateRecord {
                fund_id: fund_id.clone(),
                date: *date,
                kind,
            });
        }
        target.insert(
            key,
            Staged {
                record: record.clone(),
                provenance: provenance.clone(),
            },
        );
    }
    Ok(())
}

// ── Generation ───────────────────────────────────────────────────────

/// The staged facts of one run, ordered by (fund, date).
#[derive(Debug, Clone)]
pub struct StagedGeneration {
    /// Monitored funds, ordered by id.
    pub funds: Vec<Fund>,
    pub window: ReportingWindow,
    pub quotas: Vec<Staged<QuotaRecord>>,
    pub cotistas: Vec<Staged<CotistasRecord>>,
    pub holdings: Vec<Staged<PortfolioSnapshot>>,
    pub gaps: Vec<Gap>,
    pub sources: Vec<SourceReportRow>,
}

pub const STAGING_TABLES: [&str; 9] = [
    "dim_fund",
    "dim_manager",
    "dim_category",
    "dim_anbima_class",
    "fact_daily_quota",
    "fact_monthly_cotistas",
    "fact_monthly_portfolio",
    "reconciliation_gaps",
    "source_report",
];

impl StagedGeneration {
    pub fn fund(&self, id: &FundId) -> Option<&Fund> {
        self.funds.iter().find(|f| &f.id == id)
    }

    pub fn quotas_of<'a>(&'a self, id: &'a FundId) -> impl Iterator<Item = &'a Staged<QuotaRecord>> {
        self.quotas.iter().filter(move |q| &q.record.fund_id == id)
    }

    pub fn cotistas_of<'a>(
        &'a self,
        id: &'a FundId,
    ) -> impl Iterator<Item = &'a Staged<CotistasRecord>> {
        self.cotistas.iter().filter(move |c| &c.record.fund_id == id)
    }

    pub fn holdings_of<'a>(
        &'a self,
        id: &'a FundId,
    ) -> impl Iterator<Item = &'a Staged<PortfolioSnapshot>> {
        self.holdings.iter().filter(move |h| &h.record.fund_id == id)
    }

    pub fn gaps_of<'a>(&'a self, id: &'a FundId) -> impl Iterator<Item = &'a Gap> {
        self.gaps.iter().filter(move |g| &g.fund_id == id)
    }

    pub fn tables(&self) -> Vec<Table> {
        vec![
            self.dim_fund(),
            dimension("dim_manager", "manager", self.funds.iter().map(|f| Some(f.manager.as_str()))),
            dimension("dim_category", "category", self.funds.iter().map(|f| Some(f.category.as_str()))),
            dimension(
                "dim_anbima_class",
                "anbima_class",
                self.funds.iter().map(|f| f.anbima_class.as_deref()),
            ),
            self.fact_daily_quota(),
            self.fact_monthly_cotistas(),
            self.fact_monthly_portfolio(),
            self.reconciliation_gaps(),
            self.source_report(),
        ]
    }

    fn dim_fund(&self) -> Table {
        let mut t = Table::new(
            "dim_fund",
            &[
                ("fund_id", ColumnType::Text),
                ("name", ColumnType::Text),
                ("category", ColumnType::Text),
                ("manager", ColumnType::Text),
                ("anbima_class", ColumnType::Text),
                ("group", ColumnType::Text),
            ],
        );
        for f in &self.funds {
            t.push(vec![
                cell(&f.id),
                f.name.clone(),
                f.category.clone(),
                f.manager.clone(),
                opt_str(f.anbima_class.as_deref()),
                opt_str(f.group.as_deref()),
            ]);
        }
        t
    }

    fn fact_daily_quota(&self) -> Table {
        let mut t = Table::new(
            "fact_daily_quota",
            &[
                ("fund_id", ColumnType::Text),
                ("date", ColumnType::Date),
                ("quota_value", ColumnType::Number),
                ("net_asset_value", ColumnType::Number),
                ("total_value", ColumnType::Number),
                ("inflows", ColumnType::Number),
                ("outflows", ColumnType::Number),
                ("holder_count", ColumnType::Integer),
                ("provenance", ColumnType::Text),
            ],
        );
        for s in &self.quotas {
            let q = &s.record;
            t.push(vec![
                cell(&q.fund_id),
                date_cell(q.date),
                cell(q.quota_value),
                opt_cell(q.net_asset_value),
                opt_cell(q.total_value),
                opt_cell(q.inflows),
                opt_cell(q.outflows),
                opt_cell(q.holder_count),
                cell(&s.provenance),
            ]);
        }
        t
    }

    fn fact_monthly_cotistas(&self) -> Table {
        let mut t = Table::new(
            "fact_monthly_cotistas",
            &[
                ("fund_id", ColumnType::Text),
                ("date", ColumnType::Date),
                ("holder_count", ColumnType::Integer),
                ("net_asset_value", ColumnType::Number),
                ("provenance", ColumnType::Text),
            ],
        );
        for s in &self.cotistas {
            let c = &s.record;
            t.push(vec![
                cell(&c.fund_id),
                date_cell(c.date),
                opt_cell(c.holder_count),
                opt_cell(c.net_asset_value),
                cell(&s.provenance),
            ]);
        }
        t
    }

    fn fact_monthly_portfolio(&self) -> Table {
        let mut t = Table::new(
            "fact_monthly_portfolio",
            &[
                ("fund_id", ColumnType::Text),
                ("date", ColumnType::Date),
                ("asset_type", ColumnType::Text),
                ("issuer", ColumnType::Text),
                ("instrument_id", ColumnType::Text),
                ("market_value", ColumnType::Number),
                ("percentage", ColumnType::Number),
                ("provenance", ColumnType::Text),
            ],
        );
        for s in &self.holdings {
            for h in &s.record.holdings {
                t.push(vec![
                    cell(&h.fund_id),
                    date_cell(h.date),
                    h.asset_type.clone(),
                    opt_str(h.issuer.as_deref()),
                    opt_str(h.instrument_id.as_deref()),
                    cell(h.market_value),
                    cell(h.percentage),
                    cell(&s.provenance),
                ]);
            }
        }
        t
    }

    fn reconciliation_gaps(&self) -> Table {
        let mut t = Table::new(
            "reconciliation_gaps",
            &[
                ("fund_id", ColumnType::Text),
                ("month", ColumnType::Text),
                ("kind", ColumnType::Text),
                ("reason", ColumnType::Text),
            ],
        );
        for g in &self.gaps {
            t.push(vec![cell(&g.fund_id), cell(g.month), cell(g.kind), cell(g.reason)]);
        }
        t
    }

    fn source_report(&self) -> Table {
        let mut t = Table::new(
            "source_report",
            &[
                ("dataset", ColumnType::Text),
                ("month", ColumnType::Text),
                ("status", ColumnType::Text),
                ("records", ColumnType::Integer),
                ("skipped", ColumnType::Integer),
                ("filtered", ColumnType::Integer),
                ("detail", ColumnType::Text),
            ],
        );
        for r in &self.sources {
            t.push(vec![
                cell(r.kind),
                cell(r.month),
                r.status.as_str().to_string(),
                cell(r.records),
                cell(r.skipped),
                cell(r.filtered),
                r.detail.clone(),
            ]);
        }
        t
    }
}

/// Distinct non-blank values, sorted.
fn dimension<'a>(
    name: &'static str,
    column: &'static str,
    values: impl Iterator<Item = Option<&'a str>>,
) -> Table {
    let distinct: BTreeSet<&str> = values
        .flatten()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();
    let mut t = Table::new(name, &[(column, ColumnType::Text)]);
    for v in distinct {
        t.push(vec![v.to_string()]);
    }
    t
}

/// Rendered CSV bytes of every staging table plus the generation id.
#[derive(Debug, Clone)]
pub struct RenderedTables {
    pub files: Vec<(String, Vec<u8>)>,
    pub digest: String,
}

/// Render tables to CSV and hash them, names included, in order.
pub fn render(tables: &[Table]) -> Result<RenderedTables, StagingError> {
    let mut hasher = blake3::Hasher::new();
    let mut files = Vec::with_capacity(tables.len());
    for t in tables {
        let bytes = t.to_csv().map_err(|source| StagingError::Render {
            table: t.name,
            source,
        })?;
        let name = t.file_name();
        hasher.update(name.as_bytes());
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
        files.push((name, bytes));
    }
    Ok(RenderedTables {
        files,
        digest: hasher.finalize().to_hex().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundlab_core::domain::{PortfolioHolding, Provenance};
    use fundlab_core::reconcile::GapReason;

    fn fund_id() -> FundId {
        FundId::parse("12345678000190").unwrap()
    }

    fn fund() -> Fund {
        Fund {
            id: fund_id(),
            name: "Fundo Teste".into(),
            category: "Renda Fixa".into(),
            manager: "Gestora X".into(),
            anbima_class: None,
            group: Some("Institucional".into()),
        }
    }

    fn ym(m: u32) -> YearMonth {
        YearMonth::new(2024, m).unwrap()
    }

    fn window() -> ReportingWindow {
        ReportingWindow::compute(NaiveDate::from_ymd_opt(2024, 2, 10).unwrap(), 2, 0)
    }

    fn resolution() -> FundResolution {
        let jan = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let mut r = FundResolution::default();
        r.quotas.insert(
            ym(1),
            Resolution::ResolvedPrimary {
                source: DatasetKind::DailyReport,
                value: [(jan, QuotaRecord::new(fund_id(), jan, 1.25))].into(),
            },
        );
        r.quotas.insert(ym(2), Resolution::Unresolved(GapReason::NoSource));
        let snapshot = PortfolioSnapshot::from_lines(
            fund_id(),
            jan,
            vec![PortfolioHolding {
                fund_id: fund_id(),
                date: jan,
                asset_type: "Caixa".into(),
                issuer: None,
                instrument_id: None,
                market_value: 10.0,
                percentage: 0.0,
            }],
        );
        r.holdings.insert(
            ym(1),
            Resolution::ResolvedFallback {
                sources: vec![DatasetKind::PortfolioComposition],
                value: [(jan, snapshot)].into(),
            },
        );
        r.gaps.push(Gap {
            fund_id: fund_id(),
            month: ym(2),
            kind: RecordKind::Quotas,
            reason: GapReason::NoSource,
        });
        r
    }

    #[test]
    fn keys_reach_terminal_states_once() {
        let mut b = StagingBuilder::new(&[fund()], window());
        b.insert_fund(&fund_id(), resolution()).unwrap();
        assert_eq!(b.state(&fund_id(), ym(1), RecordKind::Quotas), KeyState::ResolvedPrimary);
        assert_eq!(b.state(&fund_id(), ym(2), RecordKind::Quotas), KeyState::Unresolved);
        assert_eq!(b.state(&fund_id(), ym(1), RecordKind::Cotistas), KeyState::Missing);

        let err = b.insert_fund(&fund_id(), resolution()).unwrap_err();
        assert!(matches!(err, StagingError::KeyTransition { .. }));
    }

    #[test]
    fn unknown_fund_rejected() {
        let mut b = StagingBuilder::new(&[fund()], window());
        let other = FundId::parse("99999999000199").unwrap();
        assert!(matches!(
            b.insert_fund(&other, FundResolution::default()),
            Err(StagingError::UnknownFund(_))
        ));
    }

    #[test]
    fn facts_carry_provenance() {
        let mut b = StagingBuilder::new(&[fund()], window());
        b.insert_fund(&fund_id(), resolution()).unwrap();
        let generation = b.finish();
        assert_eq!(generation.quotas.len(), 1);
        assert_eq!(
            generation.quotas[0].provenance,
            Provenance::Primary(DatasetKind::DailyReport)
        );

        let tables = generation.tables();
        let names: Vec<_> = tables.iter().map(|t| t.name).collect();
        assert_eq!(names, STAGING_TABLES.to_vec());

        let portfolio = &tables[6];
        assert_eq!(
            portfolio.column("provenance").unwrap().collect::<Vec<_>>(),
            vec!["fallback:portfolio_composition"]
        );
        assert_eq!(tables[7].len(), 1);
        assert_eq!(tables[3].len(), 0, "blank ANBIMA classes are not dimension rows");
    }

    #[test]
    fn render_is_deterministic_and_content_addressed() {
        let build = || {
            let mut b = StagingBuilder::new(&[fund()], window());
            b.insert_fund(&fund_id(), resolution()).unwrap();
            b.finish()
        };
        let a = render(&build().tables()).unwrap();
        let b = render(&build().tables()).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.files, b.files);

        let mut empty = StagingBuilder::new(&[fund()], window());
        empty.insert_fund(&fund_id(), FundResolution::default()).unwrap();
        let c = render(&empty.finish().tables()).unwrap();
        assert_ne!(a.digest, c.digest);
    }

    #[test]
    fn source_report_rows_are_ordered() {
        let mut b = StagingBuilder::new(&[fund()], window());
        b.record_unreadable(
            DatasetKind::MonthlyReport,
            ym(2),
            &PayloadError::Archive("truncated".into()),
        );
        let mut report = FetchReport::<()>::default();
        report.not_published.push((DatasetKind::DailyReport, ym(1)));
        b.record_fetch(&report);
        let g = b.finish();
        assert_eq!(g.sources[0].kind, DatasetKind::DailyReport);
        assert_eq!(g.sources[1].status, SourceStatus::Unreadable);
    }
}
