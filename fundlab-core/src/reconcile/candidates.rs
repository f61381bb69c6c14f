//! Candidate records per fund, month, and source, awaiting adjudication.

use crate::domain::{
    CotistasRecord, DatasetKind, DatedSet, FundId, PortfolioHolding, PortfolioSnapshot,
    QuotaRecord, YearMonth,
};
use crate::normalize::NormalizedBatch;
use std::collections::BTreeMap;

/// Candidate sets of one record kind: month → source → records by date.
pub type BySource<T> = BTreeMap<YearMonth, BTreeMap<DatasetKind, DatedSet<T>>>;

/// Everything any source offered for one fund.
#[derive(Debug, Clone, Default)]
pub struct FundCandidates {
    pub quotas: BySource<QuotaRecord>,
    pub cotistas: BySource<CotistasRecord>,
    pub holdings: BySource<PortfolioSnapshot>,
}

impl FundCandidates {
    pub fn is_empty(&self) -> bool {
        self.quotas.is_empty() && self.cotistas.is_empty() && self.holdings.is_empty()
    }
}

/// Candidates for every fund, built from normalized batches.
///
/// Records are filed under the month of their own date, not the payload's.
#[derive(Debug, Clone, Default)]
pub struct CandidateIndex {
    funds: BTreeMap<FundId, FundCandidates>,
}

impl CandidateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_batch(&mut self, batch: NormalizedBatch) {
        let kind = batch.kind;

        for q in batch.quotas {
            let month = YearMonth::from_date(q.date);
            self.fund_mut(&q.fund_id)
                .quotas
                .entry(month)
                .or_default()
                .entry(kind)
                .or_default()
                .insert(q.date, q);
        }

        for c in batch.cotistas {
            let month = YearMonth::from_date(c.date);
            self.fund_mut(&c.fund_id)
                .cotistas
                .entry(month)
                .or_default()
                .entry(kind)
                .or_default()
                .insert(c.date, c);
        }

        let mut lines: BTreeMap<(FundId, chrono::NaiveDate), Vec<PortfolioHolding>> =
            BTreeMap::new();
        for h in batch.holdings {
            lines.entry((h.fund_id.clone(), h.date)).or_default().push(h);
        }
        for ((fund_id, date), lines) in lines {
            let month = YearMonth::from_date(date);
            let fund = self.fund_mut(&fund_id);
            let by_date = fund
                .holdings
                .entry(month)
                .or_default()
                .entry(kind)
                .or_default();
            let mut all = by_date
                .remove(&date)
                .map(|existing| existing.holdings)
                .unwrap_or_default();
            all.extend(lines);
            let snapshot = PortfolioSnapshot::from_lines(fund_id.clone(), date, all);
            if !snapshot.is_empty() {
                by_date.insert(date, snapshot);
            }
        }
    }

    fn fund_mut(&mut self, id: &FundId) -> &mut FundCandidates {
        self.funds.entry(id.clone()).or_default()
    }

    pub fn fund(&self, id: &FundId) -> Option<&FundCandidates> {
        self.funds.get(id)
    }

    /// Remove and return a fund's candidates; empty if none were offered.
    pub fn take_fund(&mut self, id: &FundId) -> FundCandidates {
        self.funds.remove(id).unwrap_or_default()
    }

    pub fn fund_count(&self) -> usize {
        self.funds.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn fund() -> FundId {
        FundId::parse("12345678000190").unwrap()
    }

    fn batch(kind: DatasetKind) -> NormalizedBatch {
        NormalizedBatch {
            kind,
            month: YearMonth::new(2024, 6).unwrap(),
            quotas: Vec::new(),
            cotistas: Vec::new(),
            holdings: Vec::new(),
            skipped: 0,
            filtered: 0,
            errors: Vec::new(),
        }
    }

    #[test]
    fn records_filed_by_their_own_month() {
        let mut b = batch(DatasetKind::DailyReport);
        let may = NaiveDate::from_ymd_opt(2024, 5, 31).unwrap();
        let june = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        b.quotas.push(QuotaRecord::new(fund(), may, 1.0));
        b.quotas.push(QuotaRecord::new(fund(), june, 1.1));

        let mut index = CandidateIndex::new();
        index.insert_batch(b);
        let c = index.fund(&fund()).unwrap();
        assert_eq!(c.quotas.len(), 2);
        assert!(c.quotas[&YearMonth::new(2024, 5).unwrap()][&DatasetKind::DailyReport]
            .contains_key(&may));
    }

    #[test]
    fn holdings_grouped_into_snapshots() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        let line = |asset: &str, value: f64| PortfolioHolding {
            fund_id: fund(),
            date,
            asset_type: asset.into(),
            issuer: None,
            instrument_id: None,
            market_value: value,
            percentage: 0.0,
        };
        let mut b = batch(DatasetKind::PortfolioComposition);
        b.holdings = vec![line("Acoes", 300.0), line("Caixa", 100.0)];

        let mut index = CandidateIndex::new();
        index.insert_batch(b);
        let snapshots = &index.fund(&fund()).unwrap().holdings[&YearMonth::new(2024, 6).unwrap()]
            [&DatasetKind::PortfolioComposition];
        let snap = &snapshots[&date];
        assert_eq!(snap.holdings.len(), 2);
        assert_eq!(snap.holdings[0].percentage, 75.0);
        assert_eq!(index.take_fund(&fund()).holdings.len(), 1);
        assert!(index.take_fund(&fund()).is_empty());
    }
}
