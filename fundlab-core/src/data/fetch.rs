//! Fetch orchestration: turn (fund, month) targets into processed monthly
//! payloads.
//!
//! Regulator files cover every fund for a month, so targets are grouped by
//! month and each (dataset, month) is fetched once. Jobs run on whatever
//! rayon pool the caller installs; each job hands its payload to the
//! caller's `process` step, so raw bytes never outlive their job. Months that
//! cannot be fetched are reported per target; they never abort the run.

use super::connector::{ConnectorError, RawPayload, SourceConnector};
use crate::domain::{DatasetKind, FundId, YearMonth};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// One (fund, month) the run wants data for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FetchTarget {
    pub fund_id: FundId,
    pub month: YearMonth,
}

/// A target whose month could not be fetched from a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnavailableTarget {
    pub kind: DatasetKind,
    pub fund_id: FundId,
    pub month: YearMonth,
    pub reason: String,
}

/// Result of fetching datasets across the window.
///
/// `T` is whatever the fetch job made of each payload.
#[derive(Debug)]
pub struct FetchReport<T = RawPayload> {
    /// Processed payloads, ordered by (dataset, month).
    pub fetched: Vec<(DatasetKind, YearMonth, T)>,
    /// Months the source answered "not published" for.
    pub not_published: Vec<(DatasetKind, YearMonth)>,
    pub unavailable: Vec<UnavailableTarget>,
}

impl<T> Default for FetchReport<T> {
    fn default() -> Self {
        Self {
            fetched: Vec::new(),
            not_published: Vec::new(),
            unavailable: Vec::new(),
        }
    }
}

impl<T> FetchReport<T> {
    /// Fold one dataset's per-month results into a report, expanding failed
    /// months back into the targets that asked for them.
    pub fn from_results(
        kind: DatasetKind,
        targets: &[FetchTarget],
        results: Vec<(YearMonth, Result<T, ConnectorError>)>,
    ) -> Self {
        let mut by_month: BTreeMap<YearMonth, Vec<&FundId>> = BTreeMap::new();
        for target in targets {
            by_month.entry(target.month).or_default().push(&target.fund_id);
        }

        let mut report = FetchReport::default();
        for (month, result) in results {
            match result {
                Ok(value) => report.fetched.push((kind, month, value)),
                Err(e) if e.is_not_published() => report.not_published.push((kind, month)),
                Err(e) => {
                    warn!(%kind, %month, error = %e, "month unavailable");
                    let reason = e.to_string();
                    for fund_id in by_month.get(&month).into_iter().flatten() {
                        report.unavailable.push(UnavailableTarget {
                            kind,
                            fund_id: (*fund_id).clone(),
                            month,
                            reason: reason.clone(),
                        });
                    }
                }
            }
        }
        report.sort();
        report
    }

    /// Merge another dataset's report into this one.
    pub fn absorb(&mut self, other: FetchReport<T>) {
        self.fetched.extend(other.fetched);
        self.not_published.extend(other.not_published);
        self.unavailable.extend(other.unavailable);
        self.sort();
    }

    fn sort(&mut self) {
        self.fetched.sort_by_key(|&(kind, month, _)| (kind, month));
        self.not_published.sort();
    }

    /// (dataset, month) pairs that could not be fetched.
    pub fn unavailable_months(&self) -> BTreeSet<(DatasetKind, YearMonth)> {
        self.unavailable.iter().map(|u| (u.kind, u.month)).collect()
    }
}

/// Distinct months named by the targets, oldest first.
pub fn months_of(targets: &[FetchTarget]) -> Vec<YearMonth> {
    targets
        .iter()
        .map(|t| t.month)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Fetch every (connector, month) pair named by `targets` in parallel on the
/// current rayon pool, passing each payload through `process` inside its job.
///
/// Results are folded per connector in slice order, so the report does not
/// depend on job scheduling.
pub fn fetch_targets<T, F>(
    connectors: &[Box<dyn SourceConnector>],
    targets: &[FetchTarget],
    process: F,
) -> FetchReport<T>
where
    T: Send,
    F: Fn(RawPayload) -> T + Sync,
{
    let months = months_of(targets);
    let jobs: Vec<(usize, YearMonth)> = (0..connectors.len())
        .flat_map(|c| months.iter().map(move |&m| (c, m)))
        .collect();
    let results: Vec<_> = jobs
        .par_iter()
        .map(|&(c, month)| (c, month, connectors[c].fetch(month).map(&process)))
        .collect();

    let mut per_connector: Vec<Vec<_>> = connectors.iter().map(|_| Vec::new()).collect();
    for (c, month, result) in results {
        per_connector[c].push((month, result));
    }

    let mut report = FetchReport::default();
    for (connector, results) in connectors.iter().zip(per_connector) {
        let part = FetchReport::from_results(connector.kind(), targets, results);
        info!(
            connector = connector.name(),
            months = months.len(),
            fetched = part.fetched.len(),
            not_published = part.not_published.len(),
            unavailable = part.unavailable_months().len(),
            "dataset fetched"
        );
        report.absorb(part);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PayloadFormat;
    use std::sync::{Arc, Mutex};

    /// Connector answering from a fixed table; records which months were asked.
    struct ScriptedConnector {
        answers: BTreeMap<YearMonth, Result<Vec<u8>, ConnectorError>>,
        calls: Arc<Mutex<Vec<YearMonth>>>,
    }

    impl SourceConnector for ScriptedConnector {
        fn name(&self) -> &str {
            "scripted"
        }

        fn kind(&self) -> DatasetKind {
            DatasetKind::DailyReport
        }

        fn fetch(&self, month: YearMonth) -> Result<RawPayload, ConnectorError> {
            self.calls.lock().unwrap().push(month);
            match self.answers.get(&month) {
                Some(Ok(bytes)) => Ok(RawPayload {
                    kind: DatasetKind::DailyReport,
                    month,
                    origin: "mem".into(),
                    format: PayloadFormat::Archive,
                    bytes: bytes.clone(),
                }),
                Some(Err(e)) => Err(e.clone()),
                None => Err(ConnectorError::NotPublished {
                    kind: DatasetKind::DailyReport,
                    month,
                }),
            }
        }
    }

    fn ym(m: u32) -> YearMonth {
        YearMonth::new(2024, m).unwrap()
    }

    fn fund(n: u8) -> FundId {
        FundId::parse(&format!("{:014}", n)).unwrap()
    }

    fn scripted(answers: BTreeMap<YearMonth, Result<Vec<u8>, ConnectorError>>) -> ScriptedConnector {
        ScriptedConnector {
            answers,
            calls: Arc::default(),
        }
    }

    #[test]
    fn each_month_fetched_once_and_failures_expand_to_targets() {
        let mut answers = BTreeMap::new();
        answers.insert(ym(1), Ok(b"jan".to_vec()));
        answers.insert(
            ym(2),
            Err(ConnectorError::NetworkUnreachable("timeout".into())),
        );
        let connector = scripted(answers);
        let calls = Arc::clone(&connector.calls);
        let connectors: Vec<Box<dyn SourceConnector>> = vec![Box::new(connector)];
        let targets = vec![
            FetchTarget { fund_id: fund(1), month: ym(1) },
            FetchTarget { fund_id: fund(2), month: ym(1) },
            FetchTarget { fund_id: fund(1), month: ym(2) },
            FetchTarget { fund_id: fund(2), month: ym(2) },
            FetchTarget { fund_id: fund(1), month: ym(3) },
        ];

        let report = fetch_targets(&connectors, &targets, |p| p.bytes.len());

        let mut asked = calls.lock().unwrap().clone();
        asked.sort();
        assert_eq!(asked, vec![ym(1), ym(2), ym(3)]);

        assert_eq!(report.fetched, vec![(DatasetKind::DailyReport, ym(1), 3)]);
        assert_eq!(report.unavailable.len(), 2);
        assert!(report.unavailable.iter().all(|u| u.month == ym(2)));
        assert_eq!(report.not_published, vec![(DatasetKind::DailyReport, ym(3))]);
        assert_eq!(
            report.unavailable_months().into_iter().collect::<Vec<_>>(),
            vec![(DatasetKind::DailyReport, ym(2))]
        );
    }

    #[test]
    fn runs_on_the_installed_pool_and_processes_inside_the_job() {
        let answers: BTreeMap<_, _> = (1..=6).map(|m| (ym(m), Ok(vec![0u8; m as usize]))).collect();
        let connector = scripted(answers);
        let targets: Vec<_> = (1..=6)
            .map(|m| FetchTarget { fund_id: fund(1), month: ym(m) })
            .collect();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let connectors: Vec<Box<dyn SourceConnector>> = vec![Box::new(connector)];

        let report = pool.install(|| {
            fetch_targets(&connectors, &targets, |p| {
                (p.bytes.len(), rayon::current_thread_index().is_some())
            })
        });

        let sizes: Vec<_> = report.fetched.iter().map(|(_, _, (n, _))| *n).collect();
        assert_eq!(sizes, vec![1, 2, 3, 4, 5, 6]);
        assert!(report.fetched.iter().all(|(_, _, (_, on_pool))| *on_pool));
    }

    #[test]
    fn months_are_deduplicated_and_sorted() {
        let targets = vec![
            FetchTarget { fund_id: fund(1), month: ym(3) },
            FetchTarget { fund_id: fund(2), month: ym(1) },
            FetchTarget { fund_id: fund(3), month: ym(3) },
        ];
        assert_eq!(months_of(&targets), vec![ym(1), ym(3)]);
    }
}
