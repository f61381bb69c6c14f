//! Source datasets and the provenance tag attached to every staged record.

use super::ids::YearMonth;
use super::records::RecordKind;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// A source dataset family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// INF_DIARIO: daily quota filing. Primary for quotas.
    DailyReport,
    /// INF_MENSAL: monthly filing. Primary for holdings and holders.
    MonthlyReport,
    /// CDA: portfolio composition. Fallback for holdings and net assets.
    PortfolioComposition,
    /// PERFIL_MENSAL: holder breakdown. Fallback for holder counts.
    HolderProfile,
    /// Exchange reference export. Fallback for quotas.
    ExchangeReference,
    /// Manual web-portal export. Fallback for quotas.
    WebPortal,
}

/// How a dataset is shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Archive,
    Delimited,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 6] = [
        DatasetKind::DailyReport,
        DatasetKind::MonthlyReport,
        DatasetKind::PortfolioComposition,
        DatasetKind::HolderProfile,
        DatasetKind::ExchangeReference,
        DatasetKind::WebPortal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::DailyReport => "daily_report",
            DatasetKind::MonthlyReport => "monthly_report",
            DatasetKind::PortfolioComposition => "portfolio_composition",
            DatasetKind::HolderProfile => "holder_profile",
            DatasetKind::ExchangeReference => "exchange_reference",
            DatasetKind::WebPortal => "web_portal",
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, DatasetKind::DailyReport | DatasetKind::MonthlyReport)
    }

    /// The primary filing for a record kind.
    pub fn primary_for(kind: RecordKind) -> DatasetKind {
        match kind {
            RecordKind::Quotas => DatasetKind::DailyReport,
            RecordKind::Cotistas | RecordKind::Holdings => DatasetKind::MonthlyReport,
        }
    }

    /// Fallback datasets allowed to stand in for the primary, in merge order.
    pub fn fallbacks_for(kind: RecordKind) -> &'static [DatasetKind] {
        match kind {
            RecordKind::Quotas => &[DatasetKind::ExchangeReference, DatasetKind::WebPortal],
            RecordKind::Cotistas => &[DatasetKind::HolderProfile, DatasetKind::PortfolioComposition],
            RecordKind::Holdings => &[DatasetKind::PortfolioComposition],
        }
    }

    /// Record kinds this dataset can contribute to.
    pub fn serves(&self) -> &'static [RecordKind] {
        match self {
            DatasetKind::DailyReport | DatasetKind::ExchangeReference | DatasetKind::WebPortal => {
                &[RecordKind::Quotas]
            }
            DatasetKind::MonthlyReport => &[RecordKind::Cotistas, RecordKind::Holdings],
            DatasetKind::PortfolioComposition => &[RecordKind::Cotistas, RecordKind::Holdings],
            DatasetKind::HolderProfile => &[RecordKind::Cotistas],
        }
    }

    pub fn format(&self) -> PayloadFormat {
        match self {
            DatasetKind::DailyReport
            | DatasetKind::MonthlyReport
            | DatasetKind::PortfolioComposition => PayloadFormat::Archive,
            DatasetKind::HolderProfile | DatasetKind::ExchangeReference | DatasetKind::WebPortal => {
                PayloadFormat::Delimited
            }
        }
    }

    /// Path below the regulator's open-data root, if the regulator publishes it.
    pub fn remote_path(&self, month: YearMonth) -> Option<String> {
        let ym = month.compact();
        match self {
            DatasetKind::DailyReport => Some(format!("FI/DOC/INF_DIARIO/DADOS/inf_diario_fi_{ym}.zip")),
            DatasetKind::MonthlyReport => Some(format!("FI/DOC/INF_MENSAL/DADOS/inf_mensal_fi_{ym}.zip")),
            DatasetKind::PortfolioComposition => Some(format!("FI/DOC/CDA/DADOS/cda_fi_{ym}.zip")),
            DatasetKind::HolderProfile => {
                Some(format!("FI/DOC/PERFIL_MENSAL/DADOS/perfil_mensal_fi_{ym}.csv"))
            }
            DatasetKind::ExchangeReference | DatasetKind::WebPortal => None,
        }
    }

    /// File name of the month's payload in a local directory.
    pub fn file_name(&self, month: YearMonth) -> String {
        match self.remote_path(month) {
            Some(path) => path.rsplit('/').next().unwrap_or(&path).to_string(),
            None => format!("{}_{}.csv", self.local_prefix(), month.compact()),
        }
    }

    fn local_prefix(&self) -> &'static str {
        match self {
            DatasetKind::ExchangeReference => "b3",
            _ => self.as_str(),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which source resolved a staged record.
///
/// Rendered as `primary:<dataset>` or `fallback:<dataset>[+<dataset>...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    Primary(DatasetKind),
    Fallback(Vec<DatasetKind>),
}

impl Provenance {
    pub fn is_primary(&self) -> bool {
        matches!(self, Provenance::Primary(_))
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Primary(kind) => write!(f, "primary:{kind}"),
            Provenance::Fallback(kinds) => {
                f.write_str("fallback:")?;
                for (i, kind) in kinds.iter().enumerate() {
                    if i > 0 {
                        f.write_str("+")?;
                    }
                    f.write_str(kind.as_str())?;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for Provenance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
