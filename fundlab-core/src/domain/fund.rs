//! Fund: the monitored entity every record joins on.

use super::ids::FundId;
use serde::{Deserialize, Serialize};

/// A monitored fund and its descriptive metadata.
///
/// Metadata comes from the operator's monitored-fund list and is immutable
/// for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fund {
    pub id: FundId,
    pub name: String,
    /// Regulatory (CVM) category, e.g. "Renda Fixa".
    pub category: String,
    /// Managing institution.
    pub manager: String,
    pub anbima_class: Option<String>,
    /// Operator-defined grouping label used by curated rollups.
    pub group: Option<String>,
}
