//! Connector set for a run, built from the configured source locations.

use crate::config::PipelineConfig;
use fundlab_core::data::{
    CircuitBreaker, ConnectorError, DirectoryConnector, HttpConnector, SourceConnector,
};
use fundlab_core::domain::DatasetKind;
use std::sync::Arc;
use tracing::info;

/// Regulator datasets, fetched over HTTP or from a mirror.
pub const REGULATOR_KINDS: [DatasetKind; 4] = [
    DatasetKind::DailyReport,
    DatasetKind::MonthlyReport,
    DatasetKind::PortfolioComposition,
    DatasetKind::HolderProfile,
];

/// One connector per configured dataset.
///
/// Regulator datasets always get a connector: the mirror directory when one
/// is configured, HTTP otherwise. All HTTP connectors share one circuit
/// breaker. Exchange and portal exports only get a connector when their
/// directory is configured.
pub fn build_connectors(
    config: &PipelineConfig,
) -> Result<Vec<Box<dyn SourceConnector>>, ConnectorError> {
    let mut connectors: Vec<Box<dyn SourceConnector>> = Vec::new();
    let sources = &config.sources;

    match &sources.cvm_mirror_dir {
        Some(mirror) => {
            for kind in REGULATOR_KINDS {
                connectors.push(Box::new(DirectoryConnector::mirror(kind, mirror)));
            }
        }
        None => {
            let breaker = Arc::new(CircuitBreaker::for_regulator());
            for kind in REGULATOR_KINDS {
                connectors.push(Box::new(HttpConnector::new(
                    kind,
                    &sources.cvm_base_url,
                    config.retry.timeout(),
                    config.retry.policy(),
                    Arc::clone(&breaker),
                )?));
            }
        }
    }

    if let Some(dir) = &sources.exchange_reference_dir {
        connectors.push(Box::new(DirectoryConnector::flat(
            DatasetKind::ExchangeReference,
            dir,
        )));
    }
    if let Some(dir) = &sources.web_portal_dir {
        connectors.push(Box::new(DirectoryConnector::flat(DatasetKind::WebPortal, dir)));
    }

    info!(
        connectors = connectors.len(),
        names = ?connectors.iter().map(|c| c.name()).collect::<Vec<_>>(),
        "sources configured"
    );
    Ok(connectors)
}
