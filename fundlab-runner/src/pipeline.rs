//! One batch run: fetch, normalize, reconcile, stage, curate, publish, sink.
//!
//! Fetching (with normalization inside each fetch job) and per-fund
//! reconciliation run on a private rayon pool sized by
//! `max_concurrent_fetches`. Workers only return values; this module is the
//! single writer of the staging builder and of the published generation.

use crate::api::{render_api, SCHEMA_VERSION};
use crate::config::PipelineConfig;
use crate::curated::build_curated;
use crate::publish::{Manifest, PublishError, Publisher, RecoveryAction};
use crate::sink::{run_sink, SinkOutcome, WarehouseSink};
use crate::staging::{render, StagedGeneration, StagingBuilder, StagingError};
use crate::tables::{Table, TableReadError};
use crate::window::ReportingWindow;
use chrono::NaiveDate;
use fundlab_core::data::{fetch_targets, FetchTarget, SourceConnector};
use fundlab_core::normalize::{normalize_payload, FundFilter};
use fundlab_core::reconcile::{reconcile_fund, CandidateIndex, FundResolution};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("no source connectors configured")]
    NoConnectors,

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("failed to render API documents: {0:#}")]
    Api(anyhow::Error),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("no published generation under {0}")]
    NothingPublished(PathBuf),

    #[error("published table {path}: {source}")]
    PublishedTable {
        path: PathBuf,
        #[source]
        source: TableReadError,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ── Generation ───────────────────────────────────────────────────────

/// Everything one run produces, before it is written anywhere.
#[derive(Debug, Clone)]
pub struct Generation {
    pub id: String,
    pub staged: StagedGeneration,
    pub staging_tables: Vec<Table>,
    pub curated_tables: Vec<Table>,
    /// (relative path under `staging/`, `curated/` or `api/`, bytes)
    pub files: Vec<(String, Vec<u8>)>,
}

impl Generation {
    fn manifest(&self) -> Manifest {
        let under = |prefix: &str| -> Vec<String> {
            self.files
                .iter()
                .filter(|(path, _)| path.starts_with(prefix))
                .map(|(path, _)| path.clone())
                .collect()
        };
        Manifest {
            schema_version: SCHEMA_VERSION,
            generation_id: self.id.clone(),
            window_start: self.staged.window.start().map(|m| m.to_string()),
            window_end: self.staged.window.end().map(|m| m.to_string()),
            staging: under("staging/"),
            curated: under("curated/"),
            api: under("api/"),
        }
    }
}

/// Every (fund, month) target of the window.
pub fn fetch_targets_for(config: &PipelineConfig, window: &ReportingWindow) -> Vec<FetchTarget> {
    config
        .funds
        .iter()
        .flat_map(|f| {
            window.months().iter().map(|&month| FetchTarget {
                fund_id: f.id.clone(),
                month,
            })
        })
        .collect()
}

/// Run every in-memory stage and render the generation's files.
pub fn build_generation(
    config: &PipelineConfig,
    today: NaiveDate,
    connectors: &[Box<dyn SourceConnector>],
) -> Result<Generation, PipelineError> {
    if connectors.is_empty() {
        return Err(PipelineError::NoConnectors);
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.max_concurrent_fetches)
        .build()?;

    let window = ReportingWindow::compute(today, config.months_of_history, config.months_to_ignore);
    let targets = fetch_targets_for(config, &window);
    info!(
        funds = config.funds.len(),
        start = ?window.start(),
        end = ?window.end(),
        targets = targets.len(),
        "run started"
    );

    // Fetch and normalize; each job drops its raw bytes once parsed.
    let filter = FundFilter::only(config.fund_ids());
    let report = pool.install(|| {
        fetch_targets(connectors, &targets, |payload| {
            normalize_payload(&payload, &filter)
        })
    });
    let mut unavailable = report.unavailable_months();
    let mut builder = StagingBuilder::new(&config.funds, window.clone());
    builder.record_fetch(&report);

    let mut index = CandidateIndex::new();
    for (kind, month, result) in report.fetched {
        match result {
            Ok(batch) => {
                if !batch.errors.is_empty() {
                    warn!(%kind, %month, errors = batch.errors.len(), "rows rejected");
                }
                debug!(%kind, %month, records = batch.record_count(), skipped = batch.skipped, "payload normalized");
                builder.record_batch(&batch);
                index.insert_batch(batch);
            }
            Err(e) => {
                warn!(%kind, %month, error = %e, "payload unreadable");
                builder.record_unreadable(kind, month, &e);
                unavailable.insert((kind, month));
            }
        }
    }

    // Reconcile
    let per_fund: Vec<_> = config
        .funds
        .iter()
        .map(|f| (f.id.clone(), index.take_fund(&f.id)))
        .collect();
    let resolutions: Vec<(_, FundResolution)> = pool.install(|| {
        per_fund
            .into_par_iter()
            .map(|(id, candidates)| {
                let resolution = reconcile_fund(&id, window.months(), &candidates, &unavailable);
                (id, resolution)
            })
            .collect()
    });
    for (id, resolution) in resolutions {
        builder.insert_fund(&id, resolution)?;
    }
    let staged = builder.finish();
    info!(
        quotas = staged.quotas.len(),
        cotistas = staged.cotistas.len(),
        portfolios = staged.holdings.len(),
        gaps = staged.gaps.len(),
        "staging complete"
    );

    // Render
    let staging_tables = staged.tables();
    let rendered = render(&staging_tables)?;
    let curated = build_curated(&staged);
    let curated_tables = curated.tables();
    let curated_rendered = render(&curated_tables)?;
    let api = render_api(&rendered.digest, &staged, &curated).map_err(PipelineError::Api)?;

    let mut files = Vec::new();
    files.extend(rendered.files.into_iter().map(|(n, b)| (format!("staging/{n}"), b)));
    files.extend(curated_rendered.files.into_iter().map(|(n, b)| (format!("curated/{n}"), b)));
    files.extend(api.into_iter().map(|(n, b)| (format!("api/{n}"), b)));

    Ok(Generation {
        id: rendered.digest,
        staged,
        staging_tables,
        curated_tables,
        files,
    })
}

/// Write a generation aside and swap it in.
pub fn publish_generation(
    publisher: &Publisher,
    generation: &Generation,
) -> Result<Manifest, PipelineError> {
    let pending = publisher.begin()?;
    for (path, bytes) in &generation.files {
        pending.write(path, bytes)?;
    }
    let manifest = generation.manifest();
    publisher.promote(pending, &manifest)?;
    Ok(manifest)
}

// ── Run ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub generation_id: String,
    /// Whether the previous published generation had the same id.
    pub unchanged: bool,
    pub published: PathBuf,
    pub window: ReportingWindow,
    pub funds: usize,
    pub quota_records: usize,
    pub cotistas_records: usize,
    pub portfolio_snapshots: usize,
    pub gaps: usize,
    pub unavailable: usize,
    pub recovered: Vec<String>,
    pub manifest: Manifest,
    pub sink: SinkOutcome,
}

/// The full batch run. The sink only runs once the generation is published
/// and its outcome never fails the run.
pub fn run_pipeline(
    config: &PipelineConfig,
    today: NaiveDate,
    output_dir: &Path,
    connectors: &[Box<dyn SourceConnector>],
    sink: Result<Box<dyn WarehouseSink>, SinkOutcome>,
) -> Result<RunSummary, PipelineError> {
    let publisher = Publisher::new(output_dir);
    let recovered = publisher.recover()?;
    let previous = publisher.current_manifest()?.map(|m| m.generation_id);

    let generation = build_generation(config, today, connectors)?;
    let manifest = publish_generation(&publisher, &generation)?;
    let unchanged = previous.as_deref() == Some(generation.id.as_str());
    if unchanged {
        info!(generation = %generation.id, "generation unchanged since last run");
    }

    let sink = run_sink(sink, &generation.staging_tables, &generation.curated_tables);

    let staged = &generation.staged;
    let unavailable = staged
        .sources
        .iter()
        .filter(|r| r.status != crate::staging::SourceStatus::Fetched)
        .filter(|r| r.status != crate::staging::SourceStatus::NotPublished)
        .map(|r| (r.kind, r.month))
        .collect::<BTreeSet<_>>()
        .len();
    Ok(RunSummary {
        generation_id: generation.id.clone(),
        unchanged,
        published: publisher.current_dir(),
        window: staged.window.clone(),
        funds: staged.funds.len(),
        quota_records: staged.quotas.len(),
        cotistas_records: staged.cotistas.len(),
        portfolio_snapshots: staged.holdings.len(),
        gaps: staged.gaps.len(),
        unavailable,
        recovered: recovered.iter().map(recovery_label).collect(),
        manifest,
        sink,
    })
}

fn recovery_label(action: &RecoveryAction) -> String {
    match action {
        RecoveryAction::RemovedPending => "removed_pending",
        RecoveryAction::RemovedStaleLink => "removed_stale_link",
        RecoveryAction::RemovedOrphan => "removed_orphan",
    }
    .to_string()
}

// ── Upload only ──────────────────────────────────────────────────────

/// Staging and curated tables of the published generation, read back from
/// its CSV files.
pub fn published_tables(publisher: &Publisher) -> Result<(Vec<Table>, Vec<Table>), PipelineError> {
    if publisher.current_manifest()?.is_none() {
        return Err(PipelineError::NothingPublished(publisher.root().to_path_buf()));
    }
    let layouts = StagingBuilder::new(&[], ReportingWindow::default()).finish();
    let staging = read_layer(&publisher.current_dir().join("staging"), layouts.tables())?;
    let curated = read_layer(
        &publisher.current_dir().join("curated"),
        build_curated(&layouts).tables(),
    )?;
    Ok((staging, curated))
}

fn read_layer(dir: &Path, layouts: Vec<Table>) -> Result<Vec<Table>, PipelineError> {
    layouts
        .iter()
        .map(|layout| {
            let path = dir.join(layout.file_name());
            let bytes = fs::read(&path).map_err(|source| PipelineError::Read {
                path: path.clone(),
                source,
            })?;
            layout
                .read_csv(&bytes)
                .map_err(|source| PipelineError::PublishedTable { path, source })
        })
        .collect()
}

/// Send the published generation to the sink without re-running ingestion.
pub fn upload_published(
    output_dir: &Path,
    sink: Result<Box<dyn WarehouseSink>, SinkOutcome>,
) -> Result<SinkOutcome, PipelineError> {
    let publisher = Publisher::new(output_dir);
    publisher.recover()?;
    let (staging, curated) = published_tables(&publisher)?;
    Ok(run_sink(sink, &staging, &curated))
}
