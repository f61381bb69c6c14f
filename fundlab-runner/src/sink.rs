//! External warehouse sink.
//!
//! The sink runs only after a generation was published locally. It never
//! fails a run: missing settings turn into a logged skip, and upload errors
//! are logged and reported without touching the local generation.

use crate::config::SinkConfig;
use crate::tables::{ColumnType, Table};
use chrono::NaiveDate;
use polars::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("table {table}: {message}")]
    Table { table: String, message: String },
}

/// A destination for the staging and curated tables.
pub trait WarehouseSink: Send + Sync {
    fn name(&self) -> &str;

    /// Upload every table; returns how many were written.
    fn upload(&self, staging: &[Table], curated: &[Table]) -> Result<usize, SinkError>;
}

// ── Parquet drop ─────────────────────────────────────────────────────

/// Writes tables as Parquet into `{drop_dir}/{project}/{dataset}/{table}.parquet`
/// for a warehouse bulk-load job to pick up.
pub struct ParquetDropSink {
    name: String,
    project_dir: PathBuf,
    staging_dataset: String,
    curated_dataset: String,
}

impl ParquetDropSink {
    pub fn new(drop_dir: &Path, project: &str, staging_dataset: &str, curated_dataset: &str) -> Self {
        Self {
            name: format!("parquet-drop:{project}"),
            project_dir: drop_dir.join(project),
            staging_dataset: staging_dataset.to_string(),
            curated_dataset: curated_dataset.to_string(),
        }
    }

    pub fn table_path(&self, dataset: &str, table: &str) -> PathBuf {
        self.project_dir.join(dataset).join(format!("{table}.parquet"))
    }

    fn write_dataset(&self, dataset: &str, tables: &[Table]) -> Result<(), SinkError> {
        let dir = self.project_dir.join(dataset);
        fs::create_dir_all(&dir).map_err(|source| SinkError::Io {
            path: dir.clone(),
            source,
        })?;
        for table in tables {
            let mut df = table_to_dataframe(table)?;
            let path = self.table_path(dataset, table.name);
            let tmp_path = path.with_extension("parquet.tmp");
            let file = fs::File::create(&tmp_path).map_err(|source| SinkError::Io {
                path: tmp_path.clone(),
                source,
            })?;
            ParquetWriter::new(file)
                .finish(&mut df)
                .map_err(|e| SinkError::Table {
                    table: table.name.to_string(),
                    message: format!("write parquet: {e}"),
                })?;
            fs::rename(&tmp_path, &path).map_err(|source| {
                let _ = fs::remove_file(&tmp_path);
                SinkError::Io {
                    path: path.clone(),
                    source,
                }
            })?;
        }
        Ok(())
    }
}

impl WarehouseSink for ParquetDropSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn upload(&self, staging: &[Table], curated: &[Table]) -> Result<usize, SinkError> {
        self.write_dataset(&self.staging_dataset, staging)?;
        self.write_dataset(&self.curated_dataset, curated)?;
        Ok(staging.len() + curated.len())
    }
}

fn parse_error(table: &Table, column: &str, value: &str) -> SinkError {
    SinkError::Table {
        table: table.name.to_string(),
        message: format!("column {column}: cannot parse '{value}'"),
    }
}

/// Build a typed frame; empty cells become nulls.
pub fn table_to_dataframe(table: &Table) -> Result<DataFrame, SinkError> {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN);
    let mut columns = Vec::with_capacity(table.columns.len());
    for (idx, &(name, ty)) in table.columns.iter().enumerate() {
        let cells = table.rows.iter().map(|r| r[idx].as_str());
        let column = match ty {
            ColumnType::Text => {
                let values: Vec<Option<&str>> =
                    cells.map(|c| (!c.is_empty()).then_some(c)).collect();
                Column::new(name.into(), values)
            }
            ColumnType::Integer => {
                let values = cells
                    .map(|c| match c {
                        "" => Ok(None),
                        _ => c.parse::<i64>().map(Some).map_err(|_| parse_error(table, name, c)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Column::new(name.into(), values)
            }
            ColumnType::Number => {
                let values = cells
                    .map(|c| match c {
                        "" => Ok(None),
                        _ => c.parse::<f64>().map(Some).map_err(|_| parse_error(table, name, c)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Column::new(name.into(), values)
            }
            ColumnType::Date => {
                let values = cells
                    .map(|c| match c {
                        "" => Ok(None),
                        _ => NaiveDate::parse_from_str(c, "%Y-%m-%d")
                            .map(|d| Some((d - epoch).num_days() as i32))
                            .map_err(|_| parse_error(table, name, c)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Column::new(name.into(), values)
                    .cast(&DataType::Date)
                    .map_err(|e| SinkError::Table {
                        table: table.name.to_string(),
                        message: format!("date cast: {e}"),
                    })?
            }
        };
        columns.push(column);
    }
    DataFrame::new(columns).map_err(|e| SinkError::Table {
        table: table.name.to_string(),
        message: format!("dataframe creation: {e}"),
    })
}

// ── Planning and running ─────────────────────────────────────────────

/// Result of the sink step, reported in the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SinkOutcome {
    Skipped { reason: String },
    Uploaded { sink: String, tables: usize },
    Failed { sink: String, error: String },
}

/// Decide whether a sink can run with the given settings.
pub fn plan_sink(
    config: &SinkConfig,
    skip_requested: bool,
) -> Result<Box<dyn WarehouseSink>, SinkOutcome> {
    let skip = |reason: &str| SinkOutcome::Skipped {
        reason: reason.to_string(),
    };
    if skip_requested {
        return Err(skip("skip requested"));
    }
    let Some(project) = config.project.as_deref().filter(|p| !p.trim().is_empty()) else {
        return Err(skip("no warehouse project configured"));
    };
    if config.credentials.as_deref().map_or(true, |c| c.trim().is_empty()) {
        return Err(skip("no warehouse credentials configured"));
    }
    Ok(Box::new(ParquetDropSink::new(
        &config.drop_dir,
        project,
        &config.staging_dataset,
        &config.curated_dataset,
    )))
}

/// Run the planned sink, or log why it was skipped. Never fails.
pub fn run_sink(
    plan: Result<Box<dyn WarehouseSink>, SinkOutcome>,
    staging: &[Table],
    curated: &[Table],
) -> SinkOutcome {
    let sink = match plan {
        Ok(sink) => sink,
        Err(outcome) => {
            if let SinkOutcome::Skipped { reason } = &outcome {
                info!(%reason, "warehouse sink skipped");
            }
            return outcome;
        }
    };
    match sink.upload(staging, curated) {
        Ok(tables) => {
            info!(sink = sink.name(), tables, "warehouse upload complete");
            SinkOutcome::Uploaded {
                sink: sink.name().to_string(),
                tables,
            }
        }
        Err(e) => {
            warn!(sink = sink.name(), error = %e, "warehouse upload failed");
            SinkOutcome::Failed {
                sink: sink.name().to_string(),
                error: e.to_string(),
            }
        }
    }
}
