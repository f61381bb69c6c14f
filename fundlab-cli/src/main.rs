//! fundlab CLI: batch ingestion of regulator fund filings.
//!
//! Commands:
//! - `ingest`: fetch, reconcile, publish locally, then upload to the warehouse
//! - `export-local`: same run without the warehouse; prints a JSON summary
//! - `upload`: send the published generation to the warehouse
//! - `window`: print the months the next run will cover

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use fundlab_runner::window::ReportingWindow;
use fundlab_runner::{
    build_connectors, plan_sink, run_pipeline, upload_published, PipelineConfig, RunSummary,
    SinkOutcome,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fundlab", about = "fundlab: fund filings ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline and upload the result to the warehouse.
    Ingest {
        /// Path to the TOML pipeline config.
        #[arg(long)]
        config: PathBuf,

        /// Root of the published generations.
        #[arg(long, default_value = "output")]
        output_dir: PathBuf,

        /// Publish locally only.
        #[arg(long, default_value_t = false)]
        skip_sink: bool,

        /// Reference date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        as_of: Option<String>,
    },
    /// Run the pipeline without the warehouse and print a JSON summary.
    ExportLocal {
        /// Path to the TOML pipeline config.
        #[arg(long)]
        config: PathBuf,

        /// Root of the published generations.
        #[arg(long, default_value = "output")]
        output_dir: PathBuf,

        /// Reference date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        as_of: Option<String>,
    },
    /// Upload the currently published generation to the warehouse.
    Upload {
        /// Path to the TOML pipeline config.
        #[arg(long)]
        config: PathBuf,

        /// Root of the published generations.
        #[arg(long, default_value = "output")]
        output_dir: PathBuf,
    },
    /// Print the months the next run will cover.
    Window {
        /// Path to the TOML pipeline config.
        #[arg(long)]
        config: PathBuf,

        /// Reference date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        as_of: Option<String>,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest {
            config,
            output_dir,
            skip_sink,
            as_of,
        } => run_ingest(&config, &output_dir, skip_sink, as_of.as_deref()),
        Commands::ExportLocal {
            config,
            output_dir,
            as_of,
        } => run_export_local(&config, &output_dir, as_of.as_deref()),
        Commands::Upload { config, output_dir } => run_upload(&config, &output_dir),
        Commands::Window { config, as_of } => run_window(&config, as_of.as_deref()),
    }
}

/// Logs go to stderr so `export-local` output stays machine-readable.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    let config = PipelineConfig::from_file(path)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    Ok(config.with_process_env())
}

fn reference_date(as_of: Option<&str>) -> Result<NaiveDate> {
    match as_of {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("invalid --as-of date '{s}'")),
        None => Ok(chrono::Local::now().date_naive()),
    }
}

fn run(
    config: &PipelineConfig,
    output_dir: &Path,
    skip_sink: bool,
    as_of: Option<&str>,
) -> Result<RunSummary> {
    let today = reference_date(as_of)?;
    let connectors = build_connectors(config).context("failed to configure sources")?;
    let sink = plan_sink(&config.sink, skip_sink);
    let summary = run_pipeline(config, today, output_dir, &connectors, sink)?;
    Ok(summary)
}

fn run_ingest(
    config_path: &Path,
    output_dir: &Path,
    skip_sink: bool,
    as_of: Option<&str>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let summary = run(&config, output_dir, skip_sink, as_of)?;
    print_summary(&summary);
    Ok(())
}

fn run_export_local(config_path: &Path, output_dir: &Path, as_of: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let summary = run(&config, output_dir, true, as_of)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_upload(config_path: &Path, output_dir: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    match upload_published(output_dir, plan_sink(&config.sink, false))? {
        SinkOutcome::Uploaded { sink, tables } => {
            println!("Uploaded {tables} tables via {sink}");
        }
        SinkOutcome::Skipped { reason } => {
            println!("Upload skipped: {reason}");
        }
        SinkOutcome::Failed { sink, error } => {
            bail!("upload via {sink} failed: {error}");
        }
    }
    Ok(())
}

fn run_window(config_path: &Path, as_of: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let today = reference_date(as_of)?;
    let window =
        ReportingWindow::compute(today, config.months_of_history, config.months_to_ignore);
    for month in window.months() {
        println!("{month}");
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("=== Run Summary ===");
    println!("Generation:   {}", summary.generation_id);
    if summary.unchanged {
        println!("              (unchanged since last run)");
    }
    match (summary.window.start(), summary.window.end()) {
        (Some(start), Some(end)) => println!("Window:       {start} .. {end}"),
        _ => println!("Window:       (empty)"),
    }
    println!("Funds:        {}", summary.funds);
    println!("Quotas:       {}", summary.quota_records);
    println!("Cotistas:     {}", summary.cotistas_records);
    println!("Portfolios:   {}", summary.portfolio_snapshots);
    println!("Gaps:         {}", summary.gaps);
    println!("Unavailable:  {}", summary.unavailable);
    match &summary.sink {
        SinkOutcome::Uploaded { sink, tables } => println!("Warehouse:    {tables} tables via {sink}"),
        SinkOutcome::Skipped { reason } => println!("Warehouse:    skipped ({reason})"),
        SinkOutcome::Failed { sink, error } => println!("Warehouse:    FAILED via {sink}: {error}"),
    }
    println!("Published to: {}", summary.published.display());
}
