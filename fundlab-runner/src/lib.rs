//! fundlab runner: pipeline orchestration on top of `fundlab-core`.
//!
//! - `config` / `window` / `sources`: run configuration and its derived inputs
//! - `staging` / `curated` / `tables`: tabular layers of a generation
//! - `api`: versioned JSON documents for the static viewer
//! - `publish`: write-aside generations swapped in by rename
//! - `sink`: external warehouse upload
//! - `pipeline`: the batch run tying them together

pub mod api;
pub mod config;
pub mod curated;
pub mod pipeline;
pub mod publish;
pub mod sink;
pub mod sources;
pub mod staging;
pub mod tables;
pub mod window;

pub use api::{read_index, render_api, FundDocument, IndexDocument, SCHEMA_VERSION};
pub use config::{ConfigError, PipelineConfig, RetryConfig, SinkConfig, SourcesConfig};
pub use curated::{build_curated, CuratedGeneration};
pub use pipeline::{
    build_generation, publish_generation, run_pipeline, upload_published, Generation,
    PipelineError, RunSummary,
};
pub use publish::{Manifest, PublishError, Publisher};
pub use sink::{plan_sink, run_sink, ParquetDropSink, SinkError, SinkOutcome, WarehouseSink};
pub use sources::build_connectors;
pub use staging::{StagedGeneration, StagingBuilder, StagingError};
pub use tables::{ColumnType, Table};
pub use window::ReportingWindow;
