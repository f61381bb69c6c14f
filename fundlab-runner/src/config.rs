//! Pipeline configuration loaded from TOML.
//!
//! The file is parsed into a serde mirror, then validated into an immutable
//! [`PipelineConfig`] that every stage receives by reference:
//! - window parameters (history depth, recency guard)
//! - monitored funds with their descriptive metadata
//! - source locations, retry policy, warehouse sink settings

use fundlab_core::data::{RetryPolicy, DEFAULT_BASE_URL};
use fundlab_core::domain::{Fund, FundId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const MAX_CONCURRENT_FETCHES: usize = 16;
pub const MAX_MONTHS_OF_HISTORY: u32 = 240;

pub const ENV_WAREHOUSE_PROJECT: &str = "FUNDLAB_WAREHOUSE_PROJECT";
pub const ENV_WAREHOUSE_CREDENTIALS: &str = "FUNDLAB_WAREHOUSE_CREDENTIALS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid window: {0}")]
    InvalidWindow(String),

    #[error("no monitored funds configured")]
    NoFunds,

    #[error("fund #{index}: {reason}")]
    InvalidFund { index: usize, reason: String },

    #[error("fund {0} listed more than once")]
    DuplicateFund(FundId),

    #[error("max_concurrent_fetches must be at least 1")]
    ZeroConcurrency,
}

// ── File format ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default = "default_history")]
    months_of_history: u32,
    #[serde(default)]
    months_to_ignore: u32,
    #[serde(default = "default_concurrency")]
    max_concurrent_fetches: usize,
    #[serde(default)]
    sources: SourcesConfig,
    #[serde(default)]
    retry: RetryConfig,
    #[serde(default)]
    sink: SinkConfig,
    #[serde(default)]
    funds: Vec<FundEntry>,
}

fn default_history() -> u32 {
    24
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FundEntry {
    id: String,
    name: String,
    category: String,
    manager: String,
    anbima_class: Option<String>,
    group: Option<String>,
}

/// Where each dataset is read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourcesConfig {
    #[serde(default = "default_base_url")]
    pub cvm_base_url: String,
    /// Offline mirror of the regulator tree; replaces HTTP when set.
    pub cvm_mirror_dir: Option<PathBuf>,
    pub exchange_reference_dir: Option<PathBuf>,
    pub web_portal_dir: Option<PathBuf>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            cvm_base_url: default_base_url(),
            cvm_mirror_dir: None,
            exchange_reference_dir: None,
            web_portal_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            timeout_secs: 60,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Warehouse upload settings. Credentials normally come from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    pub project: Option<String>,
    pub credentials: Option<String>,
    #[serde(default = "default_staging_dataset")]
    pub staging_dataset: String,
    #[serde(default = "default_curated_dataset")]
    pub curated_dataset: String,
    #[serde(default = "default_drop_dir")]
    pub drop_dir: PathBuf,
}

fn default_staging_dataset() -> String {
    "fundlab_staging".into()
}

fn default_curated_dataset() -> String {
    "fundlab_curated".into()
}

fn default_drop_dir() -> PathBuf {
    PathBuf::from("warehouse_drop")
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            project: None,
            credentials: None,
            staging_dataset: default_staging_dataset(),
            curated_dataset: default_curated_dataset(),
            drop_dir: default_drop_dir(),
        }
    }
}

// ── Validated configuration ──────────────────────────────────────────

/// Immutable run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub months_of_history: u32,
    pub months_to_ignore: u32,
    pub max_concurrent_fetches: usize,
    pub sources: SourcesConfig,
    pub retry: RetryConfig,
    pub sink: SinkConfig,
    /// Monitored funds in configuration order.
    pub funds: Vec<Fund>,
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&content)?;
        config.resolve_relative_paths(path.parent().unwrap_or(Path::new(".")));
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        Self::validate(file)
    }

    fn validate(file: ConfigFile) -> Result<Self, ConfigError> {
        if file.months_of_history == 0 || file.months_of_history > MAX_MONTHS_OF_HISTORY {
            return Err(ConfigError::InvalidWindow(format!(
                "months_of_history must be between 1 and {MAX_MONTHS_OF_HISTORY}, got {}",
                file.months_of_history
            )));
        }
        if file.months_to_ignore > MAX_MONTHS_OF_HISTORY {
            return Err(ConfigError::InvalidWindow(format!(
                "months_to_ignore must be at most {MAX_MONTHS_OF_HISTORY}, got {}",
                file.months_to_ignore
            )));
        }
        if file.max_concurrent_fetches == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if file.funds.is_empty() {
            return Err(ConfigError::NoFunds);
        }

        let mut seen = BTreeSet::new();
        let mut funds = Vec::with_capacity(file.funds.len());
        for (index, entry) in file.funds.into_iter().enumerate() {
            let id = FundId::parse(&entry.id).map_err(|e| ConfigError::InvalidFund {
                index,
                reason: e.to_string(),
            })?;
            if entry.name.trim().is_empty() {
                return Err(ConfigError::InvalidFund {
                    index,
                    reason: "name is empty".into(),
                });
            }
            if !seen.insert(id.clone()) {
                return Err(ConfigError::DuplicateFund(id));
            }
            funds.push(Fund {
                id,
                name: entry.name.trim().to_string(),
                category: entry.category.trim().to_string(),
                manager: entry.manager.trim().to_string(),
                anbima_class: non_blank(entry.anbima_class),
                group: non_blank(entry.group),
            });
        }

        Ok(Self {
            months_of_history: file.months_of_history,
            months_to_ignore: file.months_to_ignore,
            max_concurrent_fetches: file.max_concurrent_fetches.min(MAX_CONCURRENT_FETCHES),
            sources: file.sources,
            retry: file.retry,
            sink: file.sink,
            funds,
        })
    }

    /// Anchor relative source and sink directories at the config file's directory.
    fn resolve_relative_paths(&mut self, base: &Path) {
        let anchor = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(dir) = self.sources.cvm_mirror_dir.as_mut() {
            anchor(dir);
        }
        if let Some(dir) = self.sources.exchange_reference_dir.as_mut() {
            anchor(dir);
        }
        if let Some(dir) = self.sources.web_portal_dir.as_mut() {
            anchor(dir);
        }
        anchor(&mut self.sink.drop_dir);
    }

    /// Apply `FUNDLAB_WAREHOUSE_*` overrides from a variable lookup.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(project) = lookup(ENV_WAREHOUSE_PROJECT).filter(|v| !v.trim().is_empty()) {
            self.sink.project = Some(project);
        }
        if let Some(creds) = lookup(ENV_WAREHOUSE_CREDENTIALS).filter(|v| !v.trim().is_empty()) {
            self.sink.credentials = Some(creds);
        }
        self
    }

    /// Apply overrides from the process environment.
    pub fn with_process_env(self) -> Self {
        self.with_env_overrides(|key| std::env::var(key).ok())
    }

    pub fn fund_ids(&self) -> Vec<FundId> {
        self.funds.iter().map(|f| f.id.clone()).collect()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [[funds]]
        id = "12.345.678/0001-90"
        name = "Fundo Teste"
        category = "Renda Fixa"
        manager = "Gestora X"
    "#;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = PipelineConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.months_of_history, 24);
        assert_eq!(config.months_to_ignore, 0);
        assert_eq!(config.max_concurrent_fetches, 4);
        assert_eq!(config.sources.cvm_base_url, DEFAULT_BASE_URL);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.funds[0].id.as_str(), "12345678000190");
        assert_eq!(config.funds[0].group, None);
    }

    #[test]
    fn full_file_parses() {
        let toml = r#"
            months_of_history = 12
            months_to_ignore = 2
            max_concurrent_fetches = 64

            [sources]
            cvm_mirror_dir = "mirror"
            web_portal_dir = "portal"

            [retry]
            max_attempts = 5
            base_delay_ms = 10
            max_delay_ms = 100
            timeout_secs = 5

            [sink]
            project = "proj"
            drop_dir = "drop"

            [[funds]]
            id = "12345678000190"
            name = "A"
            category = "Acoes"
            manager = "M"
            anbima_class = "  "
            group = "Institucional"
        "#;
        let config = PipelineConfig::from_toml(toml).unwrap();
        assert_eq!(config.max_concurrent_fetches, MAX_CONCURRENT_FETCHES);
        assert_eq!(config.sources.cvm_mirror_dir, Some(PathBuf::from("mirror")));
        assert_eq!(config.retry.policy().max_attempts, 5);
        assert_eq!(config.sink.project.as_deref(), Some("proj"));
        assert_eq!(config.sink.staging_dataset, "fundlab_staging");
        assert_eq!(config.funds[0].anbima_class, None);
        assert_eq!(config.funds[0].group.as_deref(), Some("Institucional"));
    }

    #[test]
    fn rejects_invalid_window() {
        let toml = format!("months_of_history = 0\n{MINIMAL}");
        assert!(matches!(
            PipelineConfig::from_toml(&toml),
            Err(ConfigError::InvalidWindow(_))
        ));
        let toml = format!("months_to_ignore = 999\n{MINIMAL}");
        assert!(matches!(
            PipelineConfig::from_toml(&toml),
            Err(ConfigError::InvalidWindow(_))
        ));
    }

    #[test]
    fn rejects_malformed_fund_list() {
        assert!(matches!(PipelineConfig::from_toml(""), Err(ConfigError::NoFunds)));

        let bad_id = MINIMAL.replace("12.345.678/0001-90", "12.345");
        assert!(matches!(
            PipelineConfig::from_toml(&bad_id),
            Err(ConfigError::InvalidFund { index: 0, .. })
        ));

        let duplicate = format!("{MINIMAL}{}", MINIMAL.replace("12.345.678/0001-90", "12345678000190"));
        assert!(matches!(
            PipelineConfig::from_toml(&duplicate),
            Err(ConfigError::DuplicateFund(_))
        ));
    }

    #[test]
    fn rejects_zero_concurrency_and_unknown_keys() {
        let toml = format!("max_concurrent_fetches = 0\n{MINIMAL}");
        assert!(matches!(
            PipelineConfig::from_toml(&toml),
            Err(ConfigError::ZeroConcurrency)
        ));
        let toml = format!("meses_retroativos = 3\n{MINIMAL}");
        assert!(matches!(PipelineConfig::from_toml(&toml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn env_overrides_sink_settings() {
        let config = PipelineConfig::from_toml(MINIMAL)
            .unwrap()
            .with_env_overrides(|key| match key {
                ENV_WAREHOUSE_PROJECT => Some("env-project".into()),
                ENV_WAREHOUSE_CREDENTIALS => Some("/secrets/key.json".into()),
                _ => None,
            });
        assert_eq!(config.sink.project.as_deref(), Some("env-project"));
        assert_eq!(config.sink.credentials.as_deref(), Some("/secrets/key.json"));
    }

    #[test]
    fn relative_paths_anchor_at_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, format!("[sources]\nweb_portal_dir = \"portal\"\n{MINIMAL}")).unwrap();
        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.sources.web_portal_dir, Some(dir.path().join("portal")));
        assert_eq!(config.sink.drop_dir, dir.path().join("warehouse_drop"));
    }
}
