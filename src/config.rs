//! Harvester configuration.
//!
//! Settings come from an optional TOML file (`--config` flag or the
//! `CF1400_CONFIG` env var), falling back to built-in defaults, with a
//! handful of env var overrides on top (`DATABASE_PATH`, `PORT`,
//! `DOWNLOAD_DIR` and the `CF1400_*` family).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::candidates::PathPattern;
use crate::models::ReportPeriod;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database path (":memory:" works for tests).
    pub database_path: String,
    pub server: ServerConfig,
    pub start: StartConfig,
    pub source: SourceConfig,
    pub download: DownloadConfig,
    pub fetch: FetchConfig,
    pub run: RunConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "./cf1400.db".to_string(),
            server: ServerConfig::default(),
            start: StartConfig::default(),
            source: SourceConfig::default(),
            download: DownloadConfig::default(),
            fetch: FetchConfig::default(),
            run: RunConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// First period to acquire when the history store is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartConfig {
    pub year: i32,
    pub month: u8,
}

impl Default for StartConfig {
    fn default() -> Self {
        Self {
            year: 2020,
            month: 1,
        }
    }
}

/// Where reports live and what the publisher calls them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Document roots to probe, in order of likelihood.
    pub base_urls: Vec<String>,
    /// Remote report name without extension (spaces included).
    pub filename_base: String,
    /// Pattern ids to probe, in order. See [`PathPattern`].
    pub patterns: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_urls: vec![
                "https://www.cbp.gov/sites/default/files/assets/documents".to_string(),
                "https://www.cbp.gov/sites/default/files/documents".to_string(),
            ],
            filename_base: "CF1400 Records".to_string(),
            patterns: PathPattern::ALL.iter().map(|p| p.id().to_string()).collect(),
        }
    }
}

impl SourceConfig {
    /// Resolve configured pattern ids, failing fast on typos.
    pub fn resolved_patterns(&self) -> Result<Vec<PathPattern>> {
        self.patterns
            .iter()
            .map(|id| {
                PathPattern::parse(id).with_context(|| {
                    let known: Vec<&str> = PathPattern::ALL.iter().map(|p| p.id()).collect();
                    format!("unknown pattern id '{}', known: {}", id, known.join(", "))
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Directory the PDFs land in.
    pub dir: PathBuf,
    /// Bodies smaller than this are rejected as invalid.
    pub min_pdf_bytes: u64,
    /// Bodies larger than this are rejected as invalid.
    pub max_pdf_bytes: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./downloads"),
            min_pdf_bytes: 1024,
            max_pdf_bytes: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Attempts per candidate URL (first try included).
    pub retry_max_attempts: u32,
    /// Backoff before the first retry; doubles per retry.
    pub retry_base_delay_ms: u64,
    /// Candidate URLs probed concurrently per period.
    pub probe_parallelism: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1000,
            probe_parallelism: 3,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Months to wait after a period ends before expecting its report.
    pub publication_lag_months: u32,
    /// Wall-clock ceiling for one reconciliation pass.
    pub wall_clock_budget_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            publication_lag_months: 1,
            wall_clock_budget_secs: 300,
        }
    }
}

impl RunConfig {
    pub fn wall_clock_budget(&self) -> Duration {
        Duration::from_secs(self.wall_clock_budget_secs)
    }
}

impl Config {
    /// Load configuration: TOML file if given (flag or `CF1400_CONFIG`),
    /// defaults otherwise, then env overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("CF1400_CONFIG").ok().map(PathBuf::from);
        let path = path.map(Path::to_path_buf).or(env_path);

        let mut config = match &path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file {}", p.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {}", p.display()))?
            }
            None => Config::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DATABASE_PATH") {
            self.database_path = v;
        }
        if let Ok(v) = std::env::var("PORT") {
            self.server.port = v.parse().unwrap_or(self.server.port);
        }
        if let Ok(v) = std::env::var("DOWNLOAD_DIR") {
            self.download.dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CF1400_BASE_URLS") {
            let urls: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !urls.is_empty() {
                self.source.base_urls = urls;
            }
        }
        if let Ok(v) = std::env::var("CF1400_FILENAME_BASE") {
            self.source.filename_base = v;
        }
        if let Ok(v) = std::env::var("CF1400_START_YEAR") {
            self.start.year = v.parse().unwrap_or(self.start.year);
        }
        if let Ok(v) = std::env::var("CF1400_START_MONTH") {
            self.start.month = v.parse().unwrap_or(self.start.month);
        }
        if let Ok(v) = std::env::var("CF1400_LAG_MONTHS") {
            self.run.publication_lag_months = v.parse().unwrap_or(self.run.publication_lag_months);
        }
        if let Ok(v) = std::env::var("CF1400_RUN_BUDGET_SECS") {
            self.run.wall_clock_budget_secs = v.parse().unwrap_or(self.run.wall_clock_budget_secs);
        }
        if let Ok(v) = std::env::var("CF1400_FETCH_TIMEOUT_SECS") {
            self.fetch.timeout_secs = v.parse().unwrap_or(self.fetch.timeout_secs);
        }
        if let Ok(v) = std::env::var("CF1400_RETRY_MAX_ATTEMPTS") {
            self.fetch.retry_max_attempts = v.parse().unwrap_or(self.fetch.retry_max_attempts);
        }
        if let Ok(v) = std::env::var("CF1400_RETRY_BASE_DELAY_MS") {
            self.fetch.retry_base_delay_ms = v.parse().unwrap_or(self.fetch.retry_base_delay_ms);
        }
        if let Ok(v) = std::env::var("CF1400_PROBE_PARALLELISM") {
            self.fetch.probe_parallelism = v.parse().unwrap_or(self.fetch.probe_parallelism);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.source.base_urls.is_empty() {
            bail!("source.base_urls must not be empty");
        }
        if self.source.patterns.is_empty() {
            bail!("source.patterns must not be empty");
        }
        self.source.resolved_patterns()?;
        self.start_period()
            .context("start.year/start.month is not a valid period")?;
        if self.download.min_pdf_bytes >= self.download.max_pdf_bytes {
            bail!(
                "download.min_pdf_bytes ({}) must be below max_pdf_bytes ({})",
                self.download.min_pdf_bytes,
                self.download.max_pdf_bytes
            );
        }
        Ok(())
    }

    pub fn start_period(&self) -> Result<ReportPeriod> {
        ReportPeriod::from_year_month(self.start.year, self.start.month)
    }
}
