//! # Configuration Management Module
//!
//! ## Purpose
//! Centralized configuration for the CFR pipeline, loaded from TOML files
//! with environment-variable overrides and validation. No module carries
//! hidden constants: worker budgets, retry policy and endpoint URLs all
//! flow through this struct into the orchestrator at construction.
//!
//! ## Configuration Sources (in order of precedence)
//! 1. Environment variables (`CFR_PIPELINE_*`)
//! 2. Configuration file (TOML)
//! 3. Default values
//!
//! ## Usage
//! ```rust,no_run
//! use cfr_pipeline::config::Config;
//!
//! let config = Config::from_file("config.toml").unwrap();
//! println!("worker budget: {}", config.fetch.worker_budget);
//! ```

use crate::errors::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure containing all pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upstream source endpoints
    pub sources: SourcesConfig,
    /// Retry, racing and concurrency settings
    pub fetch: FetchConfig,
    /// Persistence store settings
    pub storage: StorageConfig,
    /// Similarity index settings
    pub similarity: SimilarityConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Upstream source endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// eCFR API base URL (primary source)
    pub ecfr_base_url: String,
    /// govinfo eCFR bulk-data URL (secondary source, current data)
    pub govinfo_ecfr_url: String,
    /// govinfo CFR annual-edition bulk-data URL (secondary source, historical)
    pub govinfo_cfr_url: String,
    /// Per-request timeout for full-title documents, in seconds
    pub title_timeout_secs: u64,
    /// Per-request timeout for metadata endpoints, in seconds
    pub metadata_timeout_secs: u64,
    /// Maximum annual-edition volumes probed per title
    pub max_volumes: u16,
}

/// Retry, racing and concurrency settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Maximum attempts per physical request
    pub max_attempts: u32,
    /// Base delay for exponential backoff, in seconds
    pub base_delay_secs: u64,
    /// Add random jitter to backoff delays
    pub jitter: bool,
    /// Maximum concurrent in-flight title fetches
    pub worker_budget: usize,
    /// Titles to process
    pub title_min: u16,
    pub title_max: u16,
    /// Titles skipped entirely (title 35 is reserved)
    pub excluded_titles: Vec<u16>,
    /// Annual-edition years fetched in historical mode, processed in the
    /// order given
    pub historical_years: Vec<u16>,
}

impl FetchConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    /// Titles this run covers, excluded ones removed.
    pub fn titles(&self) -> Vec<u16> {
        (self.title_min..=self.title_max)
            .filter(|t| !self.excluded_titles.contains(t))
            .collect()
    }
}

/// Persistence store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// sled database path
    pub db_path: PathBuf,
    /// Gzip section text before storing
    pub enable_compression: bool,
}

/// Granularity of the per-group similarity computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupGranularity {
    /// All sections of a title form one group
    Title,
    /// Sections sharing (title, chapter) form one group
    Chapter,
}

/// Similarity index settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    /// Hierarchy prefix defining a similarity group
    pub granularity: GroupGranularity,
    /// Default top-k for similar-section queries
    pub default_limit: usize,
    /// Scores below this are dropped from results
    pub min_similarity: f32,
    /// Vocabulary cap for the global index, by document frequency
    pub max_features: usize,
    /// Enable the global approximate nearest-neighbor index
    pub enable_global_index: bool,
    /// HNSW graph parameters for the global index
    pub hnsw: HnswConfig,
}

/// HNSW (Hierarchical Navigable Small World) parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswConfig {
    /// Bi-directional links per node
    pub m: usize,
    /// Candidate-list size during construction
    pub ef_construction: usize,
    /// Candidate-list size during search
    pub ef_search: usize,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON-formatted log lines
    pub json_format: bool,
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| PipelineError::Config {
                message: format!("failed to read config file {:?}: {}", path, e),
            })?;
            toml::from_str(&content)?
        } else {
            tracing::warn!(path = ?path, "configuration file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("CFR_PIPELINE_ECFR_BASE_URL") {
            self.sources.ecfr_base_url = url;
        }
        if let Ok(url) = std::env::var("CFR_PIPELINE_GOVINFO_ECFR_URL") {
            self.sources.govinfo_ecfr_url = url;
        }
        if let Ok(url) = std::env::var("CFR_PIPELINE_GOVINFO_CFR_URL") {
            self.sources.govinfo_cfr_url = url;
        }
        if let Ok(path) = std::env::var("CFR_PIPELINE_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Ok(workers) = std::env::var("CFR_PIPELINE_WORKERS") {
            self.fetch.worker_budget = workers.parse().map_err(|_| PipelineError::Config {
                message: "invalid worker count in CFR_PIPELINE_WORKERS".into(),
            })?;
        }
        if let Ok(attempts) = std::env::var("CFR_PIPELINE_MAX_ATTEMPTS") {
            self.fetch.max_attempts = attempts.parse().map_err(|_| PipelineError::Config {
                message: "invalid attempt count in CFR_PIPELINE_MAX_ATTEMPTS".into(),
            })?;
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.fetch.max_attempts == 0 {
            return Err(PipelineError::Config {
                message: "fetch.max_attempts must be at least 1".into(),
            });
        }
        if self.fetch.worker_budget == 0 {
            return Err(PipelineError::Config {
                message: "fetch.worker_budget must be at least 1".into(),
            });
        }
        if self.fetch.title_min == 0 || self.fetch.title_max > 50 {
            return Err(PipelineError::Config {
                message: "fetch.title range must stay within 1..=50".into(),
            });
        }
        if self.fetch.title_min > self.fetch.title_max {
            return Err(PipelineError::Config {
                message: "fetch.title_min cannot exceed fetch.title_max".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.similarity.min_similarity) {
            return Err(PipelineError::Config {
                message: "similarity.min_similarity must lie in [0, 1]".into(),
            });
        }
        if self.similarity.hnsw.m == 0 {
            return Err(PipelineError::Config {
                message: "similarity.hnsw.m must be greater than zero".into(),
            });
        }
        if self.similarity.hnsw.ef_search == 0 || self.similarity.hnsw.ef_construction == 0 {
            return Err(PipelineError::Config {
                message: "similarity.hnsw ef parameters must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: SourcesConfig::default(),
            fetch: FetchConfig::default(),
            storage: StorageConfig::default(),
            similarity: SimilarityConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            ecfr_base_url: "https://www.ecfr.gov/api".to_string(),
            govinfo_ecfr_url: "https://www.govinfo.gov/bulkdata/ECFR".to_string(),
            govinfo_cfr_url: "https://www.govinfo.gov/bulkdata/CFR".to_string(),
            title_timeout_secs: 120,
            metadata_timeout_secs: 30,
            max_volumes: 20,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 7,
            base_delay_secs: 3,
            jitter: false,
            worker_budget: 5,
            title_min: 1,
            title_max: 50,
            excluded_titles: vec![35],
            historical_years: vec![2025, 2020, 2015, 2010, 2005, 2000],
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/cfr.db"),
            enable_compression: true,
        }
    }
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            granularity: GroupGranularity::Chapter,
            default_limit: 10,
            min_similarity: 0.1,
            max_features: 10_000,
            enable_global_index: false,
            hnsw: HnswConfig::default(),
        }
    }
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}
