//! TOML configuration.
//!
//! ```toml
//! [storage]
//! root = "./memory_files"
//!
//! [db]                      # omit to run in mirror-only mode
//! path = "./data/memory.sqlite"
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//! ```
//!
//! Every other field has a default; see the `default_*` functions below.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    /// Searchable store. `None` selects mirror-only mode.
    #[serde(default)]
    pub db: Option<DbConfig>,
    #[serde(default)]
    pub segmenting: SegmentingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Root document, relative to `root`.
    #[serde(default = "default_main_file")]
    pub main_file: String,
    /// JSON metadata index, relative to `root`.
    #[serde(default = "default_index_file")]
    pub index_file: String,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            main_file: default_main_file(),
            index_file: default_index_file(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("./memory_files")
}
fn default_main_file() -> String {
    "main.md".to_string()
}
fn default_index_file() -> String {
    "files_index.json".to_string()
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct SegmentingConfig {
    /// Maximum segment size in characters.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Characters repeated between consecutive sub-segments of a long section.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for SegmentingConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_max_size() -> usize {
    800
}
fn default_overlap() -> usize {
    200
}

/// What to do when vector or hybrid search is requested without an
/// embedding provider.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MissingEmbeddings {
    /// Downgrade to fulltext and report the effective mode on each hit.
    #[default]
    Fallback,
    /// Fail with a `Degraded` error.
    Error,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default)]
    pub on_missing_embeddings: MissingEmbeddings,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            default_limit: default_limit(),
            on_missing_embeddings: MissingEmbeddings::default(),
        }
    }
}

fn default_rrf_k() -> f64 {
    60.0
}
fn default_limit() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Documents synchronized in parallel by a full sync.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Upper bound on the segment/embed/store phase of one document.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            timeout_secs: None,
        }
    }
}

impl SyncConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Defaults rooted at `root`, without a store.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                root: root.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn main_file_path(&self) -> PathBuf {
        self.storage.root.join(&self.storage.main_file)
    }

    pub fn index_file_path(&self) -> PathBuf {
        self.storage.root.join(&self.storage.index_file)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Segmenting
    if config.segmenting.max_size == 0 {
        anyhow::bail!("segmenting.max_size must be > 0");
    }
    if config.segmenting.overlap >= config.segmenting.max_size {
        anyhow::bail!("segmenting.overlap must be < segmenting.max_size");
    }

    // Retrieval
    if config.retrieval.rrf_k <= 0.0 {
        anyhow::bail!("retrieval.rrf_k must be > 0");
    }
    if config.retrieval.default_limit < 1 {
        anyhow::bail!("retrieval.default_limit must be >= 1");
    }

    // Sync
    if config.sync.concurrency < 1 {
        anyhow::bail!("sync.concurrency must be >= 1");
    }
    if config.sync.timeout_secs == Some(0) {
        anyhow::bail!("sync.timeout_secs must be > 0 when set");
    }

    // Embedding
    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if embedding.batch_size < 1 {
        anyhow::bail!("embedding.batch_size must be >= 1");
    }
    if embedding.is_enabled() && embedding.provider != "local" {
        if embedding.dims.is_none() || embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                embedding.provider
            );
        }
        if embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                embedding.provider
            );
        }
    }

    Ok(())
}
