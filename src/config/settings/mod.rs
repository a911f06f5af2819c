
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_EMBEDDING_DIMENSION: usize = 768;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub crawler: CrawlerSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    #[serde(default)]
    pub indexing: IndexingSettings,
    #[serde(default)]
    pub search: SearchSettings,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Frontier and fetch settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrawlerSettings {
    /// Default seed used when no URL is given on the command line
    pub base_url: String,
    /// Tasks deeper than this are never fetched
    pub max_depth: u32,
    /// Case-insensitive substrings; any URL containing one is skipped
    #[serde(deserialize_with = "comma_separated")]
    pub blocked_domains: Vec<String>,
    /// Number of concurrent fetch workers
    pub concurrency: usize,
    /// Pause applied by each worker after every dequeued task
    pub politeness_delay_ms: u64,
    pub fetch_timeout_seconds: u64,
    pub user_agent: String,
}

impl Default for CrawlerSettings {
    #[inline]
    fn default() -> Self {
        Self {
            base_url: "https://example.com".to_string(),
            max_depth: 2,
            blocked_domains: Vec::new(),
            concurrency: 1,
            politeness_delay_ms: 200,
            fetch_timeout_seconds: 10,
            user_agent: "semsearch/0.1.0 (Semantic Indexer)".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Elasticsearch,
    Lance,
    Memory,
}

impl fmt::Display for StoreBackend {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Elasticsearch => write!(f, "elasticsearch"),
            Self::Lance => write!(f, "lance"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// Name of the index (or table) every document is written to
    pub index_db: String,
    pub elasticsearch_url: String,
    pub request_timeout_seconds: u64,
    /// Embedding length the index is created with
    pub dimension: usize,
}

impl Default for StoreSettings {
    #[inline]
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            index_db: "my_index".to_string(),
            elasticsearch_url: "http://localhost:9200".to_string(),
            request_timeout_seconds: 30,
            dimension: DEFAULT_EMBEDDING_DIMENSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub embedding_host: String,
    pub model: String,
    /// Only this many characters of a page are embedded
    pub max_chars: usize,
    pub timeout_seconds: u64,
}

impl Default for EmbeddingSettings {
    #[inline]
    fn default() -> Self {
        Self {
            embedding_host: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            max_chars: 5000,
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexingSettings {
    /// Number of documents accumulated before a bulk write
    pub batch_size: usize,
    /// Total bulk attempts before falling back to individual writes
    pub max_attempts: u32,
    /// First retry delay; doubles after every failed attempt
    pub base_backoff_ms: u64,
    /// Pause between individual writes in fallback mode
    pub fallback_delay_ms: u64,
}

impl Default for IndexingSettings {
    #[inline]
    fn default() -> Self {
        Self {
            batch_size: 3,
            max_attempts: 3,
            base_backoff_ms: 1000,
            fallback_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchSettings {
    pub min_score: f64,
    pub top_k: usize,
    /// Candidates requested from the scored search
    pub candidate_limit: usize,
    /// Documents scanned when scoring falls back to the client
    pub fallback_scan_limit: usize,
    pub scan_batch_size: usize,
    pub scroll_ttl_seconds: u64,
}

impl Default for SearchSettings {
    #[inline]
    fn default() -> Self {
        Self {
            min_score: 0.7,
            top_k: 10,
            candidate_limit: 20,
            fallback_scan_limit: 500,
            scan_batch_size: 100,
            scroll_ttl_seconds: 60,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid concurrency: {0} (must be between 1 and 64)")]
    InvalidConcurrency(usize),
    #[error("Invalid fetch timeout: {0} (must be between 1 and 300 seconds)")]
    InvalidFetchTimeout(u64),
    #[error("Invalid store request timeout: {0} (must be between 1 and 300 seconds)")]
    InvalidRequestTimeout(u64),
    #[error("Invalid index name: {0:?} (must be non-empty lowercase without spaces)")]
    InvalidIndexName(String),
    #[error("Invalid embedding dimension: {0} (must be between 1 and 4096)")]
    InvalidEmbeddingDimension(usize),
    #[error("Invalid model name: {0:?} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid embedding timeout: {0} (must be between 1 and 600 seconds)")]
    InvalidEmbeddingTimeout(u64),
    #[error("Invalid max chars: {0} (must be greater than zero)")]
    InvalidMaxChars(usize),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(usize),
    #[error("Invalid max attempts: {0} (must be between 1 and 10)")]
    InvalidMaxAttempts(u32),
    #[error("Invalid min score: {0} (must be between 0 and 1)")]
    InvalidMinScore(f64),
    #[error("Invalid result limits: top_k {0}, candidates {1}, scan {2} (all must be non-zero)")]
    InvalidLimits(usize, usize, usize),
    #[error("Invalid scan batch size: {0} (must be between 1 and 10000)")]
    InvalidScanBatchSize(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Accepts either `"a.com, b.com"` or `["a.com", "b.com"]`
fn comma_separated<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Joined(String),
        List(Vec<String>),
    }

    let entries = match Raw::deserialize(deserializer)? {
        Raw::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        Raw::List(list) => list,
    };
    Ok(normalize_blocklist(entries))
}

/// Trim, lowercase and drop empty blocklist entries
#[inline]
pub fn normalize_blocklist<I, S>(entries: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .map(|entry| entry.as_ref().trim().to_lowercase())
        .filter(|entry| !entry.is_empty())
        .collect()
}

impl Config {
    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".semsearch"))
            .or_else(|| dirs::data_dir().map(|data| data.join("semsearch")))
            .ok_or(ConfigError::DirectoryError)
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        fs::create_dir_all(&self.base_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                self.base_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.crawler.validate()?;
        self.store.validate()?;
        self.embedding.validate()?;
        self.indexing.validate()?;
        self.search.validate()?;
        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.base_dir.join("config.toml")
    }

    /// Directory holding the lance tables
    #[inline]
    pub fn vector_database_path(&self) -> PathBuf {
        self.base_dir.join("vectors")
    }
}

fn parse_http_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|_| ConfigError::InvalidUrl(raw.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidUrl(raw.to_string()));
    }
    Ok(url)
}

impl CrawlerSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_http_url(&self.base_url)?;

        if !(1..=64).contains(&self.concurrency) {
            return Err(ConfigError::InvalidConcurrency(self.concurrency));
        }

        if !(1..=300).contains(&self.fetch_timeout_seconds) {
            return Err(ConfigError::InvalidFetchTimeout(self.fetch_timeout_seconds));
        }

        Ok(())
    }

    #[inline]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    #[inline]
    pub fn politeness_delay(&self) -> Duration {
        Duration::from_millis(self.politeness_delay_ms)
    }
}

impl StoreSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = self.index_db.as_str();
        if name.is_empty()
            || name.chars().any(|c| c.is_whitespace() || c.is_uppercase())
            || name.starts_with(['-', '_', '+'])
        {
            return Err(ConfigError::InvalidIndexName(self.index_db.clone()));
        }

        if self.backend == StoreBackend::Elasticsearch {
            parse_http_url(&self.elasticsearch_url)?;
        }

        if !(1..=300).contains(&self.request_timeout_seconds) {
            return Err(ConfigError::InvalidRequestTimeout(self.request_timeout_seconds));
        }

        if !(1..=4096).contains(&self.dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(self.dimension));
        }

        Ok(())
    }

    #[inline]
    pub fn elasticsearch_url(&self) -> Result<Url, ConfigError> {
        parse_http_url(&self.elasticsearch_url)
    }

    #[inline]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl EmbeddingSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_http_url(&self.embedding_host)?;

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if !(1..=600).contains(&self.timeout_seconds) {
            return Err(ConfigError::InvalidEmbeddingTimeout(self.timeout_seconds));
        }

        if self.max_chars == 0 {
            return Err(ConfigError::InvalidMaxChars(self.max_chars));
        }

        Ok(())
    }

    #[inline]
    pub fn host_url(&self) -> Result<Url, ConfigError> {
        parse_http_url(&self.embedding_host)
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl IndexingSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if !(1..=10).contains(&self.max_attempts) {
            return Err(ConfigError::InvalidMaxAttempts(self.max_attempts));
        }

        Ok(())
    }
}

impl SearchSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.min_score) {
            return Err(ConfigError::InvalidMinScore(self.min_score));
        }

        if self.top_k == 0 || self.candidate_limit == 0 || self.fallback_scan_limit == 0 {
            return Err(ConfigError::InvalidLimits(
                self.top_k,
                self.candidate_limit,
                self.fallback_scan_limit,
            ));
        }

        // Elasticsearch caps a scroll page at 10000 hits
        if !(1..=10_000).contains(&self.scan_batch_size) {
            return Err(ConfigError::InvalidScanBatchSize(self.scan_batch_size));
        }

        Ok(())
    }

    #[inline]
    pub fn scroll_ttl(&self) -> Duration {
        Duration::from_secs(self.scroll_ttl_seconds)
    }
}
