// Configuration management module
// Loads config.toml from the configuration directory and validates it

pub mod settings;

pub use settings::{
    Config, ConfigError, CrawlerSettings, EmbeddingSettings, IndexingSettings, SearchSettings,
    StoreBackend, StoreSettings, normalize_blocklist,
};

/// Get the configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}
