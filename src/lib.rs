use thiserror::Error;

pub type Result<T> = std::result::Result<T, SemError>;

#[derive(Error, Debug)]
pub enum SemError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Crawler error: {0}")]
    Crawler(String),

    #[error("Interrupted during retry backoff after {attempts} attempt(s)")]
    Interrupted { attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub mod commands;
pub mod config;
pub mod crawler;
pub mod embeddings;
pub mod indexer;
pub mod search;
pub mod store;
