// Document store module
// One contract over the backends that persist crawled pages and their vectors

pub mod elastic;
pub mod lance;
pub mod memory;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use elastic::ElasticStore;
pub use lance::LanceStore;
pub use memory::MemoryStore;

/// A crawled page as it is persisted; the URL doubles as the unique id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub url: String,
    pub title: String,
    pub text: String,
    /// Empty when no embedding could be produced; such documents are
    /// never candidates for vector search
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "first_vector"
    )]
    pub embedding: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawled_at: Option<DateTime<Utc>>,
}

impl Document {
    #[inline]
    pub fn new(url: impl Into<String>, title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            text: text.into(),
            embedding: Vec::new(),
            crawled_at: Some(Utc::now()),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f64>) -> Self {
        self.embedding = embedding;
        self
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.url
    }

    #[inline]
    pub fn has_embedding(&self) -> bool {
        !self.embedding.is_empty()
    }
}

/// Stored embeddings are read back either flat or as a list of vectors,
/// in which case the first one is used
fn first_vector<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Stored {
        Flat(Vec<f64>),
        Nested(Vec<Vec<f64>>),
    }

    Ok(match Option::<Stored>::deserialize(deserializer)? {
        Some(Stored::Flat(vector)) => vector,
        Some(Stored::Nested(vectors)) => vectors.into_iter().next().unwrap_or_default(),
        None => Vec::new(),
    })
}

/// A per-document rejection inside an otherwise delivered bulk request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemError {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub items: usize,
    pub failures: Vec<BulkItemError>,
}

impl BulkResponse {
    #[inline]
    pub fn has_errors(&self) -> bool {
        !self.failures.is_empty()
    }

    #[inline]
    pub fn succeeded(&self) -> usize {
        self.items.saturating_sub(self.failures.len())
    }
}

/// A ranked hit with the backend's raw score (cosine similarity + 1.0)
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredHit {
    pub id: String,
    pub score: f64,
}

/// Handle on a server-side full scan
#[derive(Debug, Clone)]
pub struct ScanCursor {
    pub(crate) id: String,
    pub(crate) index: String,
    pub(crate) ttl: Duration,
    /// First page delivered together with the cursor by some backends
    pub(crate) buffered: Option<Vec<Document>>,
}

impl ScanCursor {
    pub(crate) fn new(id: impl Into<String>, index: &str, ttl: Duration) -> Self {
        Self {
            id: id.into(),
            index: index.to_string(),
            ttl,
            buffered: None,
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn index(&self) -> &str {
        &self.index
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Request rejected (status {status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Invalid document {id}: {reason}")]
    InvalidDocument { id: String, reason: String },

    #[error("Scan cursor expired or unknown: {0}")]
    CursorExpired(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the failure concerns delivery rather than the payload
    #[inline]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Operations the crawler, indexer and search engine need from a store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Short backend name used in logs
    fn name(&self) -> &'static str;

    async fn ping(&self) -> bool;

    async fn index_exists(&self, index: &str) -> StoreResult<bool>;

    /// Create an index for vectors of `dimension`; no-op if it exists
    async fn create_index(&self, index: &str, dimension: usize) -> StoreResult<()>;

    async fn exists(&self, index: &str, id: &str) -> StoreResult<bool>;

    async fn put(&self, index: &str, document: &Document) -> StoreResult<()>;

    /// Write all documents in one request. `Err` means the request as a whole
    /// was not delivered; individual rejections are reported in the response.
    async fn bulk_put(&self, index: &str, documents: &[Document]) -> StoreResult<BulkResponse>;

    /// Returns whether a document was removed
    async fn delete(&self, index: &str, id: &str) -> StoreResult<bool>;

    async fn count(&self, index: &str) -> StoreResult<u64>;

    /// Rank documents with an embedding by `cosine + 1.0`, best first
    async fn scored_search(
        &self,
        index: &str,
        query_vector: &[f64],
        limit: usize,
    ) -> StoreResult<Vec<ScoredHit>>;

    async fn scan_open(&self, index: &str, batch_size: usize, ttl: Duration)
    -> StoreResult<ScanCursor>;

    /// Next batch of the scan; an empty batch means the scan is exhausted
    async fn scan_next(&self, cursor: &mut ScanCursor) -> StoreResult<Vec<Document>>;

    async fn scan_close(&self, cursor: ScanCursor) -> StoreResult<()>;

    /// Create the index when it is missing
    async fn ensure_index(&self, index: &str, dimension: usize) -> StoreResult<()> {
        if self.index_exists(index).await? {
            debug!("Index {} already exists", index);
            return Ok(());
        }
        self.create_index(index, dimension).await
    }
}

/// A full scan whose cursor is released when the scan is closed, exhausted
/// or dropped
pub struct Scan {
    store: Arc<dyn DocumentStore>,
    cursor: Option<ScanCursor>,
}

impl Scan {
    #[inline]
    pub async fn open(
        store: Arc<dyn DocumentStore>,
        index: &str,
        batch_size: usize,
        ttl: Duration,
    ) -> StoreResult<Self> {
        let cursor = store.scan_open(index, batch_size, ttl).await?;
        debug!("Opened scan {} on {}", cursor.id, index);
        Ok(Self {
            store,
            cursor: Some(cursor),
        })
    }

    /// Returns `None` once the scan is exhausted; the cursor is released at
    /// that point
    #[inline]
    pub async fn next_batch(&mut self) -> StoreResult<Option<Vec<Document>>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };

        let batch = self.store.scan_next(cursor).await?;
        if batch.is_empty() {
            self.release().await?;
            return Ok(None);
        }
        Ok(Some(batch))
    }

    /// Release the cursor without reading the remaining batches
    #[inline]
    pub async fn close(mut self) -> StoreResult<()> {
        self.release().await
    }

    /// Drain the scan, stopping early once `limit` documents are collected
    #[inline]
    pub async fn collect(mut self, limit: usize) -> StoreResult<Vec<Document>> {
        let mut documents = Vec::new();
        while documents.len() < limit {
            match self.next_batch().await? {
                Some(batch) => documents.extend(batch),
                None => break,
            }
        }
        documents.truncate(limit);
        self.release().await?;
        Ok(documents)
    }

    async fn release(&mut self) -> StoreResult<()> {
        if let Some(cursor) = self.cursor.take() {
            debug!("Releasing scan {}", cursor.id);
            self.store.scan_close(cursor).await?;
        }
        Ok(())
    }
}

impl Drop for Scan {
    fn drop(&mut self) {
        let Some(cursor) = self.cursor.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.store);
                handle.spawn(async move {
                    let id = cursor.id.clone();
                    if let Err(e) = store.scan_close(cursor).await {
                        warn!("Failed to release abandoned scan {}: {}", id, e);
                    }
                });
            }
            Err(_) => {
                warn!(
                    "Scan {} dropped outside a runtime, leaving it to expire",
                    cursor.id
                );
            }
        }
    }
}
