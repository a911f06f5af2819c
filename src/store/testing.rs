// Test double shared by the unit tests of the store consumers

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{
    BulkResponse, Document, DocumentStore, MemoryStore, ScanCursor, ScoredHit, StoreError,
    StoreResult,
};

/// Memory store with injectable failures that records how it was called
#[derive(Debug, Default)]
pub struct RecordingStore {
    pub inner: MemoryStore,
    /// Number of upcoming bulk requests that fail as a whole
    pub bulk_failures: AtomicU32,
    /// Whole-batch failures are rejections instead of transport errors
    pub reject_bulk: bool,
    /// Ids whose individual writes are rejected
    pub reject_puts: Vec<String>,
    pub fail_scoring: bool,
    pub fail_index_creation: bool,
    pub fail_exists: bool,
    pub bulk_calls: Mutex<Vec<(Instant, Vec<String>)>>,
    pub put_calls: Mutex<Vec<String>>,
    pub scans_opened: AtomicUsize,
}

impl RecordingStore {
    pub async fn with_index(self, dimension: usize) -> Self {
        self.inner
            .create_index("pages", dimension)
            .await
            .expect("should create index");
        self
    }

    pub fn bulk_call_times(&self) -> Vec<Instant> {
        self.bulk_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn bulk_batches(&self) -> Vec<Vec<String>> {
        self.bulk_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, ids)| ids.clone())
            .collect()
    }

    pub fn puts(&self) -> Vec<String> {
        self.put_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn scans(&self) -> usize {
        self.scans_opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for RecordingStore {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn ping(&self) -> bool {
        true
    }

    async fn index_exists(&self, index: &str) -> StoreResult<bool> {
        self.inner.index_exists(index).await
    }

    async fn create_index(&self, index: &str, dimension: usize) -> StoreResult<()> {
        if self.fail_index_creation {
            return Err(StoreError::Rejected {
                status: 403,
                reason: "cluster_block_exception".to_string(),
            });
        }
        self.inner.create_index(index, dimension).await
    }

    async fn exists(&self, index: &str, id: &str) -> StoreResult<bool> {
        if self.fail_exists {
            return Err(StoreError::Transport("connection reset".to_string()));
        }
        self.inner.exists(index, id).await
    }

    async fn put(&self, index: &str, document: &Document) -> StoreResult<()> {
        self.put_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(document.url.clone());
        if self.reject_puts.contains(&document.url) {
            return Err(StoreError::Rejected {
                status: 400,
                reason: "mapper_parsing_exception".to_string(),
            });
        }
        self.inner.put(index, document).await
    }

    async fn bulk_put(&self, index: &str, documents: &[Document]) -> StoreResult<BulkResponse> {
        self.bulk_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((
                Instant::now(),
                documents.iter().map(|d| d.url.clone()).collect(),
            ));

        let remaining = self.bulk_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.bulk_failures.store(remaining - 1, Ordering::SeqCst);
            if self.reject_bulk {
                return Err(StoreError::Rejected {
                    status: 400,
                    reason: "malformed bulk body".to_string(),
                });
            }
            return Err(StoreError::Transport("connection refused".to_string()));
        }
        self.inner.bulk_put(index, documents).await
    }

    async fn delete(&self, index: &str, id: &str) -> StoreResult<bool> {
        self.inner.delete(index, id).await
    }

    async fn count(&self, index: &str) -> StoreResult<u64> {
        self.inner.count(index).await
    }

    async fn scored_search(
        &self,
        index: &str,
        query_vector: &[f64],
        limit: usize,
    ) -> StoreResult<Vec<ScoredHit>> {
        if self.fail_scoring {
            return Err(StoreError::Rejected {
                status: 400,
                reason: "script_score is not supported".to_string(),
            });
        }
        self.inner.scored_search(index, query_vector, limit).await
    }

    async fn scan_open(
        &self,
        index: &str,
        batch_size: usize,
        ttl: Duration,
    ) -> StoreResult<ScanCursor> {
        self.scans_opened.fetch_add(1, Ordering::SeqCst);
        self.inner.scan_open(index, batch_size, ttl).await
    }

    async fn scan_next(&self, cursor: &mut ScanCursor) -> StoreResult<Vec<Document>> {
        self.inner.scan_next(cursor).await
    }

    async fn scan_close(&self, cursor: ScanCursor) -> StoreResult<()> {
        self.inner.scan_close(cursor).await
    }
}
