
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use itertools::Itertools;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    BulkItemError, BulkResponse, Document, DocumentStore, ScanCursor, ScoredHit, StoreError,
    StoreResult,
};
use crate::search::cosine_similarity;

/// In-process store with the same dimension and cursor rules as the
/// persistent backends
#[derive(Debug, Default)]
pub struct MemoryStore {
    indices: RwLock<HashMap<String, MemoryIndex>>,
    scans: Mutex<HashMap<String, MemoryScan>>,
}

#[derive(Debug)]
struct MemoryIndex {
    dimension: usize,
    documents: BTreeMap<String, Document>,
}

#[derive(Debug)]
struct MemoryScan {
    ids: Vec<String>,
    position: usize,
    batch_size: usize,
    expires_at: Instant,
}

impl MemoryIndex {
    fn validate(&self, document: &Document) -> StoreResult<()> {
        if document.has_embedding() && document.embedding.len() != self.dimension {
            return Err(StoreError::InvalidDocument {
                id: document.url.clone(),
                reason: format!(
                    "embedding has {} dimensions, index expects {}",
                    document.embedding.len(),
                    self.dimension
                ),
            });
        }
        Ok(())
    }
}

impl MemoryStore {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of scans that have not been released yet
    #[inline]
    pub fn open_scans(&self) -> usize {
        self.scans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn with_index<T>(
        &self,
        index: &str,
        f: impl FnOnce(&MemoryIndex) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let indices = self.indices.read().unwrap_or_else(PoisonError::into_inner);
        let found = indices
            .get(index)
            .ok_or_else(|| StoreError::IndexNotFound(index.to_string()))?;
        f(found)
    }

    fn with_index_mut<T>(
        &self,
        index: &str,
        f: impl FnOnce(&mut MemoryIndex) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut indices = self.indices.write().unwrap_or_else(PoisonError::into_inner);
        let found = indices
            .get_mut(index)
            .ok_or_else(|| StoreError::IndexNotFound(index.to_string()))?;
        f(found)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> bool {
        true
    }

    async fn index_exists(&self, index: &str) -> StoreResult<bool> {
        Ok(self
            .indices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(index))
    }

    async fn create_index(&self, index: &str, dimension: usize) -> StoreResult<()> {
        let mut indices = self.indices.write().unwrap_or_else(PoisonError::into_inner);
        if indices.contains_key(index) {
            info!("Index {} already exists.", index);
            return Ok(());
        }
        indices.insert(
            index.to_string(),
            MemoryIndex {
                dimension,
                documents: BTreeMap::new(),
            },
        );
        info!("Index created: {} ({} dimensions)", index, dimension);
        Ok(())
    }

    async fn exists(&self, index: &str, id: &str) -> StoreResult<bool> {
        self.with_index(index, |found| Ok(found.documents.contains_key(id)))
    }

    async fn put(&self, index: &str, document: &Document) -> StoreResult<()> {
        self.with_index_mut(index, |found| {
            found.validate(document)?;
            found
                .documents
                .insert(document.url.clone(), document.clone());
            debug!("Indexed document with ID: {}", document.url);
            Ok(())
        })
    }

    async fn bulk_put(&self, index: &str, documents: &[Document]) -> StoreResult<BulkResponse> {
        self.with_index_mut(index, |found| {
            let mut failures = Vec::new();
            for document in documents {
                match found.validate(document) {
                    Ok(()) => {
                        found
                            .documents
                            .insert(document.url.clone(), document.clone());
                    }
                    Err(e) => failures.push(BulkItemError {
                        id: document.url.clone(),
                        reason: e.to_string(),
                    }),
                }
            }
            Ok(BulkResponse {
                items: documents.len(),
                failures,
            })
        })
    }

    async fn delete(&self, index: &str, id: &str) -> StoreResult<bool> {
        self.with_index_mut(index, |found| Ok(found.documents.remove(id).is_some()))
    }

    async fn count(&self, index: &str) -> StoreResult<u64> {
        self.with_index(index, |found| Ok(found.documents.len() as u64))
    }

    async fn scored_search(
        &self,
        index: &str,
        query_vector: &[f64],
        limit: usize,
    ) -> StoreResult<Vec<ScoredHit>> {
        self.with_index(index, |found| {
            Ok(found
                .documents
                .values()
                .filter(|document| document.has_embedding())
                .map(|document| ScoredHit {
                    id: document.url.clone(),
                    score: cosine_similarity(query_vector, &document.embedding) + 1.0,
                })
                .sorted_by(|a, b| b.score.total_cmp(&a.score))
                .take(limit)
                .collect())
        })
    }

    async fn scan_open(
        &self,
        index: &str,
        batch_size: usize,
        ttl: Duration,
    ) -> StoreResult<ScanCursor> {
        let ids = self.with_index(index, |found| {
            Ok(found.documents.keys().cloned().collect::<Vec<_>>())
        })?;

        let cursor = ScanCursor::new(Uuid::new_v4().to_string(), index, ttl);
        self.scans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                cursor.id.clone(),
                MemoryScan {
                    ids,
                    position: 0,
                    batch_size: batch_size.max(1),
                    expires_at: Instant::now() + ttl,
                },
            );
        Ok(cursor)
    }

    async fn scan_next(&self, cursor: &mut ScanCursor) -> StoreResult<Vec<Document>> {
        let mut scans = self.scans.lock().unwrap_or_else(PoisonError::into_inner);
        let scan = scans
            .get_mut(&cursor.id)
            .ok_or_else(|| StoreError::CursorExpired(cursor.id.clone()))?;

        let now = Instant::now();
        if now > scan.expires_at {
            scans.remove(&cursor.id);
            return Err(StoreError::CursorExpired(cursor.id.clone()));
        }
        scan.expires_at = now + cursor.ttl;

        // Documents deleted since the scan opened are skipped
        self.with_index(&cursor.index, |found| {
            let mut batch = Vec::new();
            while batch.is_empty() && scan.position < scan.ids.len() {
                let end = (scan.position + scan.batch_size).min(scan.ids.len());
                batch.extend(
                    scan.ids[scan.position..end]
                        .iter()
                        .filter_map(|id| found.documents.get(id).cloned()),
                );
                scan.position = end;
            }
            Ok(batch)
        })
    }

    async fn scan_close(&self, cursor: ScanCursor) -> StoreResult<()> {
        self.scans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&cursor.id);
        Ok(())
    }
}
