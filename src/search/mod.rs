// Search module
// Ranks stored pages against a query embedding, scoring on the store when it
// can and locally over a bounded scan when it cannot


use std::sync::Arc;

use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::SearchSettings;
use crate::embeddings::Embedder;
use crate::store::{DocumentStore, Scan, StoreResult};

/// Offset added by the store's scoring script so scores stay non-negative
pub const SCORE_OFFSET: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    /// Document id (its URL)
    pub id: String,
    /// Cosine similarity to the query
    pub score: f64,
}

pub struct SearchEngine {
    store: Arc<dyn DocumentStore>,
    embedder: Arc<Embedder>,
    settings: SearchSettings,
}

impl SearchEngine {
    #[inline]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<Embedder>,
        settings: &SearchSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            settings: settings.clone(),
        }
    }

    /// Results ordered by score descending, each at least `min_score`, at
    /// most `top_k` of them. A query that cannot be embedded has no results.
    #[inline]
    pub async fn search(&self, query: &str, index: &str) -> Result<Vec<SearchResult>> {
        let Some(query_vector) = self.embedder.embed(query).await else {
            warn!("Query could not be embedded, returning no results");
            return Ok(Vec::new());
        };

        match self.scored(index, &query_vector).await {
            Ok(results) => {
                debug!("Scored search on {} returned {} results", index, results.len());
                Ok(results)
            }
            Err(e) => {
                warn!(
                    "Scored search on {} failed, ranking a scan locally: {}",
                    index, e
                );
                self.ranked_scan(index, &query_vector).await
            }
        }
    }

    async fn scored(&self, index: &str, query_vector: &[f64]) -> StoreResult<Vec<SearchResult>> {
        let hits = self
            .store
            .scored_search(index, query_vector, self.settings.candidate_limit)
            .await?;

        // The store already orders hits; only the offset and threshold apply
        Ok(hits
            .into_iter()
            .map(|hit| SearchResult {
                id: hit.id,
                score: hit.score - SCORE_OFFSET,
            })
            .filter(|result| result.score >= self.settings.min_score)
            .take(self.settings.top_k)
            .collect())
    }

    async fn ranked_scan(&self, index: &str, query_vector: &[f64]) -> Result<Vec<SearchResult>> {
        let scan = Scan::open(
            Arc::clone(&self.store),
            index,
            self.settings.scan_batch_size,
            self.settings.scroll_ttl(),
        )
        .await?;
        let documents = scan.collect(self.settings.fallback_scan_limit).await?;
        info!(
            "Ranking {} scanned documents from {} locally",
            documents.len(),
            index
        );

        Ok(documents
            .into_iter()
            .filter(|document| document.has_embedding())
            .map(|document| SearchResult {
                score: cosine_similarity(query_vector, &document.embedding),
                id: document.url,
            })
            .filter(|result| result.score >= self.settings.min_score)
            .sorted_by(|a, b| b.score.total_cmp(&a.score))
            .take(self.settings.top_k)
            .collect())
    }
}

/// Cosine similarity; vectors of different lengths (or with a zero norm)
/// score 0
#[inline]
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
