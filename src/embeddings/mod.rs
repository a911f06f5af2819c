// Embeddings module
// Turns page and query text into fixed-size vectors through a pluggable backend

pub mod ollama;


use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::EmbeddingSettings;

pub use ollama::OllamaBackend;

/// Source of embedding vectors
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Cheap liveness probe
    async fn ping(&self) -> bool;

    async fn embed(&self, model: &str, text: &str) -> anyhow::Result<Vec<f64>>;
}

/// Embeds text with truncation, a liveness check before each call and a
/// dimension check on the result
pub struct Embedder {
    backend: Arc<dyn EmbeddingBackend>,
    model: String,
    max_chars: usize,
    dimension: usize,
}

impl Embedder {
    #[inline]
    pub fn new(
        backend: Arc<dyn EmbeddingBackend>,
        settings: &EmbeddingSettings,
        dimension: usize,
    ) -> Self {
        Self {
            backend,
            model: settings.model.clone(),
            max_chars: settings.max_chars,
            dimension,
        }
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub async fn is_available(&self) -> bool {
        self.backend.ping().await
    }

    /// Embed the leading `max_chars` characters of `text`.
    ///
    /// Returns `None` for empty input, when the backend is unreachable or
    /// when the call fails. Failures are not retried.
    #[inline]
    pub async fn embed(&self, text: &str) -> Option<Vec<f64>> {
        let chunk = truncate_text(text, self.max_chars);
        if chunk.trim().is_empty() {
            debug!("Nothing to embed");
            return None;
        }

        if !self.backend.ping().await {
            warn!("Embedding backend is unreachable, skipping embedding");
            return None;
        }

        match self.backend.embed(&self.model, chunk).await {
            Ok(vector) if vector.len() == self.dimension => {
                debug!("Generated embedding with {} dimensions", vector.len());
                Some(vector)
            }
            Ok(vector) => {
                warn!(
                    "Model {} returned {} dimensions, expected {}",
                    self.model,
                    vector.len(),
                    self.dimension
                );
                None
            }
            Err(e) => {
                warn!("Error generating embedding: {:#}", e);
                None
            }
        }
    }
}

/// First `max_chars` characters of `text`, cut back to the last whitespace
/// so no word is split unless the character at the cut is whitespace itself
#[inline]
pub fn truncate_text(text: &str, max_chars: usize) -> &str {
    let Some((cut, at)) = text.char_indices().nth(max_chars) else {
        return text;
    };

    let (head, _) = text.split_at(cut);
    let end = if at.is_whitespace() {
        cut
    } else {
        head.rfind(char::is_whitespace)
            .filter(|&space| space > 0)
            .unwrap_or(cut)
    };

    let (kept, _) = text.split_at(end);
    kept.trim()
}
