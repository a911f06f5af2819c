// Indexer module
// Batches crawled documents and writes them to the store, retrying whole-batch
// delivery failures and falling back to one write per document


use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::IndexingSettings;
use crate::store::{BulkResponse, Document, DocumentStore};
use crate::{Result, SemError};

/// How a batch ended up in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    Bulk,
    Individual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Documents in the flushed batch
    pub documents: usize,
    pub mode: FlushMode,
    /// Documents the store rejected or that could not be written
    pub failed: usize,
}

impl FlushReport {
    #[inline]
    pub fn written(&self) -> usize {
        self.documents.saturating_sub(self.failed)
    }
}

/// Aborts a flush that is waiting out a retry backoff
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl InterruptHandle {
    #[inline]
    pub fn interrupt(&self) {
        self.sender.send_replace(true);
    }
}

/// Owns the pending batch; callers only `add` and `flush`
pub struct IndexingPipeline {
    store: Arc<dyn DocumentStore>,
    index: String,
    settings: IndexingSettings,
    batch: Mutex<Vec<Document>>,
    interrupt: Arc<watch::Sender<bool>>,
}

impl IndexingPipeline {
    #[inline]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        index: impl Into<String>,
        settings: &IndexingSettings,
    ) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            store,
            index: index.into(),
            settings: settings.clone(),
            batch: Mutex::new(Vec::with_capacity(settings.batch_size)),
            interrupt: Arc::new(sender),
        }
    }

    #[inline]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            sender: Arc::clone(&self.interrupt),
        }
    }

    /// Documents waiting for the next flush
    #[inline]
    pub fn pending(&self) -> usize {
        self.batch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queue a document, flushing when the batch reaches its threshold
    #[inline]
    pub async fn add(&self, document: Document) -> Result<Option<FlushReport>> {
        let full_batch = {
            let mut batch = self.batch.lock().unwrap_or_else(PoisonError::into_inner);
            batch.push(document);
            if batch.len() >= self.settings.batch_size {
                Some(mem::take(&mut *batch))
            } else {
                None
            }
        };

        match full_batch {
            Some(documents) => self.write_batch(documents).await.map(Some),
            None => Ok(None),
        }
    }

    /// Write whatever is pending; `None` when there was nothing to write
    #[inline]
    pub async fn flush(&self) -> Result<Option<FlushReport>> {
        let documents = {
            let mut batch = self.batch.lock().unwrap_or_else(PoisonError::into_inner);
            mem::take(&mut *batch)
        };
        if documents.is_empty() {
            return Ok(None);
        }
        self.write_batch(documents).await.map(Some)
    }

    async fn write_batch(&self, documents: Vec<Document>) -> Result<FlushReport> {
        debug!(
            "Flushing {} documents to index {}",
            documents.len(),
            self.index
        );

        let max_attempts = self.settings.max_attempts.max(1);
        let mut delay = Duration::from_millis(self.settings.base_backoff_ms);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.store.bulk_put(&self.index, &documents).await {
                Ok(response) => {
                    Self::log_item_errors(&self.index, &response);
                    info!(
                        "Bulk indexed {} of {} documents into {}",
                        response.succeeded(),
                        documents.len(),
                        self.index
                    );
                    return Ok(FlushReport {
                        documents: documents.len(),
                        mode: FlushMode::Bulk,
                        failed: response.failures.len(),
                    });
                }
                Err(e) if e.is_transport() && attempt < max_attempts => {
                    warn!(
                        "Bulk write to {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        self.index, attempt, max_attempts, e, delay
                    );
                    self.backoff(delay, attempt).await?;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    error!(
                        "Bulk write to {} failed after {} attempt(s): {}",
                        self.index, attempt, e
                    );
                    break;
                }
            }
        }

        Ok(self.write_individually(&documents).await)
    }

    /// Sleep before the next attempt unless interrupted first
    async fn backoff(&self, delay: Duration, attempts: u32) -> Result<()> {
        let mut interrupted = self.interrupt.subscribe();
        tokio::select! {
            () = sleep(delay) => Ok(()),
            _ = interrupted.wait_for(|flag| *flag) => {
                error!(
                    "Flush to {} interrupted during retry backoff after {} attempt(s)",
                    self.index, attempts
                );
                Err(SemError::Interrupted { attempts })
            }
        }
    }

    async fn write_individually(&self, documents: &[Document]) -> FlushReport {
        info!(
            "Falling back to individual writes for {} documents",
            documents.len()
        );

        let fallback_delay = Duration::from_millis(self.settings.fallback_delay_ms);
        let mut failed = 0;
        for (position, document) in documents.iter().enumerate() {
            if position > 0 {
                sleep(fallback_delay).await;
            }
            match self.store.put(&self.index, document).await {
                Ok(()) => debug!("Individually indexed {}", document.url),
                Err(e) => {
                    failed += 1;
                    error!("Failed to index document {}: {}", document.url, e);
                }
            }
        }

        FlushReport {
            documents: documents.len(),
            mode: FlushMode::Individual,
            failed,
        }
    }

    fn log_item_errors(index: &str, response: &BulkResponse) {
        for failure in &response.failures {
            warn!(
                "Document {} rejected by {}: {}",
                failure.id, index, failure.reason
            );
        }
    }
}
