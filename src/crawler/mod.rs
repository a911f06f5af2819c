// Crawl engine
// Breadth-first traversal from a seed url, feeding fetched pages through the
// embedder into the indexing pipeline

pub mod fetcher;
pub mod frontier;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub use self::fetcher::{Fetcher, HttpFetcher, Page, validate_url};
pub use self::frontier::{CrawlTask, Frontier, Rejection};
use crate::config::{Config, CrawlerSettings};
use crate::embeddings::Embedder;
use crate::indexer::{FlushReport, IndexingPipeline, InterruptHandle};
use crate::store::{Document, DocumentStore};
use crate::{Result, SemError};

/// Statistics about a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlSummary {
    /// Urls dequeued and processed
    pub visited_count: usize,
    /// Documents written to the store
    pub indexed_count: usize,
    /// Pages that were already in the store; only their links were followed
    pub already_indexed: usize,
    pub failed_fetches: usize,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    indexed: AtomicUsize,
    already_indexed: AtomicUsize,
    failed_fetches: AtomicUsize,
}

impl Counters {
    fn record(&self, report: Option<FlushReport>) {
        if let Some(report) = report {
            self.indexed.fetch_add(report.written(), Ordering::Relaxed);
        }
    }
}

/// Stops frontier dequeues; tasks already being processed still finish
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    #[inline]
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }
}

pub struct CrawlEngine {
    store: Arc<dyn DocumentStore>,
    fetcher: Arc<dyn Fetcher>,
    embedder: Arc<Embedder>,
    pipeline: IndexingPipeline,
    settings: CrawlerSettings,
    index: String,
    dimension: usize,
    shutdown: Arc<watch::Sender<bool>>,
}

impl CrawlEngine {
    #[inline]
    pub fn new(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        fetcher: Arc<dyn Fetcher>,
        embedder: Arc<Embedder>,
    ) -> Self {
        let index = config.store.index_db.clone();
        let pipeline = IndexingPipeline::new(Arc::clone(&store), index.clone(), &config.indexing);
        let (sender, _) = watch::channel(false);

        Self {
            store,
            fetcher,
            embedder,
            pipeline,
            settings: config.crawler.clone(),
            index,
            dimension: config.store.dimension,
            shutdown: Arc::new(sender),
        }
    }

    #[inline]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: Arc::clone(&self.shutdown),
        }
    }

    #[inline]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.pipeline.interrupt_handle()
    }

    /// Crawl everything reachable from `seed` within the configured depth.
    ///
    /// Fails before any page is fetched when the seed is invalid or the
    /// index cannot be created. Per-page failures are logged and counted.
    #[inline]
    pub async fn crawl(&self, seed: &str) -> Result<CrawlSummary> {
        let start_time = Instant::now();
        let seed = validate_url(seed).map_err(|e| SemError::Crawler(format!("{:#}", e)))?;

        if let Err(e) = self.store.ensure_index(&self.index, self.dimension).await {
            error!(
                "Failed to create index {} on {}: {}",
                self.index,
                self.store.name(),
                e
            );
            return Err(e.into());
        }

        info!(
            "Starting crawl at {} (max depth {}, {} worker(s))",
            seed, self.settings.max_depth, self.settings.concurrency
        );

        let frontier = Frontier::new(self.settings.max_depth, &self.settings.blocked_domains);
        if let Err(reason) = frontier.push(CrawlTask::new(seed.as_str(), 0)) {
            warn!("Seed url {} rejected: {:?}", seed, reason);
        }

        let counters = Counters::default();
        let bar = if console::user_attended_stderr() {
            ProgressBar::new_spinner().with_style(
                ProgressStyle::with_template("{spinner} [{pos}] Crawling {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            )
        } else {
            ProgressBar::hidden()
        };

        let workers = join_all(
            (0..self.settings.concurrency.max(1))
                .map(|worker| self.worker(worker, &frontier, &counters, &bar)),
        );
        tokio::pin!(workers);

        let mut shutdown = self.shutdown.subscribe();
        let results = tokio::select! {
            biased;
            _ = shutdown.wait_for(|flag| *flag) => {
                info!("Shutdown requested, draining in-flight pages");
                frontier.close();
                workers.await
            }
            results = &mut workers => results,
        };
        bar.finish_and_clear();

        for result in results {
            result?;
        }

        // Whatever is left in the batch is written even after a shutdown
        counters.record(self.pipeline.flush().await?);

        let summary = CrawlSummary {
            visited_count: frontier.visited_count(),
            indexed_count: counters.indexed.load(Ordering::Relaxed),
            already_indexed: counters.already_indexed.load(Ordering::Relaxed),
            failed_fetches: counters.failed_fetches.load(Ordering::Relaxed),
            duration: start_time.elapsed(),
        };
        info!(
            "Crawl completed: {} visited, {} indexed, {} already indexed, {} failed, took {:?}",
            summary.visited_count,
            summary.indexed_count,
            summary.already_indexed,
            summary.failed_fetches,
            summary.duration
        );

        Ok(summary)
    }

    async fn worker(
        &self,
        worker: usize,
        frontier: &Frontier,
        counters: &Counters,
        bar: &ProgressBar,
    ) -> Result<()> {
        while let Some(task) = frontier.next().await {
            bar.set_message(task.url.clone());
            let outcome = self.process(&task, frontier, counters).await;
            frontier.complete();
            bar.inc(1);

            if let Err(e) = outcome {
                error!("Worker {} aborting crawl at {}: {}", worker, task.url, e);
                frontier.close();
                return Err(e);
            }

            sleep(self.settings.politeness_delay()).await;
        }
        debug!("Worker {} finished", worker);
        Ok(())
    }

    /// Only pipeline failures are returned; everything else is per-page
    async fn process(
        &self,
        task: &CrawlTask,
        frontier: &Frontier,
        counters: &Counters,
    ) -> Result<()> {
        let already_indexed = match self.store.exists(&self.index, &task.url).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!("Failed to check whether {} is indexed: {}", task.url, e);
                false
            }
        };
        if already_indexed {
            info!("Already indexed, following links only: {}", task.url);
            counters.already_indexed.fetch_add(1, Ordering::Relaxed);
        }

        let page = match self.fetcher.fetch(&task.url).await {
            Ok(page) => page,
            Err(e) => {
                warn!("Error crawling {}: {:#}", task.url, e);
                counters.failed_fetches.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };
        info!("Depth {}: {}", task.depth, task.url);

        let Page { title, text, links } = page;

        if !already_indexed {
            let embedding = self.embedder.embed(&text).await;
            let mut document = Document::new(task.url.as_str(), title, text);
            match embedding {
                Some(embedding) => document = document.with_embedding(embedding),
                None => warn!(
                    "No embedding for {}; indexing it without a vector",
                    task.url
                ),
            }
            counters.record(self.pipeline.add(document).await?);
        }

        for link in links {
            let child = CrawlTask::new(link.as_str(), task.depth + 1);
            if let Err(reason) = frontier.push(child) {
                debug!("Not queueing {}: {:?}", link, reason);
            }
        }

        Ok(())
    }
}
