// Command implementations behind the CLI


use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use tracing::{error, info, warn};

use crate::config::{Config, SearchSettings, StoreBackend};
use crate::crawler::{CrawlEngine, CrawlSummary, HttpFetcher};
use crate::embeddings::{Embedder, OllamaBackend};
use crate::search::{SearchEngine, SearchResult};
use crate::store::{DocumentStore, ElasticStore, LanceStore, MemoryStore, Scan};

/// Open the store selected in the configuration
#[inline]
pub async fn open_store(config: &Config) -> Result<Arc<dyn DocumentStore>> {
    let store: Arc<dyn DocumentStore> = match config.store.backend {
        StoreBackend::Elasticsearch => Arc::new(ElasticStore::new(
            config.store.elasticsearch_url()?,
            config.store.request_timeout(),
        )),
        StoreBackend::Lance => {
            let path = config.vector_database_path();
            Arc::new(
                LanceStore::open(&path)
                    .await
                    .with_context(|| format!("Failed to open vector store at {}", path.display()))?,
            )
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; documents are discarded on exit");
            Arc::new(MemoryStore::new())
        }
    };
    info!("Using {} document store", store.name());
    Ok(store)
}

#[inline]
pub fn open_embedder(config: &Config) -> Result<Arc<Embedder>> {
    let backend = OllamaBackend::new(&config.embedding)?;
    Ok(Arc::new(Embedder::new(
        Arc::new(backend),
        &config.embedding,
        config.store.dimension,
    )))
}

/// Crawl from `url`, or the configured base url, into the configured index.
///
/// The first Ctrl-C stops taking new pages and lets the crawl wind down; the
/// second aborts a flush that is waiting to retry.
#[inline]
pub async fn crawl_site(config: &Config, url: Option<&str>) -> Result<CrawlSummary> {
    let seed = url.unwrap_or(&config.crawler.base_url);
    let store = open_store(config).await?;
    let embedder = open_embedder(config)?;

    if !embedder.is_available().await {
        warn!(
            "Embedding backend at {} is unreachable; pages will be stored without vectors",
            config.embedding.embedding_host
        );
    }

    let engine = CrawlEngine::new(
        config,
        store,
        Arc::new(HttpFetcher::new(&config.crawler)),
        embedder,
    );

    let shutdown = engine.shutdown_handle();
    let interrupt = engine.interrupt_handle();
    let signals = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received, finishing pages in flight (Ctrl-C again to abort retries)");
        shutdown.shutdown();

        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Second interrupt received, aborting pending retries");
        interrupt.interrupt();
    });

    println!("Crawling {} into index {}", seed, config.store.index_db);
    let result = engine.crawl(seed).await;
    signals.abort();

    match result {
        Ok(summary) => {
            println!("{}", style("Crawl completed successfully!").green());
            println!("  Pages visited: {}", summary.visited_count);
            println!("  Documents indexed: {}", summary.indexed_count);
            println!("  Already indexed: {}", summary.already_indexed);
            println!("  Failed fetches: {}", summary.failed_fetches);
            println!("  Duration: {:?}", summary.duration);
            Ok(summary)
        }
        Err(e) => {
            error!("Crawl failed: {}", e);
            println!("{} {}", style("Crawl failed:").red(), e);
            Err(e.into())
        }
    }
}

/// Print the best matches for `query`
#[inline]
pub async fn search(config: &Config, query: &str, json: bool) -> Result<Vec<SearchResult>> {
    let store = open_store(config).await?;
    let embedder = open_embedder(config)?;
    let engine = SearchEngine::new(store, embedder, &config.search);

    let results = engine.search(query, &config.store.index_db).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&results).context("Failed to serialize results")?
        );
    } else if results.is_empty() {
        println!("No results above {:.2} for {:?}", config.search.min_score, query);
    } else {
        println!("Results for {:?} ({} total):", query, results.len());
        for (rank, result) in results.iter().enumerate() {
            println!(
                "{:>3}. {}  {}",
                rank + 1,
                style(format!("{:.4}", result.score)).cyan(),
                result.id
            );
        }
    }

    Ok(results)
}

/// Every document id in `index`, read with a full scan
#[inline]
pub async fn document_ids(
    store: Arc<dyn DocumentStore>,
    index: &str,
    settings: &SearchSettings,
) -> Result<Vec<String>> {
    let mut scan = Scan::open(store, index, settings.scan_batch_size, settings.scroll_ttl())
        .await
        .with_context(|| format!("Failed to scan index {}", index))?;

    let mut ids = Vec::new();
    while let Some(batch) = scan.next_batch().await? {
        ids.extend(batch.into_iter().map(|document| document.url));
    }
    Ok(ids)
}

#[inline]
pub async fn list_documents(config: &Config) -> Result<Vec<String>> {
    let store = open_store(config).await?;
    let ids = document_ids(store, &config.store.index_db, &config.search).await?;

    if ids.is_empty() {
        println!("No documents in index {}.", config.store.index_db);
        println!("Use 'semsearch crawl <url>' to index a site.");
        return Ok(ids);
    }

    for id in &ids {
        println!("{}", id);
    }
    println!();
    println!("Total: {} documents in {}", ids.len(), config.store.index_db);
    Ok(ids)
}

#[inline]
pub async fn delete_document(config: &Config, id: &str) -> Result<bool> {
    let store = open_store(config).await?;
    let deleted = store
        .delete(&config.store.index_db, id)
        .await
        .with_context(|| format!("Failed to delete {}", id))?;

    if deleted {
        println!("{} {}", style("Deleted").green(), id);
    } else {
        println!("{} {}", style("Not found:").yellow(), id);
    }
    Ok(deleted)
}

/// Delete every document whose id contains `pattern`, returning the removed ids
#[inline]
pub async fn delete_matching(
    store: Arc<dyn DocumentStore>,
    index: &str,
    pattern: &str,
    settings: &SearchSettings,
) -> Result<Vec<String>> {
    let matching: Vec<String> = document_ids(Arc::clone(&store), index, settings)
        .await?
        .into_iter()
        .filter(|id| id.contains(pattern))
        .collect();

    let mut removed = Vec::with_capacity(matching.len());
    for id in matching {
        match store.delete(index, &id).await {
            Ok(true) => removed.push(id),
            Ok(false) => warn!("Document {} disappeared before it could be deleted", id),
            Err(e) => error!("Failed to delete {}: {}", id, e),
        }
    }
    info!(
        "Deleted {} documents matching {:?} from {}",
        removed.len(),
        pattern,
        index
    );
    Ok(removed)
}

#[inline]
pub async fn delete_documents_matching(config: &Config, pattern: &str) -> Result<Vec<String>> {
    let store = open_store(config).await?;
    let removed = delete_matching(store, &config.store.index_db, pattern, &config.search).await?;

    for id in &removed {
        println!("{} {}", style("Deleted").green(), id);
    }
    println!("{} documents deleted", removed.len());
    Ok(removed)
}

/// Liveness of the embedding backend and the store, plus the document count
#[inline]
pub async fn show_status(config: &Config) -> Result<()> {
    println!("{}", style("semsearch status").bold());
    println!("{}", "=".repeat(40));

    println!("Embedding backend:");
    match open_embedder(config) {
        Ok(embedder) => {
            if embedder.is_available().await {
                println!("   {} {}", style("reachable").green(), config.embedding.embedding_host);
            } else {
                println!("   {} {}", style("unreachable").red(), config.embedding.embedding_host);
            }
            println!("   Model: {}", embedder.model());
            println!("   Dimension: {}", embedder.dimension());
        }
        Err(e) => println!("   {} {:#}", style("misconfigured").red(), e),
    }

    println!("Document store:");
    let store = match open_store(config).await {
        Ok(store) => store,
        Err(e) => {
            println!("   {} {:#}", style("unavailable").red(), e);
            return Ok(());
        }
    };
    if !store.ping().await {
        println!("   {} {}", style("unreachable").red(), store.name());
        return Ok(());
    }
    println!("   {} {}", style("reachable").green(), store.name());

    let index = &config.store.index_db;
    match store.index_exists(index).await {
        Ok(true) => match store.count(index).await {
            Ok(count) => println!("   Index {}: {} documents", index, count),
            Err(e) => println!("   Index {}: count failed ({})", index, e),
        },
        Ok(false) => println!("   Index {}: not created yet", index),
        Err(e) => println!("   Index {}: {}", index, e),
    }

    Ok(())
}

#[inline]
pub fn show_config(config: &Config) {
    println!("{}", style("Current Configuration").bold().cyan());
    println!();

    println!("{}", style("Crawler:").bold().yellow());
    println!("  Base URL: {}", style(&config.crawler.base_url).cyan());
    println!("  Max depth: {}", style(config.crawler.max_depth).cyan());
    println!(
        "  Blocked domains: {}",
        style(config.crawler.blocked_domains.join(", ")).cyan()
    );
    println!("  Concurrency: {}", style(config.crawler.concurrency).cyan());

    println!("{}", style("Store:").bold().yellow());
    println!("  Backend: {}", style(config.store.backend).cyan());
    println!("  Index: {}", style(&config.store.index_db).cyan());
    match config.store.backend {
        StoreBackend::Elasticsearch => {
            println!("  URL: {}", style(&config.store.elasticsearch_url).cyan());
        }
        StoreBackend::Lance => println!(
            "  Path: {}",
            style(config.vector_database_path().display()).cyan()
        ),
        StoreBackend::Memory => {}
    }
    println!("  Dimension: {}", style(config.store.dimension).cyan());

    println!("{}", style("Embedding:").bold().yellow());
    println!("  Host: {}", style(&config.embedding.embedding_host).cyan());
    println!("  Model: {}", style(&config.embedding.model).cyan());

    println!("{}", style("Search:").bold().yellow());
    println!("  Min score: {}", style(config.search.min_score).cyan());
    println!("  Top k: {}", style(config.search.top_k).cyan());

    println!();
    println!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );
}
