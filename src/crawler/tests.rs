use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use anyhow::anyhow;
use async_trait::async_trait;
use url::Url;

use super::*;
use crate::embeddings::EmbeddingBackend;
use crate::store::testing::RecordingStore;
use crate::store::Scan;

const ROOT: &str = "https://example.com/";

/// In-memory site: url to outbound links. Urls not in the map fail to fetch.
#[derive(Default)]
struct SiteFetcher {
    pages: HashMap<String, Vec<String>>,
    fetched: Mutex<Vec<String>>,
    /// Fetching this url requests a shutdown
    shutdown_on: Mutex<Option<(String, ShutdownHandle)>>,
}

impl SiteFetcher {
    fn new(site: &[(&str, &[&str])]) -> Self {
        let pages = site
            .iter()
            .map(|(url, links)| {
                (
                    (*url).to_string(),
                    links.iter().map(|link| (*link).to_string()).collect(),
                )
            })
            .collect();
        Self {
            pages,
            ..Self::default()
        }
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Fetcher for SiteFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<Page> {
        self.fetched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.to_string());

        let shutdown_on = self
            .shutdown_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some((trigger, handle)) = shutdown_on {
            if trigger == url {
                handle.shutdown();
            }
        }

        let links = self
            .pages
            .get(url)
            .ok_or_else(|| anyhow!("HTTP error 404"))?;
        Ok(Page {
            title: format!("Title of {}", url),
            text: format!("Content of {}", url),
            links: links
                .iter()
                .map(|link| Url::parse(link).expect("test link should parse"))
                .collect(),
        })
    }
}

struct StaticBackend {
    vector: Option<Vec<f64>>,
}

#[async_trait]
impl EmbeddingBackend for StaticBackend {
    async fn ping(&self) -> bool {
        self.vector.is_some()
    }

    async fn embed(&self, _model: &str, _text: &str) -> anyhow::Result<Vec<f64>> {
        self.vector
            .clone()
            .ok_or_else(|| anyhow!("backend is down"))
    }
}

fn config(max_depth: u32) -> Config {
    let mut config = Config::default();
    config.crawler.max_depth = max_depth;
    config.crawler.politeness_delay_ms = 0;
    config.store.index_db = "pages".to_string();
    config.store.dimension = 2;
    config
}

fn engine_with(
    config: &Config,
    store: &Arc<RecordingStore>,
    fetcher: &Arc<SiteFetcher>,
    vector: Option<Vec<f64>>,
) -> CrawlEngine {
    let embedder = Embedder::new(
        Arc::new(StaticBackend { vector }),
        &config.embedding,
        config.store.dimension,
    );
    CrawlEngine::new(
        config,
        Arc::clone(store) as Arc<dyn DocumentStore>,
        Arc::clone(fetcher) as Arc<dyn Fetcher>,
        Arc::new(embedder),
    )
}

fn engine(
    config: &Config,
    store: &Arc<RecordingStore>,
    fetcher: &Arc<SiteFetcher>,
) -> CrawlEngine {
    engine_with(config, store, fetcher, Some(vec![1.0, 0.0]))
}

async fn stored_documents(store: &Arc<RecordingStore>) -> Vec<Document> {
    Scan::open(
        Arc::clone(store) as Arc<dyn DocumentStore>,
        "pages",
        10,
        Duration::from_secs(60),
    )
    .await
    .expect("should open scan")
    .collect(100)
    .await
    .expect("should read documents")
}

#[tokio::test]
async fn depth_zero_indexes_only_the_seed() {
    let store = Arc::new(RecordingStore::default());
    let fetcher = Arc::new(SiteFetcher::new(&[(
        ROOT,
        &["https://example.com/a", "https://example.com/b"],
    )]));

    let summary = engine(&config(0), &store, &fetcher)
        .crawl("https://example.com")
        .await
        .expect("crawl should succeed");

    assert_eq!(summary.visited_count, 1);
    assert_eq!(summary.indexed_count, 1);
    assert_eq!(fetcher.fetched(), vec![ROOT]);
    assert_eq!(store.count("pages").await.expect("should count"), 1);
}

#[tokio::test]
async fn partial_batch_is_flushed_once_at_drain() {
    let store = Arc::new(RecordingStore::default());
    let fetcher = Arc::new(SiteFetcher::new(&[
        (ROOT, &["https://example.com/a"]),
        ("https://example.com/a", &[]),
    ]));

    let summary = engine(&config(1), &store, &fetcher)
        .crawl(ROOT)
        .await
        .expect("crawl should succeed");

    assert_eq!(summary.indexed_count, 2);
    assert_eq!(
        store.bulk_batches(),
        vec![vec![ROOT.to_string(), "https://example.com/a".to_string()]]
    );
}

#[tokio::test]
async fn cycles_visit_each_url_once() {
    let store = Arc::new(RecordingStore::default());
    let fetcher = Arc::new(SiteFetcher::new(&[
        (ROOT, &["https://example.com/a", "https://example.com/b"]),
        ("https://example.com/a", &[ROOT, "https://example.com/b"]),
        ("https://example.com/b", &["https://example.com/a", ROOT]),
    ]));

    let summary = engine(&config(5), &store, &fetcher)
        .crawl(ROOT)
        .await
        .expect("crawl should succeed");

    assert_eq!(summary.visited_count, 3);
    assert_eq!(
        fetcher.fetched(),
        vec![ROOT, "https://example.com/a", "https://example.com/b"]
    );
    assert_eq!(store.count("pages").await.expect("should count"), 3);
}

#[tokio::test]
async fn depth_bounds_the_traversal() {
    let store = Arc::new(RecordingStore::default());
    let fetcher = Arc::new(SiteFetcher::new(&[
        (ROOT, &["https://example.com/1"]),
        ("https://example.com/1", &["https://example.com/2"]),
        ("https://example.com/2", &["https://example.com/3"]),
        ("https://example.com/3", &[]),
    ]));

    let summary = engine(&config(2), &store, &fetcher)
        .crawl(ROOT)
        .await
        .expect("crawl should succeed");

    assert_eq!(summary.visited_count, 3);
    assert_eq!(
        fetcher.fetched(),
        vec![ROOT, "https://example.com/1", "https://example.com/2"]
    );
}

#[tokio::test]
async fn blocked_and_fragment_links_are_never_fetched() {
    let store = Arc::new(RecordingStore::default());
    let fetcher = Arc::new(SiteFetcher::new(&[
        (
            ROOT,
            &[
                "https://blocked.com/x",
                "https://example.com/p?ref=BLOCKED.com",
                "https://example.com/#section",
                "https://example.com/ok",
            ],
        ),
        ("https://example.com/ok", &[]),
    ]));
    let mut config = config(2);
    config.crawler.blocked_domains = vec!["Blocked.com".to_string()];

    engine(&config, &store, &fetcher)
        .crawl(ROOT)
        .await
        .expect("crawl should succeed");

    assert_eq!(fetcher.fetched(), vec![ROOT, "https://example.com/ok"]);
}

#[tokio::test]
async fn already_indexed_page_still_follows_links() {
    let store = Arc::new(RecordingStore::default().with_index(2).await);
    store
        .put(
            "pages",
            &Document::new(ROOT, "Old title", "Old text").with_embedding(vec![0.0, 1.0]),
        )
        .await
        .expect("should store document");
    let fetcher = Arc::new(SiteFetcher::new(&[
        (ROOT, &["https://example.com/a"]),
        ("https://example.com/a", &[]),
    ]));

    let summary = engine(&config(1), &store, &fetcher)
        .crawl(ROOT)
        .await
        .expect("crawl should succeed");

    assert_eq!(summary.already_indexed, 1);
    assert_eq!(summary.indexed_count, 1);
    assert_eq!(fetcher.fetched(), vec![ROOT, "https://example.com/a"]);
    assert_eq!(
        store.bulk_batches(),
        vec![vec!["https://example.com/a".to_string()]]
    );

    // The existing document is not overwritten
    let documents = stored_documents(&store).await;
    let root = documents
        .iter()
        .find(|d| d.url == ROOT)
        .expect("root should be stored");
    assert_eq!(root.title, "Old title");
}

#[tokio::test]
async fn fetch_failure_only_abandons_that_page() {
    let store = Arc::new(RecordingStore::default());
    let fetcher = Arc::new(SiteFetcher::new(&[
        (
            ROOT,
            &["https://example.com/broken", "https://example.com/a"],
        ),
        ("https://example.com/a", &[]),
    ]));

    let summary = engine(&config(1), &store, &fetcher)
        .crawl(ROOT)
        .await
        .expect("crawl should succeed");

    assert_eq!(summary.visited_count, 3);
    assert_eq!(summary.failed_fetches, 1);
    assert_eq!(summary.indexed_count, 2);
    assert!(
        !store
            .exists("pages", "https://example.com/broken")
            .await
            .expect("should check")
    );
}

#[tokio::test]
async fn existence_check_failure_indexes_the_page() {
    let store = Arc::new(RecordingStore {
        fail_exists: true,
        ..RecordingStore::default()
    });
    let fetcher = Arc::new(SiteFetcher::new(&[(ROOT, &[])]));

    let summary = engine(&config(0), &store, &fetcher)
        .crawl(ROOT)
        .await
        .expect("crawl should succeed");

    assert_eq!(summary.indexed_count, 1);
    assert_eq!(summary.already_indexed, 0);
}

#[tokio::test]
async fn page_without_embedding_is_indexed_without_vector() {
    let store = Arc::new(RecordingStore::default());
    let fetcher = Arc::new(SiteFetcher::new(&[(ROOT, &[])]));

    let summary = engine_with(&config(0), &store, &fetcher, None)
        .crawl(ROOT)
        .await
        .expect("crawl should succeed");

    assert_eq!(summary.indexed_count, 1);
    let documents = stored_documents(&store).await;
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].title, format!("Title of {}", ROOT));
    assert_eq!(documents[0].text, format!("Content of {}", ROOT));
    assert!(!documents[0].has_embedding());
}

#[tokio::test]
async fn index_creation_failure_aborts_before_fetching() {
    let store = Arc::new(RecordingStore {
        fail_index_creation: true,
        ..RecordingStore::default()
    });
    let fetcher = Arc::new(SiteFetcher::new(&[(ROOT, &[])]));

    let result = engine(&config(2), &store, &fetcher).crawl(ROOT).await;

    assert!(matches!(result, Err(SemError::Store(_))));
    assert!(fetcher.fetched().is_empty());
}

#[tokio::test]
async fn invalid_seed_is_rejected() {
    let store = Arc::new(RecordingStore::default());
    let fetcher = Arc::new(SiteFetcher::default());

    let result = engine(&config(2), &store, &fetcher)
        .crawl("ftp://example.com/")
        .await;

    assert!(matches!(result, Err(SemError::Crawler(_))));
    assert!(!store.index_exists("pages").await.expect("should check"));
}

#[tokio::test]
async fn concurrent_workers_process_each_url_once() {
    let children: Vec<String> = (0..10)
        .map(|i| format!("https://example.com/page-{}", i))
        .collect();
    let child_refs: Vec<&str> = children.iter().map(String::as_str).collect();
    let mut site: Vec<(&str, &[&str])> = vec![(ROOT, child_refs.as_slice())];
    for child in &child_refs {
        site.push((*child, child_refs.as_slice()));
    }
    let store = Arc::new(RecordingStore::default());
    let fetcher = Arc::new(SiteFetcher::new(&site));
    let mut config = config(3);
    config.crawler.concurrency = 4;

    let summary = engine(&config, &store, &fetcher)
        .crawl(ROOT)
        .await
        .expect("crawl should succeed");

    assert_eq!(summary.visited_count, 11);
    assert_eq!(summary.indexed_count, 11);
    let fetched = fetcher.fetched();
    assert_eq!(fetched.len(), 11);
    assert_eq!(fetched.iter().collect::<HashSet<_>>().len(), 11);
    assert_eq!(
        store.bulk_batches().iter().map(Vec::len).sum::<usize>(),
        11
    );
}

#[tokio::test]
async fn shutdown_before_crawl_stops_all_dequeues() {
    let store = Arc::new(RecordingStore::default());
    let fetcher = Arc::new(SiteFetcher::new(&[(ROOT, &[])]));
    let engine = engine(&config(2), &store, &fetcher);

    engine.shutdown_handle().shutdown();
    let summary = engine.crawl(ROOT).await.expect("crawl should succeed");

    assert_eq!(summary.visited_count, 0);
    assert!(fetcher.fetched().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_in_flight_page_and_flushes() {
    let store = Arc::new(RecordingStore::default());
    let fetcher = Arc::new(SiteFetcher::new(&[
        (ROOT, &["https://example.com/a"]),
        ("https://example.com/a", &["https://example.com/b"]),
        ("https://example.com/b", &[]),
    ]));
    let mut config = config(5);
    config.crawler.politeness_delay_ms = 10;
    let engine = engine(&config, &store, &fetcher);
    *fetcher
        .shutdown_on
        .lock()
        .unwrap_or_else(PoisonError::into_inner) =
        Some(("https://example.com/a".to_string(), engine.shutdown_handle()));

    let summary = engine.crawl(ROOT).await.expect("crawl should succeed");

    assert_eq!(fetcher.fetched(), vec![ROOT, "https://example.com/a"]);
    // The page being processed when shutdown arrived is still indexed
    assert_eq!(summary.indexed_count, 2);
    assert!(
        store
            .exists("pages", "https://example.com/a")
            .await
            .expect("should check")
    );
}
