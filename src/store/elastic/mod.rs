
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
    BulkItemError, BulkResponse, Document, DocumentStore, ScanCursor, ScoredHit, StoreError,
    StoreResult,
};

const SCORE_SCRIPT: &str = "cosineSimilarity(params.query_vector, 'embedding') + 1.0";

/// Elasticsearch REST adapter
#[derive(Debug, Clone)]
pub struct ElasticStore {
    base_url: Url,
    agent: ureq::Agent,
}

#[derive(Debug, Clone, Copy)]
enum Method {
    Head,
    Get,
    Put,
    Post,
    Delete,
}

#[derive(Debug)]
struct Reply {
    status: u16,
    body: String,
}

impl Reply {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Map a non-success reply onto the store error taxonomy
    fn into_error(self) -> StoreError {
        let reason = serde_json::from_str::<Value>(&self.body)
            .ok()
            .and_then(|value| match &value["error"] {
                Value::String(reason) => Some(reason.clone()),
                Value::Object(_) => value["error"]["reason"].as_str().map(str::to_string),
                _ => None,
            })
            .unwrap_or(self.body);

        if self.status >= 500 || self.status == 429 {
            StoreError::Transport(format!("HTTP {}: {}", self.status, reason))
        } else {
            StoreError::Rejected {
                status: self.status,
                reason,
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score", default)]
    score: Option<f64>,
    #[serde(rename = "_source", default)]
    source: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct BulkApiResponse {
    errors: bool,
    items: Vec<HashMap<String, BulkApiItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkApiItem {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default)]
    error: Option<BulkApiItemError>,
}

#[derive(Debug, Deserialize)]
struct BulkApiItemError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

fn scroll_keep_alive(ttl: Duration) -> String {
    format!("{}s", ttl.as_secs().max(1))
}

fn parse_json<T: for<'de> Deserialize<'de>>(body: &str, what: &str) -> StoreResult<T> {
    serde_json::from_str(body)
        .map_err(|e| StoreError::Backend(format!("Failed to parse {} response: {}", what, e)))
}

/// Readable documents of one scroll page, with the raw hit count that decides
/// whether the scroll is exhausted
fn page_documents(hits: Vec<Hit>) -> (usize, Vec<Document>) {
    let raw = hits.len();
    let documents: Vec<Document> = hits.into_iter().filter_map(hit_document).collect();
    if raw > documents.len() {
        warn!(
            "Skipped {} unreadable documents in scroll page",
            raw - documents.len()
        );
    }
    (raw, documents)
}

/// Turn a hit into a document, falling back to `_id` when the source lacks a url
fn hit_document(hit: Hit) -> Option<Document> {
    let mut source = hit.source?;
    if let Value::Object(fields) = &mut source {
        fields
            .entry("url")
            .or_insert_with(|| Value::String(hit.id.clone()));
    }
    match serde_json::from_value(source) {
        Ok(document) => Some(document),
        Err(e) => {
            warn!("Skipping unreadable document {}: {}", hit.id, e);
            None
        }
    }
}

fn send(
    agent: &ureq::Agent,
    method: Method,
    url: &str,
    body: Option<(String, &str)>,
) -> StoreResult<Reply> {
    debug!("{:?} {}", method, url);

    let result = match (method, body) {
        (Method::Head, _) => agent.head(url).call(),
        (Method::Get, _) => agent.get(url).call(),
        (Method::Delete, None) => agent.delete(url).call(),
        (Method::Delete, Some((body, content_type))) => agent
            .delete(url)
            .force_send_body()
            .header("Content-Type", content_type)
            .send(&body),
        (Method::Put, body) => {
            let (body, content_type) = body.unwrap_or((String::new(), "application/json"));
            agent
                .put(url)
                .header("Content-Type", content_type)
                .send(&body)
        }
        (Method::Post, body) => {
            let (body, content_type) = body.unwrap_or((String::new(), "application/json"));
            agent
                .post(url)
                .header("Content-Type", content_type)
                .send(&body)
        }
    };

    match result {
        Ok(mut response) => {
            let status = response.status().as_u16();
            let body = if matches!(method, Method::Head) {
                String::new()
            } else {
                response
                    .body_mut()
                    .read_to_string()
                    .map_err(|e| StoreError::Transport(format!("Failed to read body: {}", e)))?
            };
            Ok(Reply { status, body })
        }
        Err(e) => Err(StoreError::Transport(format!(
            "Request to {} failed: {}",
            url, e
        ))),
    }
}

impl ElasticStore {
    #[inline]
    pub fn new(base_url: Url, timeout: Duration) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();

        Self { base_url, agent }
    }

    fn endpoint(&self, segments: &[&str]) -> StoreResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                StoreError::Backend(format!("Unusable Elasticsearch URL: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn request(&self, method: Method, url: Url, body: Option<Value>) -> StoreResult<Reply> {
        let body = body.map(|value| (value.to_string(), "application/json"));
        self.request_raw(method, url, body).await
    }

    async fn request_raw(
        &self,
        method: Method,
        url: Url,
        body: Option<(String, &'static str)>,
    ) -> StoreResult<Reply> {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || send(&agent, method, url.as_str(), body))
            .await
            .map_err(|e| StoreError::Backend(format!("Request task failed: {}", e)))?
    }

    async fn scroll_page(&self, cursor: &mut ScanCursor) -> StoreResult<(usize, Vec<Document>)> {
        let body = json!({
            "scroll": scroll_keep_alive(cursor.ttl),
            "scroll_id": cursor.id
        });
        let reply = self
            .request(Method::Post, self.endpoint(&["_search", "scroll"])?, Some(body))
            .await?;
        if reply.status == 404 {
            return Err(StoreError::CursorExpired(cursor.id.clone()));
        }
        if !reply.is_success() {
            return Err(reply.into_error());
        }

        let parsed: SearchResponse = parse_json(&reply.body, "scroll")?;
        if let Some(scroll_id) = parsed.scroll_id {
            cursor.id = scroll_id;
        }
        Ok(page_documents(parsed.hits.hits))
    }

    fn bulk_body(index: &str, documents: &[Document]) -> StoreResult<String> {
        let mut body = String::new();
        for document in documents {
            let action = json!({"index": {"_index": index, "_id": document.id()}});
            let source = serde_json::to_string(document).map_err(|e| {
                StoreError::InvalidDocument {
                    id: document.url.clone(),
                    reason: e.to_string(),
                }
            })?;
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&source);
            body.push('\n');
        }
        Ok(body)
    }
}

#[async_trait]
impl DocumentStore for ElasticStore {
    fn name(&self) -> &'static str {
        "elasticsearch"
    }

    async fn ping(&self) -> bool {
        match self.request(Method::Get, self.base_url.clone(), None).await {
            Ok(reply) => reply.is_success(),
            Err(e) => {
                warn!("Elasticsearch at {} is unreachable: {}", self.base_url, e);
                false
            }
        }
    }

    async fn index_exists(&self, index: &str) -> StoreResult<bool> {
        let reply = self
            .request(Method::Head, self.endpoint(&[index])?, None)
            .await?;
        match reply.status {
            200 => Ok(true),
            404 => Ok(false),
            _ => Err(reply.into_error()),
        }
    }

    async fn create_index(&self, index: &str, dimension: usize) -> StoreResult<()> {
        if self.index_exists(index).await? {
            info!("Index {} already exists.", index);
            return Ok(());
        }

        let mapping = json!({
            "mappings": {
                "properties": {
                    "url": {"type": "keyword"},
                    "title": {"type": "text"},
                    "text": {"type": "text"},
                    "embedding": {"type": "dense_vector", "dims": dimension},
                    "crawled_at": {"type": "date"}
                }
            }
        });

        let reply = self
            .request(Method::Put, self.endpoint(&[index])?, Some(mapping))
            .await?;
        if reply.is_success() {
            info!("Index created: {} ({} dimensions)", index, dimension);
            return Ok(());
        }
        if reply.body.contains("resource_already_exists_exception") {
            info!("Index {} was created concurrently", index);
            return Ok(());
        }
        error!("Failed to create index {}: HTTP {}", index, reply.status);
        Err(reply.into_error())
    }

    async fn exists(&self, index: &str, id: &str) -> StoreResult<bool> {
        let reply = self
            .request(Method::Head, self.endpoint(&[index, "_doc", id])?, None)
            .await?;
        match reply.status {
            200 => Ok(true),
            404 => Ok(false),
            _ => Err(reply.into_error()),
        }
    }

    async fn put(&self, index: &str, document: &Document) -> StoreResult<()> {
        let source = serde_json::to_value(document).map_err(|e| StoreError::InvalidDocument {
            id: document.url.clone(),
            reason: e.to_string(),
        })?;

        let reply = self
            .request(
                Method::Put,
                self.endpoint(&[index, "_doc", document.id()])?,
                Some(source),
            )
            .await?;
        if !reply.is_success() {
            error!(
                "Error indexing document for URL {}: HTTP {}",
                document.url, reply.status
            );
            return Err(reply.into_error());
        }

        debug!("Indexed document with ID: {}", document.url);
        Ok(())
    }

    async fn bulk_put(&self, index: &str, documents: &[Document]) -> StoreResult<BulkResponse> {
        if documents.is_empty() {
            return Ok(BulkResponse::default());
        }

        let body = Self::bulk_body(index, documents)?;
        let reply = self
            .request_raw(
                Method::Post,
                self.endpoint(&["_bulk"])?,
                Some((body, "application/x-ndjson")),
            )
            .await?;
        if !reply.is_success() {
            return Err(reply.into_error());
        }

        let parsed: BulkApiResponse = parse_json(&reply.body, "bulk")?;
        let failures = if parsed.errors {
            parsed
                .items
                .into_iter()
                .flat_map(HashMap::into_values)
                .filter_map(|item| {
                    item.error.map(|error| BulkItemError {
                        id: item.id,
                        reason: format!("{}: {}", error.kind, error.reason),
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(BulkResponse {
            items: documents.len(),
            failures,
        })
    }

    async fn delete(&self, index: &str, id: &str) -> StoreResult<bool> {
        let reply = self
            .request(Method::Delete, self.endpoint(&[index, "_doc", id])?, None)
            .await?;
        match reply.status {
            200 => Ok(true),
            404 => Ok(false),
            status => {
                error!("Error deleting document with ID {}: HTTP {}", id, status);
                Err(reply.into_error())
            }
        }
    }

    async fn count(&self, index: &str) -> StoreResult<u64> {
        let reply = self
            .request(Method::Get, self.endpoint(&[index, "_count"])?, None)
            .await?;
        match reply.status {
            404 => Err(StoreError::IndexNotFound(index.to_string())),
            _ if reply.is_success() => {
                Ok(parse_json::<CountResponse>(&reply.body, "count")?.count)
            }
            _ => Err(reply.into_error()),
        }
    }

    async fn scored_search(
        &self,
        index: &str,
        query_vector: &[f64],
        limit: usize,
    ) -> StoreResult<Vec<ScoredHit>> {
        let query = json!({
            "size": limit,
            "_source": false,
            "query": {
                "script_score": {
                    "query": {"exists": {"field": "embedding"}},
                    "script": {
                        "source": SCORE_SCRIPT,
                        "params": {"query_vector": query_vector}
                    }
                }
            }
        });

        let reply = self
            .request(Method::Post, self.endpoint(&[index, "_search"])?, Some(query))
            .await?;
        if !reply.is_success() {
            return Err(reply.into_error());
        }

        let parsed: SearchResponse = parse_json(&reply.body, "search")?;
        Ok(parsed
            .hits
            .hits
            .into_iter()
            .map(|hit| ScoredHit {
                score: hit.score.unwrap_or_default(),
                id: hit.id,
            })
            .collect())
    }

    async fn scan_open(
        &self,
        index: &str,
        batch_size: usize,
        ttl: Duration,
    ) -> StoreResult<ScanCursor> {
        let mut url = self.endpoint(&[index, "_search"])?;
        url.query_pairs_mut()
            .append_pair("scroll", &scroll_keep_alive(ttl));

        let query = json!({
            "size": batch_size,
            "sort": ["_doc"],
            "query": {"match_all": {}}
        });

        let reply = self.request(Method::Post, url, Some(query)).await?;
        if reply.status == 404 {
            return Err(StoreError::IndexNotFound(index.to_string()));
        }
        if !reply.is_success() {
            return Err(reply.into_error());
        }

        let parsed: SearchResponse = parse_json(&reply.body, "scroll")?;
        let scroll_id = parsed
            .scroll_id
            .ok_or_else(|| StoreError::Backend("Search response has no scroll id".to_string()))?;

        let mut cursor = ScanCursor::new(scroll_id, index, ttl);
        let (raw, documents) = page_documents(parsed.hits.hits);
        // A first page of only unreadable hits is left for scan_next to scroll past
        if raw == 0 || !documents.is_empty() {
            cursor.buffered = Some(documents);
        }
        Ok(cursor)
    }

    async fn scan_next(&self, cursor: &mut ScanCursor) -> StoreResult<Vec<Document>> {
        if let Some(first_page) = cursor.buffered.take() {
            return Ok(first_page);
        }

        // Only a page without any hits ends the scroll
        loop {
            let (raw, documents) = self.scroll_page(cursor).await?;
            if raw == 0 || !documents.is_empty() {
                return Ok(documents);
            }
        }
    }

    async fn scan_close(&self, cursor: ScanCursor) -> StoreResult<()> {
        let body = json!({"scroll_id": [cursor.id]});
        let reply = self
            .request(Method::Delete, self.endpoint(&["_search", "scroll"])?, Some(body))
            .await?;
        // 404 means the scroll already expired
        if reply.is_success() || reply.status == 404 {
            debug!("Cleared scroll for index {}", cursor.index);
            Ok(())
        } else {
            Err(reply.into_error())
        }
    }
}
