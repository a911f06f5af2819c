
use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arrow::array::{Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray};
use arrow::buffer::NullBuffer;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use itertools::Itertools;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType, Table};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    BulkItemError, BulkResponse, Document, DocumentStore, ScanCursor, ScoredHit, StoreError,
    StoreResult,
};

const VECTOR_COLUMN: &str = "vector";

/// Embedded LanceDB store with one table per index
pub struct LanceStore {
    connection: Connection,
    scans: Mutex<HashMap<String, LanceScan>>,
}

#[derive(Debug)]
struct LanceScan {
    offset: usize,
    batch_size: usize,
    expires_at: Instant,
}

fn backend_error(context: &str, e: impl Display) -> StoreError {
    StoreError::Backend(format!("{}: {}", context, e))
}

/// SQL string literal with single quotes doubled
fn quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> StoreResult<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| StoreError::Backend(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| StoreError::Backend(format!("Invalid {} column type", name)))
}

impl LanceStore {
    /// Open (or create) the database directory at `path`
    #[inline]
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        debug!("Initializing LanceDB at path: {}", path.display());

        std::fs::create_dir_all(path)
            .map_err(|e| backend_error("Failed to create vector database directory", e))?;

        let uri = format!("file://{}", path.display());
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| StoreError::Transport(format!("Failed to connect to LanceDB: {}", e)))?;

        Ok(Self {
            connection,
            scans: Mutex::new(HashMap::new()),
        })
    }

    fn schema(dimension: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new(
                VECTOR_COLUMN,
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, false)),
                    dimension as i32,
                ),
                true,
            ),
            Field::new("crawled_at", DataType::Utf8, true),
        ]))
    }

    async fn table(&self, index: &str) -> StoreResult<Table> {
        match self.connection.open_table(index).execute().await {
            Ok(table) => Ok(table),
            Err(lancedb::Error::TableNotFound { .. }) => {
                Err(StoreError::IndexNotFound(index.to_string()))
            }
            Err(e) => Err(backend_error("Failed to open table", e)),
        }
    }

    /// Vector width recorded in the table schema
    async fn dimension(table: &Table) -> StoreResult<usize> {
        let schema = table
            .schema()
            .await
            .map_err(|e| backend_error("Failed to get table schema", e))?;

        schema
            .fields()
            .iter()
            .find(|field| field.name() == VECTOR_COLUMN)
            .and_then(|field| match field.data_type() {
                DataType::FixedSizeList(_, size) => Some(*size as usize),
                _ => None,
            })
            .ok_or_else(|| {
                StoreError::Backend("Could not find vector column or determine dimension".into())
            })
    }

    fn record_batch(documents: &[&Document], dimension: usize) -> StoreResult<RecordBatch> {
        let len = documents.len();
        let mut flat_values = Vec::with_capacity(len * dimension);
        let mut validity = Vec::with_capacity(len);

        for document in documents {
            if document.has_embedding() {
                flat_values.extend(document.embedding.iter().map(|v| *v as f32));
                validity.push(true);
            } else {
                // Null slots still occupy `dimension` values
                flat_values.extend(std::iter::repeat_n(0.0_f32, dimension));
                validity.push(false);
            }
        }

        let field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array = FixedSizeListArray::try_new(
            field,
            dimension as i32,
            Arc::new(Float32Array::from(flat_values)),
            Some(NullBuffer::from(validity)),
        )
        .map_err(|e| backend_error("Failed to create vector array", e))?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from_iter_values(
                documents.iter().map(|d| d.url.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(
                documents.iter().map(|d| d.title.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(
                documents.iter().map(|d| d.text.as_str()),
            )),
            Arc::new(vector_array),
            Arc::new(StringArray::from(
                documents
                    .iter()
                    .map(|d| d.crawled_at.map(|t| t.to_rfc3339()))
                    .collect::<Vec<_>>(),
            )),
        ];

        RecordBatch::try_new(Self::schema(dimension), arrays)
            .map_err(|e| backend_error("Failed to create record batch", e))
    }

    /// Replace rows with the same ids, then append
    async fn upsert(table: &Table, documents: &[&Document], dimension: usize) -> StoreResult<()> {
        if documents.is_empty() {
            return Ok(());
        }

        let predicate = format!(
            "id IN ({})",
            documents.iter().map(|d| quoted(&d.url)).join(", ")
        );
        table
            .delete(&predicate)
            .await
            .map_err(|e| backend_error("Failed to replace existing rows", e))?;

        let batch = Self::record_batch(documents, dimension)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(batch)), schema);
        table
            .add(reader)
            .execute()
            .await
            .map_err(|e| backend_error("Failed to insert documents", e))?;
        Ok(())
    }

    fn validate(document: &Document, dimension: usize) -> StoreResult<()> {
        if document.has_embedding() && document.embedding.len() != dimension {
            return Err(StoreError::InvalidDocument {
                id: document.url.clone(),
                reason: format!(
                    "embedding has {} dimensions, index expects {}",
                    document.embedding.len(),
                    dimension
                ),
            });
        }
        Ok(())
    }

    fn parse_documents(batch: &RecordBatch) -> StoreResult<Vec<Document>> {
        let ids = string_column(batch, "id")?;
        let titles = string_column(batch, "title")?;
        let texts = string_column(batch, "text")?;
        let crawled_ats = string_column(batch, "crawled_at")?;
        let vectors = batch
            .column_by_name(VECTOR_COLUMN)
            .ok_or_else(|| StoreError::Backend("Missing vector column".to_string()))?
            .as_any()
            .downcast_ref::<FixedSizeListArray>()
            .ok_or_else(|| StoreError::Backend("Invalid vector column type".to_string()))?;

        let mut documents = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            let embedding = if vectors.is_null(row) {
                Vec::new()
            } else {
                let values = vectors.value(row);
                values
                    .as_any()
                    .downcast_ref::<Float32Array>()
                    .map(|v| v.values().iter().map(|x| f64::from(*x)).collect())
                    .unwrap_or_default()
            };

            let crawled_at = if crawled_ats.is_null(row) {
                None
            } else {
                DateTime::parse_from_rfc3339(crawled_ats.value(row))
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
            };

            documents.push(Document {
                url: ids.value(row).to_string(),
                title: titles.value(row).to_string(),
                text: texts.value(row).to_string(),
                embedding,
                crawled_at,
            });
        }
        Ok(documents)
    }
}

#[async_trait]
impl DocumentStore for LanceStore {
    fn name(&self) -> &'static str {
        "lance"
    }

    async fn ping(&self) -> bool {
        match self.connection.table_names().execute().await {
            Ok(_) => true,
            Err(e) => {
                warn!("LanceDB is not usable: {}", e);
                false
            }
        }
    }

    async fn index_exists(&self, index: &str) -> StoreResult<bool> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| backend_error("Failed to list tables", e))?;
        Ok(table_names.iter().any(|name| name == index))
    }

    async fn create_index(&self, index: &str, dimension: usize) -> StoreResult<()> {
        if self.index_exists(index).await? {
            info!("Index {} already exists.", index);
            return Ok(());
        }

        self.connection
            .create_empty_table(index, Self::schema(dimension))
            .execute()
            .await
            .map_err(|e| backend_error("Failed to create table", e))?;
        info!("Index created: {} ({} dimensions)", index, dimension);
        Ok(())
    }

    async fn exists(&self, index: &str, id: &str) -> StoreResult<bool> {
        let table = self.table(index).await?;
        let count = table
            .count_rows(Some(format!("id = {}", quoted(id))))
            .await
            .map_err(|e| backend_error("Failed to look up document", e))?;
        Ok(count > 0)
    }

    async fn put(&self, index: &str, document: &Document) -> StoreResult<()> {
        let table = self.table(index).await?;
        let dimension = Self::dimension(&table).await?;
        Self::validate(document, dimension)?;
        Self::upsert(&table, &[document], dimension).await?;
        debug!("Indexed document with ID: {}", document.url);
        Ok(())
    }

    async fn bulk_put(&self, index: &str, documents: &[Document]) -> StoreResult<BulkResponse> {
        let table = self.table(index).await?;
        let dimension = Self::dimension(&table).await?;

        let mut failures = Vec::new();
        let mut accepted = Vec::with_capacity(documents.len());
        for document in documents {
            match Self::validate(document, dimension) {
                Ok(()) => accepted.push(document),
                Err(e) => failures.push(BulkItemError {
                    id: document.url.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        Self::upsert(&table, &accepted, dimension).await?;
        debug!(
            "Bulk wrote {} of {} documents to {}",
            accepted.len(),
            documents.len(),
            index
        );
        Ok(BulkResponse {
            items: documents.len(),
            failures,
        })
    }

    async fn delete(&self, index: &str, id: &str) -> StoreResult<bool> {
        if !self.exists(index, id).await? {
            return Ok(false);
        }
        let table = self.table(index).await?;
        table
            .delete(&format!("id = {}", quoted(id)))
            .await
            .map_err(|e| backend_error("Failed to delete document", e))?;
        Ok(true)
    }

    async fn count(&self, index: &str) -> StoreResult<u64> {
        let table = self.table(index).await?;
        let count = table
            .count_rows(None)
            .await
            .map_err(|e| backend_error("Failed to count rows", e))?;
        Ok(count as u64)
    }

    async fn scored_search(
        &self,
        index: &str,
        query_vector: &[f64],
        limit: usize,
    ) -> StoreResult<Vec<ScoredHit>> {
        let table = self.table(index).await?;
        let query: Vec<f32> = query_vector.iter().map(|v| *v as f32).collect();

        let mut results = table
            .vector_search(query.as_slice())
            .map_err(|e| backend_error("Failed to create vector search", e))?
            .column(VECTOR_COLUMN)
            .distance_type(DistanceType::Cosine)
            .only_if(format!("{} IS NOT NULL", VECTOR_COLUMN))
            .limit(limit)
            .execute()
            .await
            .map_err(|e| backend_error("Failed to execute search", e))?;

        let mut hits = Vec::new();
        while let Some(batch) = results
            .try_next()
            .await
            .map_err(|e| backend_error("Failed to read result stream", e))?
        {
            let ids = string_column(&batch, "id")?;
            let distances = batch
                .column_by_name("_distance")
                .and_then(|col| col.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| StoreError::Backend("Missing _distance column".to_string()))?;

            for row in 0..batch.num_rows() {
                // Cosine distance is 1 - similarity; scores carry the +1.0 offset
                hits.push(ScoredHit {
                    id: ids.value(row).to_string(),
                    score: 2.0 - f64::from(distances.value(row)),
                });
            }
        }
        Ok(hits)
    }

    async fn scan_open(
        &self,
        index: &str,
        batch_size: usize,
        ttl: Duration,
    ) -> StoreResult<ScanCursor> {
        // Surface a missing index at open time rather than on the first batch
        self.table(index).await?;

        let cursor = ScanCursor::new(Uuid::new_v4().to_string(), index, ttl);
        self.scans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                cursor.id.clone(),
                LanceScan {
                    offset: 0,
                    batch_size: batch_size.max(1),
                    expires_at: Instant::now() + ttl,
                },
            );
        Ok(cursor)
    }

    async fn scan_next(&self, cursor: &mut ScanCursor) -> StoreResult<Vec<Document>> {
        let (offset, batch_size) = {
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
            (scan.offset, scan.batch_size)
        };

        let table = self.table(&cursor.index).await?;
        let mut stream = table
            .query()
            .offset(offset)
            .limit(batch_size)
            .execute()
            .await
            .map_err(|e| backend_error("Failed to execute scan", e))?;

        let mut documents = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| backend_error("Failed to read scan stream", e))?
        {
            documents.extend(Self::parse_documents(&batch)?);
        }

        let mut scans = self.scans.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(scan) = scans.get_mut(&cursor.id) {
            scan.offset += documents.len();
        }
        drop(scans);
        Ok(documents)
    }

    async fn scan_close(&self, cursor: ScanCursor) -> StoreResult<()> {
        self.scans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&cursor.id);
        Ok(())
    }
}
