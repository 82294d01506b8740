// src/ingest/store.rs
//! Chunked, schema-adaptive persistence.
//!
//! [`StorageWriter`] owns the write protocol (composite encoding, create-vs-append,
//! chunking). Backends implement [`TableStore`] and hand out one [`TableSession`] per
//! unit of work, which pins a single pooled connection until it is dropped.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ingest::types::Record;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid table name '{0}'")]
    InvalidTable(String),
    #[error("table '{0}' not found")]
    TableNotFound(String),
    #[error("column '{column}' not found in table '{table}'")]
    UnknownColumn { table: String, column: String },
    #[error("chunk {chunk} of table '{table}' failed: {source}")]
    Chunk {
        table: String,
        chunk: usize,
        #[source]
        source: Box<StoreError>,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// The chunk defines the table's columns.
    Create,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    /// Anything other than `desc` (case-insensitive) sorts ascending.
    pub fn parse_lenient(s: &str) -> Self {
        if s.eq_ignore_ascii_case("desc") {
            Self::Desc
        } else {
            Self::Asc
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub row_count: u64,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowQuery {
    pub limit: u32,
    pub offset: u64,
    pub sort_by: Option<String>,
    pub order: SortOrder,
}

impl Default for RowQuery {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
            sort_by: None,
            order: SortOrder::Asc,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowPage {
    pub rows: Vec<Record>,
    pub total: u64,
}

/// A relational backend shared by every unit of a run.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Create the database if it does not exist yet.
    async fn prepare(&self) -> Result<(), StoreError>;

    /// Pin one connection for a sequence of chunk writes.
    async fn session(&self) -> Result<Box<dyn TableSession>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn tables(&self) -> Result<Vec<TableInfo>, StoreError>;

    /// `None` when the table does not exist.
    async fn columns(&self, table: &str) -> Result<Option<Vec<String>>, StoreError>;

    async fn fetch_rows(&self, table: &str, query: &RowQuery) -> Result<RowPage, StoreError>;
}

#[async_trait]
pub trait TableSession: Send {
    async fn table_exists(&mut self, table: &str) -> Result<bool, StoreError>;

    /// Write one chunk atomically. Returns the rows written.
    async fn write_chunk(
        &mut self,
        table: &str,
        rows: &[Record],
        mode: WriteMode,
    ) -> Result<u64, StoreError>;
}

pub struct StorageWriter {
    store: Arc<dyn TableStore>,
    chunk_size: usize,
}

impl StorageWriter {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self::with_chunk_size(store, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(store: Arc<dyn TableStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn store_handle(&self) -> Arc<dyn TableStore> {
        self.store.clone()
    }

    /// Persist `records` into `table`, returning the number of rows written.
    ///
    /// A failing chunk aborts the rest; chunks committed before it stay committed.
    pub async fn store(&self, records: &[Record], table: &str) -> Result<u64, StoreError> {
        if records.is_empty() {
            tracing::info!(table, "skipping storage for empty batch");
            return Ok(0);
        }
        validate_table_name(table)?;

        let rows = records
            .iter()
            .map(encode_composites)
            .collect::<Result<Vec<_>, _>>()?;

        let mut session = self.store.session().await?;
        let exists = session.table_exists(table).await?;
        let total_chunks = rows.len().div_ceil(self.chunk_size);

        let mut written = 0u64;
        for (i, chunk) in rows.chunks(self.chunk_size).enumerate() {
            let mode = if i == 0 && !exists {
                WriteMode::Create
            } else {
                WriteMode::Append
            };
            let n = session
                .write_chunk(table, chunk, mode)
                .await
                .map_err(|e| StoreError::Chunk {
                    table: table.to_string(),
                    chunk: i + 1,
                    source: Box::new(e),
                })?;
            written += n;
            tracing::info!(
                table,
                chunk = i + 1,
                total_chunks,
                rows = chunk.len(),
                mode = ?mode,
                "stored chunk"
            );
        }
        Ok(written)
    }
}

pub fn validate_table_name(table: &str) -> Result<(), StoreError> {
    if table.trim().is_empty() || table.contains('\0') || table.len() > 128 {
        return Err(StoreError::InvalidTable(table.to_string()));
    }
    Ok(())
}

/// Lists and maps become JSON strings; scalars pass through.
pub fn encode_composites(record: &Record) -> Result<Record, serde_json::Error> {
    record
        .iter()
        .map(|(k, v)| {
            let v = match v {
                Value::Array(_) | Value::Object(_) => Value::String(serde_json::to_string(v)?),
                other => other.clone(),
            };
            Ok::<_, serde_json::Error>((k.clone(), v))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Journal {
        existing: Vec<String>,
        writes: Vec<(String, usize, WriteMode)>,
        rows: Vec<Record>,
        fail_on_chunk: Option<usize>,
        sessions: usize,
    }

    #[derive(Default, Clone)]
    struct RecordingStore {
        journal: Arc<Mutex<Journal>>,
    }

    struct RecordingSession {
        journal: Arc<Mutex<Journal>>,
    }

    #[async_trait]
    impl TableStore for RecordingStore {
        async fn prepare(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn session(&self) -> Result<Box<dyn TableSession>, StoreError> {
            self.journal.lock().sessions += 1;
            Ok(Box::new(RecordingSession {
                journal: self.journal.clone(),
            }))
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn tables(&self) -> Result<Vec<TableInfo>, StoreError> {
            Ok(Vec::new())
        }
        async fn columns(&self, _table: &str) -> Result<Option<Vec<String>>, StoreError> {
            Ok(None)
        }
        async fn fetch_rows(&self, table: &str, _q: &RowQuery) -> Result<RowPage, StoreError> {
            Err(StoreError::TableNotFound(table.to_string()))
        }
    }

    #[async_trait]
    impl TableSession for RecordingSession {
        async fn table_exists(&mut self, table: &str) -> Result<bool, StoreError> {
            Ok(self.journal.lock().existing.iter().any(|t| t == table))
        }
        async fn write_chunk(
            &mut self,
            table: &str,
            rows: &[Record],
            mode: WriteMode,
        ) -> Result<u64, StoreError> {
            let mut j = self.journal.lock();
            if j.fail_on_chunk == Some(j.writes.len() + 1) {
                return Err(StoreError::InvalidTable("simulated".into()));
            }
            j.writes.push((table.to_string(), rows.len(), mode));
            j.rows.extend_from_slice(rows);
            if !j.existing.iter().any(|t| t == table) {
                j.existing.push(table.to_string());
            }
            Ok(rows.len() as u64)
        }
    }

    fn synthetic(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| serde_json::from_value(json!({"id": i, "name": format!("row-{i}")})).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn chunks_fresh_table_create_then_append() {
        let store = RecordingStore::default();
        let writer = StorageWriter::new(Arc::new(store.clone()));
        let n = writer.store(&synthetic(2500), "synthetic").await.unwrap();
        assert_eq!(n, 2500);

        let j = store.journal.lock();
        let shape: Vec<_> = j.writes.iter().map(|(_, n, m)| (*n, *m)).collect();
        assert_eq!(
            shape,
            vec![
                (1000, WriteMode::Create),
                (1000, WriteMode::Append),
                (500, WriteMode::Append)
            ]
        );
        assert_eq!(j.sessions, 1);
    }

    #[tokio::test]
    async fn existing_table_is_only_appended() {
        let store = RecordingStore::default();
        store.journal.lock().existing.push("t".into());
        let writer = StorageWriter::with_chunk_size(Arc::new(store.clone()), 2);
        writer.store(&synthetic(3), "t").await.unwrap();
        let j = store.journal.lock();
        assert!(j.writes.iter().all(|(_, _, m)| *m == WriteMode::Append));
        assert_eq!(j.writes.len(), 2);
    }

    #[tokio::test]
    async fn empty_input_is_a_noop() {
        let store = RecordingStore::default();
        let writer = StorageWriter::new(Arc::new(store.clone()));
        assert_eq!(writer.store(&[], "t").await.unwrap(), 0);
        assert_eq!(store.journal.lock().sessions, 0);
    }

    #[tokio::test]
    async fn failing_chunk_aborts_the_rest() {
        let store = RecordingStore::default();
        store.journal.lock().fail_on_chunk = Some(2);
        let writer = StorageWriter::with_chunk_size(Arc::new(store.clone()), 10);
        let err = writer.store(&synthetic(35), "t").await.unwrap_err();
        assert!(matches!(err, StoreError::Chunk { chunk: 2, .. }));
        assert_eq!(store.journal.lock().writes.len(), 1);
    }

    #[tokio::test]
    async fn composites_are_encoded_before_writing() {
        let store = RecordingStore::default();
        let writer = StorageWriter::new(Arc::new(store.clone()));
        let rec: Record =
            serde_json::from_value(json!({"id": 1, "tags": ["a", 1], "meta": {"k": true}})).unwrap();
        writer.store(&[rec], "t").await.unwrap();

        let j = store.journal.lock();
        let stored = &j.rows[0];
        assert_eq!(stored["id"], json!(1));
        let tags: Value = serde_json::from_str(stored["tags"].as_str().unwrap()).unwrap();
        assert_eq!(tags, json!(["a", 1]));
        let meta: Value = serde_json::from_str(stored["meta"].as_str().unwrap()).unwrap();
        assert_eq!(meta, json!({"k": true}));
    }

    #[tokio::test]
    async fn blank_table_name_is_rejected() {
        let writer = StorageWriter::new(Arc::new(RecordingStore::default()));
        let err = writer.store(&synthetic(1), " ").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTable(_)));
    }

    #[test]
    fn sort_order_parsing() {
        assert_eq!(SortOrder::parse_lenient("DESC"), SortOrder::Desc);
        assert_eq!(SortOrder::parse_lenient("sideways"), SortOrder::Asc);
    }
}
