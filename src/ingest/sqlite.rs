// src/ingest/sqlite.rs
//! SQLite backend for [`TableStore`] on top of a shared `sqlx` pool.
//!
//! Columns are created from the first chunk with an affinity taken from the first
//! non-null value. Later chunks that bring new keys get those columns added
//! (`ALTER TABLE .. ADD COLUMN`), so earlier rows read them back as `NULL`.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexSet;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Connection, Row, Sqlite, TypeInfo, ValueRef};

use crate::ingest::store::{
    RowPage, RowQuery, StoreError, TableInfo, TableSession, TableStore, WriteMode,
};
use crate::ingest::types::Record;

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    options: SqliteConnectOptions,
}

impl SqliteStore {
    /// Build the pool without touching the database; [`TableStore::prepare`] creates it.
    pub fn connect_lazy(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy_with(options.clone());
        Ok(Self { pool, options })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub struct SqliteSession {
    conn: PoolConnection<Sqlite>,
}

#[async_trait]
impl TableStore for SqliteStore {
    async fn prepare(&self) -> Result<(), StoreError> {
        let path = self.options.get_filename();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        self.ping().await?;
        tracing::info!(database = %path.display(), "database ready");
        Ok(())
    }

    async fn session(&self) -> Result<Box<dyn TableSession>, StoreError> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(SqliteSession { conn }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn tables(&self) -> Result<Vec<TableInfo>, StoreError> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut conn = self.pool.acquire().await?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let columns = table_columns(&mut conn, &name).await?;
            let row_count = count_rows(&mut conn, &name).await?;
            out.push(TableInfo {
                name,
                row_count,
                columns,
            });
        }
        Ok(out)
    }

    async fn columns(&self, table: &str) -> Result<Option<Vec<String>>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let cols = table_columns(&mut conn, table).await?;
        Ok((!cols.is_empty()).then_some(cols))
    }

    async fn fetch_rows(&self, table: &str, query: &RowQuery) -> Result<RowPage, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let columns = table_columns(&mut conn, table).await?;
        if columns.is_empty() {
            return Err(StoreError::TableNotFound(table.to_string()));
        }

        let mut sql = format!("SELECT * FROM {}", quote_ident(table));
        if let Some(sort) = &query.sort_by {
            if !columns.iter().any(|c| c == sort) {
                return Err(StoreError::UnknownColumn {
                    table: table.to_string(),
                    column: sort.clone(),
                });
            }
            sql.push_str(&format!(
                " ORDER BY {} {}",
                quote_ident(sort),
                query.order.as_sql()
            ));
        }
        sql.push_str(" LIMIT ?1 OFFSET ?2");

        let offset = i64::try_from(query.offset).unwrap_or(i64::MAX);
        let rows = sqlx::query(&sql)
            .bind(i64::from(query.limit))
            .bind(offset)
            .fetch_all(&mut *conn)
            .await?;
        let total = count_rows(&mut conn, table).await?;

        Ok(RowPage {
            rows: rows.iter().map(row_to_record).collect(),
            total,
        })
    }
}

#[async_trait]
impl TableSession for SqliteSession {
    async fn table_exists(&mut self, table: &str) -> Result<bool, StoreError> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        )
        .bind(table)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(n > 0)
    }

    async fn write_chunk(
        &mut self,
        table: &str,
        rows: &[Record],
        mode: WriteMode,
    ) -> Result<u64, StoreError> {
        let columns = chunk_columns(rows);
        // Write lock up front. A deferred transaction that has already read cannot be
        // upgraded after another writer commits (SQLITE_BUSY, busy_timeout not honoured).
        let mut tx = Connection::begin_with(&mut *self.conn, "BEGIN IMMEDIATE").await?;

        if mode == WriteMode::Create {
            let defs = columns
                .iter()
                .map(|(key, col)| column_def(col, key, rows))
                .collect::<Vec<_>>()
                .join(", ");
            let ddl = format!("CREATE TABLE IF NOT EXISTS {} ({defs})", quote_ident(table));
            sqlx::query(&ddl).execute(&mut *tx).await?;
        }

        // Union-of-columns: anything the table lacks is added before inserting.
        let existing: HashSet<String> = table_columns(&mut tx, table)
            .await?
            .iter()
            .map(|c| c.to_lowercase())
            .collect();
        for (key, col) in columns.iter().filter(|(_, c)| !existing.contains(&c.to_lowercase())) {
            let ddl = format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(table),
                column_def(col, key, rows)
            );
            sqlx::query(&ddl).execute(&mut *tx).await?;
            tracing::debug!(table, column = %col, "added column");
        }

        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns
                .iter()
                .map(|(_, c)| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            (1..=columns.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        for row in rows {
            let mut q = sqlx::query(&insert);
            for (key, _) in &columns {
                q = bind_value(q, row.get(key));
            }
            q.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(rows.len() as u64)
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Record keys paired with the column each is stored in.
///
/// SQLite identifiers are case-insensitive, so a key that collides with an earlier one
/// (`id` then `ID`) is stored under a numbered name (`ID_2`).
fn chunk_columns(rows: &[Record]) -> Vec<(String, String)> {
    let mut keys: IndexSet<&String> = IndexSet::new();
    for row in rows {
        keys.extend(row.keys());
    }

    let mut taken: HashSet<String> = HashSet::new();
    keys.into_iter()
        .map(|key| {
            let mut column = key.clone();
            let mut n = 2;
            while !taken.insert(column.to_lowercase()) {
                column = format!("{key}_{n}");
                n += 1;
            }
            if &column != key {
                tracing::warn!(key = %key, column = %column, "case-colliding key stored under a new column");
            }
            (key.clone(), column)
        })
        .collect()
}

/// `"name" AFFINITY`, affinity from the first non-null value under `key`.
fn column_def(column: &str, key: &str, rows: &[Record]) -> String {
    let first = rows
        .iter()
        .filter_map(|r| r.get(key))
        .find(|v| !v.is_null());
    let affinity = match first {
        Some(Value::Bool(_)) => " BOOLEAN",
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => " INTEGER",
        Some(Value::Number(_)) => " REAL",
        Some(_) => " TEXT",
        // No declared type: values are stored exactly as bound.
        None => "",
    };
    format!("{}{affinity}", quote_ident(column))
}

fn bind_value<'q>(q: SqliteQuery<'q>, value: Option<&Value>) -> SqliteQuery<'q> {
    match value {
        None | Some(Value::Null) => q.bind(None::<String>),
        Some(Value::Bool(b)) => q.bind(*b),
        Some(Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => q.bind(i),
            (None, Some(f)) => q.bind(f),
            (None, None) => q.bind(n.to_string()),
        },
        Some(Value::String(s)) => q.bind(s.clone()),
        Some(other) => q.bind(other.to_string()),
    }
}

async fn table_columns(conn: &mut SqliteConnection, table: &str) -> Result<Vec<String>, StoreError> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|r| r.try_get::<String, _>("name").map_err(StoreError::from))
        .collect()
}

async fn count_rows(conn: &mut SqliteConnection, table: &str) -> Result<u64, StoreError> {
    let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
        .fetch_one(&mut *conn)
        .await?;
    Ok(u64::try_from(n).unwrap_or(0))
}

fn row_to_record(row: &SqliteRow) -> Record {
    row.columns()
        .iter()
        .map(|c| (c.name().to_string(), decode_column(row, c.ordinal(), c.type_info().name())))
        .collect()
}

fn decode_column(row: &SqliteRow, i: usize, declared: &str) -> Value {
    match row.try_get_raw(i) {
        Ok(raw) if !raw.is_null() => {}
        _ => return Value::Null,
    }
    if declared == "BOOLEAN" {
        if let Ok(b) = row.try_get::<bool, _>(i) {
            return Value::Bool(b);
        }
    }
    if let Ok(v) = row.try_get::<i64, _>(i) {
        return Value::from(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(i) {
        return serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<String, _>(i) {
        return Value::String(v);
    }
    if let Ok(v) = row.try_get::<Vec<u8>, _>(i) {
        return Value::String(String::from_utf8_lossy(&v).into_owned());
    }
    Value::Null
}
