// src/ingest/normalize.rs
//! Shape normalization: arbitrary JSON payload -> flat, tabular [`Record`]s.
//!
//! Steps, in order:
//! 1. Empty payloads (`null`, `{}`, `[]`, `""`) yield no records.
//! 2. GraphQL responses are unwrapped from their `data` envelope by the first
//!    [`UnwrapStrategy`] that recognises the shape.
//! 3. Anything that is neither an object nor a list is a [`ShapeError`].
//! 4. An object carrying a list under one of the list keys (`results`, `items`, `data`)
//!    is replaced by that list; any other object becomes a one-element list.
//! 5. Every element is flattened: nested objects become dotted keys, lists and empty
//!    objects become JSON strings, and columns missing from a row are filled with `null`.
//!
//! The column order is the order of first appearance across the batch, so the same
//! payload always produces the same records in the same column order.

use indexmap::IndexSet;
use serde_json::{Map, Value};

use crate::ingest::types::{Record, SourceDescriptor, SourceKind};

pub const DEFAULT_LIST_KEYS: [&str; 3] = ["results", "items", "data"];

/// Column name used when a list element is a scalar instead of an object.
pub const SCALAR_COLUMN: &str = "value";

#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("unexpected payload shape: {0}")]
    Unsupported(&'static str),
    #[error("failed to encode nested value: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Picks the working payload out of a GraphQL `data` object.
pub trait UnwrapStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn unwrap<'a>(&self, data: &'a Map<String, Value>) -> Option<&'a Value>;
}

/// `data.<key>` is a paged container: `{ "info": {..}, "results": [..] }`.
pub struct PagedResults;

impl UnwrapStrategy for PagedResults {
    fn name(&self) -> &'static str {
        "paged_results"
    }

    fn unwrap<'a>(&self, data: &'a Map<String, Value>) -> Option<&'a Value> {
        data.values().find_map(|v| {
            v.as_object()
                .and_then(|o| o.get("results"))
                .filter(|r| r.is_array())
        })
    }
}

/// `data.<key>` is the collection itself.
pub struct DirectList;

impl UnwrapStrategy for DirectList {
    fn name(&self) -> &'static str {
        "direct_list"
    }

    fn unwrap<'a>(&self, data: &'a Map<String, Value>) -> Option<&'a Value> {
        data.values().find(|v| v.is_array())
    }
}

/// Fallback: whatever sits under the first key.
pub struct FirstKey;

impl UnwrapStrategy for FirstKey {
    fn name(&self) -> &'static str {
        "first_key"
    }

    fn unwrap<'a>(&self, data: &'a Map<String, Value>) -> Option<&'a Value> {
        data.values().next()
    }
}

pub struct Normalizer {
    strategies: Vec<Box<dyn UnwrapStrategy>>,
    list_keys: Vec<String>,
    separator: String,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::with_strategies(vec![
            Box::new(PagedResults),
            Box::new(DirectList),
            Box::new(FirstKey),
        ])
    }
}

impl Normalizer {
    pub fn with_strategies(strategies: Vec<Box<dyn UnwrapStrategy>>) -> Self {
        Self {
            strategies,
            list_keys: DEFAULT_LIST_KEYS.iter().map(|k| k.to_string()).collect(),
            separator: ".".to_string(),
        }
    }

    pub fn with_list_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.list_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Never fails: shape errors are logged and yield an empty batch.
    pub fn normalize(&self, payload: &Value, source: &SourceDescriptor) -> Vec<Record> {
        match self.try_normalize(payload, source) {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(source = %source.label, url = %source.url, error = %e, "normalization failed");
                Vec::new()
            }
        }
    }

    pub fn try_normalize(
        &self,
        payload: &Value,
        source: &SourceDescriptor,
    ) -> Result<Vec<Record>, ShapeError> {
        if is_empty(payload) {
            tracing::warn!(source = %source.label, "no data to transform");
            return Ok(Vec::new());
        }

        let mut working = payload;
        if source.kind == SourceKind::GraphQl {
            working = self.unwrap_graphql(working, &source.label);
            if is_empty(working) {
                tracing::warn!(source = %source.label, "graphql response carried no data");
                return Ok(Vec::new());
            }
        }

        let items: Vec<&Value> = match working {
            Value::Array(list) => list.iter().collect(),
            Value::Object(obj) => match self.list_field(obj) {
                Some(list) => list.iter().collect(),
                None => vec![working],
            },
            Value::Null => return Ok(Vec::new()),
            Value::Bool(_) => return Err(ShapeError::Unsupported("boolean")),
            Value::Number(_) => return Err(ShapeError::Unsupported("number")),
            Value::String(_) => return Err(ShapeError::Unsupported("string")),
        };

        self.flatten_all(&items)
    }

    fn unwrap_graphql<'a>(&self, payload: &'a Value, label: &str) -> &'a Value {
        let Some(data) = payload.get("data") else {
            return payload;
        };
        let Some(obj) = data.as_object() else {
            return data;
        };
        for strategy in &self.strategies {
            if let Some(v) = strategy.unwrap(obj) {
                tracing::debug!(source = %label, strategy = strategy.name(), "unwrapped graphql envelope");
                return v;
            }
        }
        data
    }

    fn list_field<'a>(&self, obj: &'a Map<String, Value>) -> Option<&'a Vec<Value>> {
        self.list_keys
            .iter()
            .find_map(|k| obj.get(k).and_then(Value::as_array))
    }

    fn flatten_all(&self, items: &[&Value]) -> Result<Vec<Record>, ShapeError> {
        let mut rows = Vec::with_capacity(items.len());
        let mut columns: IndexSet<String> = IndexSet::new();

        for item in items {
            let mut row = Record::new();
            match item {
                // Skipped: a null element has no columns to contribute.
                Value::Null => continue,
                Value::Object(obj) => self.flatten_into(None, obj, &mut row)?,
                Value::Array(_) => {
                    row.insert(SCALAR_COLUMN.to_string(), Value::String(serde_json::to_string(item)?));
                }
                scalar => {
                    row.insert(SCALAR_COLUMN.to_string(), (*scalar).clone());
                }
            }
            for k in row.keys() {
                if !columns.contains(k) {
                    columns.insert(k.clone());
                }
            }
            rows.push(row);
        }

        Ok(rows
            .into_iter()
            .map(|mut row| {
                columns
                    .iter()
                    .map(|c| (c.clone(), row.swap_remove(c).unwrap_or(Value::Null)))
                    .collect()
            })
            .collect())
    }

    fn flatten_into(
        &self,
        prefix: Option<&str>,
        obj: &Map<String, Value>,
        out: &mut Record,
    ) -> Result<(), ShapeError> {
        for (k, v) in obj {
            let key = match prefix {
                Some(p) => format!("{p}{}{k}", self.separator),
                None => k.clone(),
            };
            match v {
                Value::Object(inner) if !inner.is_empty() => {
                    self.flatten_into(Some(&key), inner, out)?
                }
                Value::Object(_) | Value::Array(_) => {
                    out.insert(key, Value::String(serde_json::to_string(v)?));
                }
                scalar => {
                    out.insert(key, scalar.clone());
                }
            }
        }
        Ok(())
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Object(o) => o.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
