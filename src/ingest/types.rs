// src/ingest/types.rs
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// One flattened row: column name -> scalar (or JSON-encoded string) value.
pub type Record = IndexMap<String, Value>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("url is required for a source")]
    EmptyUrl,
    #[error("unsupported source kind '{0}': must be 'REST' or 'GraphQL'")]
    UnknownKind(String),
    #[error("query is required for a GraphQL source")]
    MissingQuery,
    #[error("retry_attempts must be at least 1")]
    ZeroRetries,
    #[error("timeout must be at least 1 second")]
    ZeroTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "REST")]
    Rest,
    #[serde(rename = "GraphQL")]
    GraphQl,
}

impl FromStr for SourceKind {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REST" => Ok(Self::Rest),
            "GRAPHQL" => Ok(Self::GraphQl),
            _ => Err(SourceError::UnknownKind(s.to_string())),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rest => f.write_str("REST"),
            Self::GraphQl => f.write_str("GraphQL"),
        }
    }
}

/// Unvalidated source entry, as it arrives from a config file or a request body.
///
/// Field names follow the on-disk format (`api_type`, `table_name`, `timeout` in seconds).
/// Call [`SourceSpec::build`] to obtain a [`SourceDescriptor`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceSpec {
    pub url: String,
    #[serde(alias = "kind", alias = "type")]
    pub api_type: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    /// Seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl SourceSpec {
    pub fn new(url: impl Into<String>, api_type: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_type: api_type.into(),
            ..Self::default()
        }
    }

    pub fn rest(url: impl Into<String>) -> Self {
        Self::new(url, "REST")
    }

    pub fn graphql(url: impl Into<String>, query: impl Into<String>) -> Self {
        Self::new(url, "GraphQL").query(query)
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn table_name(mut self, table: impl Into<String>) -> Self {
        self.table_name = Some(table.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    /// Validate and fill defaults.
    pub fn build(self) -> Result<SourceDescriptor, SourceError> {
        SourceDescriptor::try_from(self)
    }
}

/// Immutable description of one external source. Shared read-only across a run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "SourceSpec")]
pub struct SourceDescriptor {
    pub url: String,
    pub kind: SourceKind,
    /// Always `Some` for GraphQL, always `None` for REST.
    pub query: Option<String>,
    pub params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub label: String,
    pub table_name: String,
    pub retry_attempts: u32,
    pub timeout: Duration,
}

impl TryFrom<SourceSpec> for SourceDescriptor {
    type Error = SourceError;

    fn try_from(spec: SourceSpec) -> Result<Self, Self::Error> {
        let url = spec.url.trim().to_string();
        if url.is_empty() {
            return Err(SourceError::EmptyUrl);
        }
        let kind: SourceKind = spec.api_type.parse()?;

        let query = match kind {
            SourceKind::GraphQl => {
                let q = spec.query.unwrap_or_default();
                if q.trim().is_empty() {
                    return Err(SourceError::MissingQuery);
                }
                Some(q)
            }
            // REST ignores any query that slipped in.
            SourceKind::Rest => None,
        };

        let retry_attempts = spec.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS);
        if retry_attempts == 0 {
            return Err(SourceError::ZeroRetries);
        }
        let timeout_secs = spec.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(SourceError::ZeroTimeout);
        }

        let label = spec
            .label
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| host_of(&url));
        let table_name = spec
            .table_name
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| sanitize_table_name(&label));

        Ok(Self {
            url,
            kind,
            query,
            params: spec.params,
            headers: spec.headers,
            label,
            table_name,
            retry_attempts,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Source({}, {})", self.label, self.kind)
    }
}

/// Host component of a URL (port included), or the raw string when it has no scheme.
fn host_of(url: &str) -> String {
    let Some((_, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    // Drop any `user:pass@`.
    authority
        .rsplit_once('@')
        .map(|(_, host)| host)
        .unwrap_or(authority)
        .to_string()
}

/// Lowercase, with `.` and `-` turned into `_`.
pub fn sanitize_table_name(label: &str) -> String {
    label.to_lowercase().replace(['.', '-'], "_")
}

/// Result of fetching one source. No partial payloads: either the whole JSON body or nothing.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub source: Arc<SourceDescriptor>,
    pub payload: Option<Value>,
    /// Attempts actually performed (0 when cancelled before the first one).
    pub attempts: u32,
}

impl FetchOutcome {
    pub fn fetched(source: Arc<SourceDescriptor>, payload: Value, attempts: u32) -> Self {
        Self {
            source,
            payload: Some(payload),
            attempts,
        }
    }

    pub fn absent(source: Arc<SourceDescriptor>, attempts: u32) -> Self {
        Self {
            source,
            payload: None,
            attempts,
        }
    }

    pub fn is_fetched(&self) -> bool {
        self.payload.is_some()
    }
}
