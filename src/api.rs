// src/api.rs
//! HTTP surface: stored-table browsing plus on-demand ingest runs.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Path, Query, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::config::Settings;
use crate::ingest::store::{RowQuery, SortOrder, StoreError, TableStore};
use crate::ingest::types::SourceSpec;
use crate::ingest::Orchestrator;
use crate::metrics::Metrics;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const PROCESS_TIME_HEADER: &str = "x-process-time";
pub const MAX_PAGE_LIMIT: u32 = 1000;

pub(crate) fn ensure_request_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("api_requests_total", "HTTP requests by endpoint, method and status.");
        describe_histogram!("api_request_latency_seconds", "HTTP request latency by endpoint.");
    });
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub settings: Arc<Settings>,
    pub metrics: Option<Metrics>,
    /// Parent of every background run started over HTTP.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, settings: Settings) -> Self {
        Self {
            orchestrator,
            settings: Arc::new(settings),
            metrics: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn store(&self) -> Arc<dyn TableStore> {
        self.orchestrator.store()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Invalid or missing API key")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::TableNotFound(t) => ApiError::NotFound(format!("Table '{t}' not found")),
            StoreError::UnknownColumn { table, column } => {
                ApiError::BadRequest(format!("Column '{column}' not found in table '{table}'"))
            }
            StoreError::InvalidTable(t) => ApiError::BadRequest(format!("Invalid table name '{t}'")),
            other => {
                tracing::error!(error = %other, "storage error while serving request");
                ApiError::Internal("Internal server error".to_string())
            }
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    ensure_request_metrics_described();

    let protected = Router::new()
        .route("/tables", get(list_tables))
        .route("/data/{table}", get(table_data))
        .route("/process", post(process))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let mut router = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .merge(protected)
        .with_state(state.clone());

    if let Some(m) = &state.metrics {
        router = router.merge(m.router());
    }

    router
        .layer(middleware::from_fn(track_requests))
        .layer(cors_layer(&state.settings.cors_origins))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::very_permissive();
    }
    let list: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring malformed CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(list))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.settings.requires_api_key() {
        let given = req
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if given != Some(state.settings.api_key.as_str()) {
            return Err(ApiError::Unauthorized);
        }
    }
    Ok(next.run(req).await)
}

async fn track_requests(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let mut res = next.run(req).await;

    let elapsed = start.elapsed().as_secs_f64();
    counter!(
        "api_requests_total",
        "endpoint" => endpoint.clone(),
        "method" => method,
        "status" => res.status().as_u16().to_string()
    )
    .increment(1);
    histogram!("api_request_latency_seconds", "endpoint" => endpoint).record(elapsed);
    if let Ok(v) = HeaderValue::from_str(&format!("{elapsed:.6}")) {
        res.headers_mut().insert(PROCESS_TIME_HEADER, v);
    }
    res
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Tabular ingest API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/metrics", "/tables", "/data/{table}", "/process"],
    }))
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let (status, db) = match state.store().ping().await {
        Ok(()) => (StatusCode::OK, "healthy".to_string()),
        Err(e) => {
            tracing::warn!(error = %e, "health check: database unreachable");
            (StatusCode::SERVICE_UNAVAILABLE, format!("unhealthy: {e}"))
        }
    };
    let body = json!({
        "status": if status.is_success() { "healthy" } else { "unhealthy" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "hostname": std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        "checks": { "database": db },
    });
    (status, Json(body))
}

async fn list_tables(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let tables = state.store().tables().await?;
    let mut out = Map::new();
    for t in tables {
        out.insert(
            t.name,
            json!({ "row_count": t.row_count, "columns": t.columns }),
        );
    }
    Ok(Json(json!({ "tables": out })))
}

#[derive(Debug, serde::Deserialize)]
struct DataParams {
    limit: Option<i64>,
    offset: Option<i64>,
    sort_by: Option<String>,
    sort_order: Option<String>,
}

async fn table_data(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(params): Query<DataParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(100);
    if !(1..=MAX_PAGE_LIMIT as i64).contains(&limit) {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {MAX_PAGE_LIMIT}"
        )));
    }
    let offset = params.offset.unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::BadRequest("offset must be >= 0".to_string()));
    }
    let order = params
        .sort_order
        .as_deref()
        .map(SortOrder::parse_lenient)
        .unwrap_or_default();

    let query = RowQuery {
        limit: limit as u32,
        offset: offset as u64,
        sort_by: params.sort_by.filter(|s| !s.is_empty()),
        order,
    };
    let page = state.store().fetch_rows(&table, &query).await?;

    let data: Vec<Value> = page
        .rows
        .into_iter()
        .map(|row| {
            Value::Object(
                row.into_iter()
                    .map(|(k, v)| (k, decode_json_text(v)))
                    .collect(),
            )
        })
        .collect();

    Ok(Json(json!({
        "data": data,
        "metadata": {
            "total": page.total,
            "limit": query.limit,
            "offset": query.offset,
            "sort_by": query.sort_by,
            "sort_order": order,
        }
    })))
}

/// Stored composites come back as JSON text; hand them out as structures again.
fn decode_json_text(v: Value) -> Value {
    match v {
        Value::String(s) if s.starts_with('{') || s.starts_with('[') => {
            serde_json::from_str(&s).unwrap_or(Value::String(s))
        }
        other => other,
    }
}

#[derive(Debug, serde::Deserialize)]
struct ProcessReq {
    apis: Vec<SourceSpec>,
}

async fn process(
    State(state): State<AppState>,
    Json(req): Json<ProcessReq>,
) -> Result<Json<Value>, ApiError> {
    if req.apis.is_empty() {
        return Err(ApiError::BadRequest("No API configurations provided".to_string()));
    }
    let mut sources = Vec::with_capacity(req.apis.len());
    for (i, spec) in req.apis.into_iter().enumerate() {
        let source = spec
            .build()
            .map_err(|e| ApiError::BadRequest(format!("Invalid API config at index {i}: {e}")))?;
        sources.push(source);
    }
    let labels: Vec<String> = sources.iter().map(|s| s.label.clone()).collect();
    let count = sources.len();

    let orchestrator = state.orchestrator.clone();
    let cancel = state.shutdown.child_token();
    tokio::spawn(async move {
        match orchestrator.run_with_cancel(sources, cancel).await {
            Ok(report) => tracing::info!(
                sources = report.len(),
                failed = report.failures(),
                total_rows = report.total_rows(),
                "background ingest finished"
            ),
            Err(e) => tracing::error!(error = %e, "background ingest failed"),
        }
    });

    Ok(Json(json!({
        "status": "processing_started",
        "message": format!("Processing {count} APIs in background"),
        "apis": labels,
    })))
}
