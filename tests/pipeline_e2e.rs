// tests/pipeline_e2e.rs
mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tabular_ingest::ingest::fetcher::SourceFetcher;
use tabular_ingest::ingest::limiter::RunContext;
use tabular_ingest::ingest::normalize::Normalizer;
use tabular_ingest::ingest::sqlite::SqliteStore;
use tabular_ingest::ingest::store::{
    RowPage, RowQuery, StorageWriter, StoreError, TableInfo, TableSession, TableStore, WriteMode,
};
use tabular_ingest::ingest::types::{FetchOutcome, Record};
use tabular_ingest::{
    Orchestrator, PipelineError, PipelineSettings, SourceDescriptor, SourceSpec, SourceState,
};
use tokio_util::sync::CancellationToken;

fn settings() -> PipelineSettings {
    PipelineSettings {
        rate_limit: 4,
        workers: 2,
        unit_timeout: Duration::from_secs(30),
    }
}

fn items(n: usize) -> Value {
    Value::Array(
        (0..n)
            .map(|i| {
                json!({
                    "id": i,
                    "name": format!("item-{i}"),
                    "meta": { "kind": "demo", "rank": i % 7 },
                    "tags": ["a", "b"],
                })
            })
            .collect(),
    )
}

#[tokio::test]
async fn one_bad_source_never_affects_the_others() {
    let app = Router::new()
        .route("/ok", get(|| async { Json(items(3)) }))
        .route("/weird", get(|| async { Json(json!(42)) }));
    let addr = common::serve(app).await;
    let closed = common::closed_addr().await;

    let dir = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(dir.path(), settings());
    let report = orch
        .run(vec![
            common::rest(closed, "/gone", "unreachable"),
            common::rest(addr, "/weird", "weird"),
            common::rest(addr, "/ok", "good"),
        ])
        .await
        .unwrap();

    assert_eq!(report.len(), 3);
    assert_eq!(report.row_count("unreachable"), 0);
    assert_eq!(report.get("unreachable").unwrap().state, SourceState::FetchFailed);
    assert_eq!(report.row_count("weird"), 0);
    assert_eq!(report.get("weird").unwrap().state, SourceState::TransformFailed);
    assert_eq!(report.row_count("good"), 3);
    assert_eq!(report.get("good").unwrap().state, SourceState::Stored);
    assert_eq!(report.failures(), 2);
}

#[tokio::test]
async fn large_batch_is_chunked_and_reads_back() {
    let app = Router::new().route("/many", get(|| async { Json(items(2500)) }));
    let addr = common::serve(app).await;
    let dir = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(dir.path(), settings());

    let report = orch
        .run(vec![common::rest(addr, "/many", "many")])
        .await
        .unwrap();
    assert_eq!(report.row_count("many"), 2500);

    let store = orch.store();
    let page = store
        .fetch_rows(
            "many",
            &RowQuery {
                limit: 1,
                sort_by: Some("id".into()),
                ..RowQuery::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.total, 2500);
    let first = &page.rows[0];
    assert_eq!(first["id"], json!(0));
    assert_eq!(first["meta.kind"], json!("demo"));
    assert_eq!(first["tags"], json!("[\"a\",\"b\"]"));

    // A second run appends to the existing table.
    orch.run(vec![common::rest(addr, "/many", "many")])
        .await
        .unwrap();
    let tables = store.tables().await.unwrap();
    assert_eq!(tables[0].row_count, 5000);
}

#[tokio::test]
async fn graphql_envelopes_are_unwrapped_end_to_end() {
    let app = Router::new().route(
        "/graphql",
        post(|| async {
            Json(json!({
                "data": { "characters": {
                    "info": { "count": 2 },
                    "results": [
                        { "name": "Rick", "status": "Alive" },
                        { "name": "Morty", "status": "Alive" }
                    ]
                }}
            }))
        }),
    );
    let addr = common::serve(app).await;
    let dir = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(dir.path(), settings());

    let query = "query { characters { results { name status } } }";
    let source = SourceSpec::graphql(format!("http://{addr}/graphql"), query)
        .label("rick")
        .build()
        .unwrap();
    let report = orch.run(vec![source]).await.unwrap();
    assert_eq!(report.row_count("rick"), 2);

    let cols = orch.store().columns("rick").await.unwrap().unwrap();
    assert_eq!(cols, vec!["name", "status"]);
}

#[tokio::test]
async fn empty_payload_is_stored_as_zero_rows() {
    let app = Router::new().route("/empty", get(|| async { Json(json!([])) }));
    let addr = common::serve(app).await;
    let dir = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(dir.path(), settings());

    let report = orch
        .run(vec![common::rest(addr, "/empty", "empty")])
        .await
        .unwrap();
    assert_eq!(report.get("empty").unwrap().state, SourceState::Stored);
    assert_eq!(report.row_count("empty"), 0);
    assert!(orch.store().tables().await.unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_run_still_reports_every_source() {
    let app = Router::new()
        .route(
            "/hang",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Json(json!([]))
            }),
        )
        .route("/ok", get(|| async { Json(items(2)) }));
    let addr = common::serve(app).await;
    let dir = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(dir.path(), settings());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let t0 = Instant::now();
    let report = orch
        .run_with_cancel(
            vec![
                common::rest(addr, "/hang", "hang"),
                common::rest(addr, "/ok", "ok"),
            ],
            cancel,
        )
        .await
        .unwrap();

    assert!(t0.elapsed() < Duration::from_secs(10));
    assert_eq!(report.len(), 2);
    assert_eq!(report.get("hang").unwrap().state, SourceState::FetchFailed);
    assert_eq!(report.row_count("ok"), 2);
}

#[tokio::test]
async fn unusable_database_location_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let url = format!("sqlite://{}", blocker.join("sub/db.sqlite").display());

    let store = SqliteStore::connect_lazy(&url, 1).unwrap();
    let orch = Orchestrator::new(
        Arc::new(common::fast_fetcher()),
        Arc::new(Normalizer::default()),
        Arc::new(StorageWriter::new(Arc::new(store))),
        settings(),
    );
    let source = SourceSpec::rest("http://127.0.0.1:9/x").build().unwrap();
    let err = orch.run(vec![source]).await.unwrap_err();
    assert!(matches!(err, PipelineError::Prepare(_)));
}

/// Answers every source with a fixed payload, no network.
struct StaticFetcher(Value);

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch(&self, _ctx: &RunContext, source: Arc<SourceDescriptor>) -> FetchOutcome {
        FetchOutcome::fetched(source, self.0.clone(), 1)
    }
}

/// A store whose writes never finish.
struct StuckStore;

struct StuckSession;

#[async_trait]
impl TableStore for StuckStore {
    async fn prepare(&self) -> Result<(), StoreError> {
        Ok(())
    }
    async fn session(&self) -> Result<Box<dyn TableSession>, StoreError> {
        Ok(Box::new(StuckSession))
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
impl TableSession for StuckSession {
    async fn table_exists(&mut self, _table: &str) -> Result<bool, StoreError> {
        Ok(false)
    }
    async fn write_chunk(
        &mut self,
        _table: &str,
        _rows: &[Record],
        _mode: WriteMode,
    ) -> Result<u64, StoreError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(0)
    }
}

#[tokio::test]
async fn unit_deadline_fails_the_stage_it_interrupts() {
    let orch = Orchestrator::new(
        Arc::new(StaticFetcher(items(5))),
        Arc::new(Normalizer::default()),
        Arc::new(StorageWriter::new(Arc::new(StuckStore))),
        PipelineSettings {
            unit_timeout: Duration::from_millis(200),
            ..settings()
        },
    );
    let sources = vec![
        SourceSpec::rest("http://a.test/x").label("a").build().unwrap(),
        SourceSpec::rest("http://b.test/x").label("b").build().unwrap(),
        SourceSpec::rest("http://c.test/x").label("c").build().unwrap(),
    ];

    let t0 = Instant::now();
    let report = orch.run(sources).await.unwrap();
    assert!(t0.elapsed() < Duration::from_secs(10));
    assert_eq!(report.len(), 3);
    for (_, r) in report.iter() {
        assert_eq!(r.state, SourceState::StoreFailed);
        assert_eq!(r.rows, 0);
    }
}

#[tokio::test]
async fn more_sources_than_workers_all_complete() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::connect_lazy(&common::sqlite_url(dir.path()), 4).unwrap();
    let orch = Orchestrator::new(
        Arc::new(StaticFetcher(items(10))),
        Arc::new(Normalizer::default()),
        Arc::new(StorageWriter::new(Arc::new(store))),
        PipelineSettings {
            workers: 1,
            ..settings()
        },
    );
    let sources: Vec<_> = (0..6)
        .map(|i| {
            SourceSpec::rest(format!("http://s{i}.test/x"))
                .build()
                .unwrap()
        })
        .collect();

    let report = orch.run(sources).await.unwrap();
    assert_eq!(report.len(), 6);
    assert_eq!(report.total_rows(), 60);
    assert_eq!(orch.store().tables().await.unwrap().len(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_workers_store_multi_chunk_batches_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::connect_lazy(&common::sqlite_url(dir.path()), 6).unwrap();
    let orch = Orchestrator::new(
        Arc::new(StaticFetcher(items(1500))),
        Arc::new(Normalizer::default()),
        Arc::new(StorageWriter::with_chunk_size(Arc::new(store), 100)),
        PipelineSettings {
            rate_limit: 100,
            workers: 6,
            ..settings()
        },
    );
    let sources = || -> Vec<SourceDescriptor> {
        (0..6)
            .map(|i| {
                SourceSpec::rest(format!("http://s{i}.test/x"))
                    .build()
                    .unwrap()
            })
            .collect()
    };

    // Fresh database, then again with every table already present.
    for round in 1..=2u64 {
        let report = orch.run(sources()).await.unwrap();
        assert_eq!(report.len(), 6);
        for i in 0..6 {
            let label = format!("s{i}.test");
            let entry = report.get(&label).unwrap();
            assert_eq!(entry.state, SourceState::Stored, "{label} round {round}");
            assert_eq!(entry.rows, 1500, "{label} round {round}");
        }

        let tables = orch.store().tables().await.unwrap();
        assert_eq!(tables.len(), 6);
        for t in &tables {
            assert_eq!(t.row_count, 1500 * round, "{} round {round}", t.name);
        }
    }
}
