// src/ingest/mod.rs
pub mod config;
pub mod fetcher;
pub mod limiter;
pub mod normalize;
pub mod report;
pub mod scheduler;
pub mod sqlite;
pub mod store;
pub mod types;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::settings::Settings;
use crate::ingest::fetcher::{Backoff, HttpFetcher, SourceFetcher};
use crate::ingest::limiter::RunContext;
use crate::ingest::normalize::Normalizer;
use crate::ingest::report::{ProcessingReport, SourceReport, SourceState};
use crate::ingest::sqlite::SqliteStore;
use crate::ingest::store::{StorageWriter, StoreError, TableStore};
use crate::ingest::types::{FetchOutcome, SourceDescriptor};

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("api_fetch_total", "Fetch attempts by source and status.");
        describe_histogram!(
            "api_fetch_duration_seconds",
            "Wall time of a whole fetch, retries included."
        );
        describe_histogram!(
            "transform_processing_seconds",
            "Time spent normalizing one payload."
        );
        describe_histogram!(
            "storage_processing_seconds",
            "Time spent persisting one source's records."
        );
        describe_counter!("rows_processed_total", "Rows persisted per source.");
        describe_counter!("ingest_runs_total", "Scheduled ingest runs started.");
        describe_gauge!(
            "ingest_pipeline_last_run_ts",
            "Unix ts when the ingest pipeline last finished."
        );
    });
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("storage could not be prepared: {0}")]
    Prepare(#[source] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Concurrent fetches allowed per run.
    pub rate_limit: usize,
    /// Transform+store workers.
    pub workers: usize,
    /// Budget for one transform+store unit.
    pub unit_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            rate_limit: 10,
            workers: 4,
            unit_timeout: Duration::from_secs(300),
        }
    }
}

/// Fetched payload waiting for the transform+store pool.
struct WorkUnit {
    source: Arc<SourceDescriptor>,
    payload: Value,
}

type Completion = (String, SourceReport);

/// Drives a batch: fetch all sources, then normalize and store each payload.
///
/// Fetches share one cooperative task and a per-run [`RateLimiter`](limiter::RateLimiter).
/// Fetched payloads are queued for a fixed pool of workers. A source that fails at any
/// stage is reported with zero rows and never affects its siblings.
pub struct Orchestrator {
    fetcher: Arc<dyn SourceFetcher>,
    normalizer: Arc<Normalizer>,
    writer: Arc<StorageWriter>,
    settings: PipelineSettings,
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        normalizer: Arc<Normalizer>,
        writer: Arc<StorageWriter>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            fetcher,
            normalizer,
            writer,
            settings,
        }
    }

    /// Wire the HTTP fetcher and the SQLite store from application settings.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        use anyhow::Context;

        let fetcher = HttpFetcher::new(Backoff::new(settings.backoff_base, settings.backoff_max))
            .context("building http client")?;
        let store = SqliteStore::connect_lazy(&settings.database_url, settings.db_pool_size)
            .with_context(|| format!("configuring store at {}", settings.database_url))?;
        let writer = StorageWriter::with_chunk_size(Arc::new(store), settings.chunk_size);

        Ok(Self::new(
            Arc::new(fetcher),
            Arc::new(Normalizer::default()),
            Arc::new(writer),
            settings.pipeline(),
        ))
    }

    pub fn settings(&self) -> PipelineSettings {
        self.settings
    }

    pub fn store(&self) -> Arc<dyn TableStore> {
        self.writer.store_handle()
    }

    pub async fn run(&self, sources: Vec<SourceDescriptor>) -> Result<ProcessingReport, PipelineError> {
        self.run_with_cancel(sources, CancellationToken::new()).await
    }

    /// Cancelling `cancel` fails every unfinished source instead of leaving it out.
    pub async fn run_with_cancel(
        &self,
        sources: Vec<SourceDescriptor>,
        cancel: CancellationToken,
    ) -> Result<ProcessingReport, PipelineError> {
        ensure_metrics_described();
        let t0 = Instant::now();
        tracing::info!(sources = sources.len(), "starting ingest run");

        // Must exist before any writer touches it.
        self.store().prepare().await.map_err(PipelineError::Prepare)?;

        let ctx = RunContext::new(self.settings.rate_limit, cancel);
        let sources: Vec<Arc<SourceDescriptor>> = sources.into_iter().map(Arc::new).collect();
        let mut report = ProcessingReport::default();

        let (unit_tx, unit_rx) = mpsc::unbounded_channel::<WorkUnit>();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let queue = Arc::new(Mutex::new(unit_rx));
        let workers: Vec<_> = (0..self.settings.workers.max(1))
            .map(|id| {
                let worker = UnitWorker {
                    normalizer: self.normalizer.clone(),
                    writer: self.writer.clone(),
                    unit_timeout: self.settings.unit_timeout,
                };
                let (queue, done, ctx) = (queue.clone(), done_tx.clone(), ctx.clone());
                tokio::spawn(worker.drain(id, queue, done, ctx))
            })
            .collect();
        drop(done_tx);

        let mut fetches: FuturesUnordered<_> = sources
            .iter()
            .map(|source| {
                let (fetcher, ctx, source) = (self.fetcher.clone(), ctx.clone(), source.clone());
                async move {
                    transition(&source.label, SourceState::Pending, SourceState::Fetching);
                    fetcher.fetch(&ctx, source).await
                }
            })
            .collect();

        let mut unit_tx = Some(unit_tx);
        let mut fetching = true;
        let mut workers_alive = true;
        while fetching || workers_alive {
            tokio::select! {
                next = fetches.next(), if fetching => match next {
                    Some(outcome) => hand_off(outcome, unit_tx.as_ref(), &mut report),
                    None => {
                        fetching = false;
                        // Closing the queue lets idle workers exit once it drains.
                        unit_tx.take();
                    }
                },
                done = done_rx.recv(), if workers_alive => match done {
                    Some((label, result)) => report.record(label, result),
                    None => workers_alive = false,
                },
            }
        }

        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "ingest worker terminated abnormally");
            }
        }

        for source in &sources {
            if !report.contains(&source.label) {
                tracing::error!(source = %source.label, "no outcome recorded, marking as failed");
                report.record(source.label.clone(), SourceReport::failed(SourceState::TransformFailed));
            }
        }

        gauge!("ingest_pipeline_last_run_ts").set(chrono::Utc::now().timestamp() as f64);
        tracing::info!(
            sources = report.len(),
            failed = report.failures(),
            total_rows = report.total_rows(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "ingest run finished"
        );
        Ok(report)
    }
}

fn hand_off(
    outcome: FetchOutcome,
    queue: Option<&mpsc::UnboundedSender<WorkUnit>>,
    report: &mut ProcessingReport,
) {
    let label = outcome.source.label.clone();
    let Some(payload) = outcome.payload else {
        transition(&label, SourceState::Fetching, SourceState::FetchFailed);
        report.record(label, SourceReport::failed(SourceState::FetchFailed));
        return;
    };
    transition(&label, SourceState::Fetching, SourceState::Fetched);

    let unit = WorkUnit {
        source: outcome.source,
        payload,
    };
    let sent = queue.map(|q| q.send(unit).is_ok()).unwrap_or(false);
    if !sent {
        tracing::error!(source = %label, "worker pool unavailable");
        report.record(label, SourceReport::failed(SourceState::TransformFailed));
    }
}

fn transition(label: &str, from: SourceState, to: SourceState) {
    debug_assert!(from.can_advance_to(to), "{from:?} -> {to:?}");
    tracing::debug!(source = %label, ?from, ?to, "state");
}

/// Resolves when the run is cancelled or the unit's deadline passes.
async fn interrupted(ctx: &RunContext, deadline: Instant) -> &'static str {
    tokio::select! {
        _ = ctx.cancel.cancelled() => "cancelled",
        _ = tokio::time::sleep_until(deadline) => "timed out",
    }
}

#[derive(Clone)]
struct UnitWorker {
    normalizer: Arc<Normalizer>,
    writer: Arc<StorageWriter>,
    unit_timeout: Duration,
}

impl UnitWorker {
    async fn drain(
        self,
        id: usize,
        queue: Arc<Mutex<mpsc::UnboundedReceiver<WorkUnit>>>,
        done: mpsc::UnboundedSender<Completion>,
        ctx: RunContext,
    ) {
        loop {
            let unit = queue.lock().await.recv().await;
            let Some(unit) = unit else { break };
            let label = unit.source.label.clone();

            let result = AssertUnwindSafe(self.process(&ctx, unit))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    tracing::error!(source = %label, worker = id, "unit panicked");
                    SourceReport::failed(SourceState::StoreFailed)
                });
            if done.send((label, result)).is_err() {
                break;
            }
        }
        tracing::debug!(worker = id, "ingest worker idle, exiting");
    }

    async fn process(&self, ctx: &RunContext, unit: WorkUnit) -> SourceReport {
        let WorkUnit { source, payload } = unit;
        let label = source.label.clone();
        let deadline = Instant::now() + self.unit_timeout;

        if ctx.is_cancelled() {
            tracing::warn!(source = %label, "run cancelled before transform");
            return SourceReport::failed(SourceState::TransformFailed);
        }

        transition(&label, SourceState::Fetched, SourceState::Transforming);
        let t0 = Instant::now();
        let normalizer = self.normalizer.clone();
        let src = source.clone();
        let transform = tokio::task::spawn_blocking(move || normalizer.try_normalize(&payload, &src));

        let records = tokio::select! {
            biased;
            why = interrupted(ctx, deadline) => {
                tracing::warn!(source = %label, reason = why, "transform interrupted");
                return SourceReport::failed(SourceState::TransformFailed);
            }
            joined = transform => match joined {
                Ok(Ok(records)) => records,
                Ok(Err(e)) => {
                    tracing::error!(source = %label, url = %source.url, error = %e, "transform failed");
                    return SourceReport::failed(SourceState::TransformFailed);
                }
                Err(e) => {
                    tracing::error!(source = %label, error = %e, "transform task failed");
                    return SourceReport::failed(SourceState::TransformFailed);
                }
            },
        };
        histogram!("transform_processing_seconds", "api" => label.clone())
            .record(t0.elapsed().as_secs_f64());
        transition(&label, SourceState::Transforming, SourceState::Transformed);

        transition(&label, SourceState::Transformed, SourceState::Storing);
        let t1 = Instant::now();
        let stored = tokio::select! {
            biased;
            why = interrupted(ctx, deadline) => {
                tracing::warn!(source = %label, table = %source.table_name, reason = why, "storage interrupted");
                None
            }
            res = self.writer.store(&records, &source.table_name) => Some(res),
        };
        let elapsed = t1.elapsed().as_secs_f64();

        match stored {
            Some(Ok(rows)) => {
                histogram!("storage_processing_seconds", "api" => label.clone(), "status" => "success")
                    .record(elapsed);
                counter!("rows_processed_total", "api" => label.clone()).increment(rows);
                transition(&label, SourceState::Storing, SourceState::Stored);
                tracing::info!(source = %label, table = %source.table_name, rows, "source stored");
                SourceReport::stored(rows)
            }
            Some(Err(e)) => {
                histogram!("storage_processing_seconds", "api" => label.clone(), "status" => "error")
                    .record(elapsed);
                tracing::error!(source = %label, table = %source.table_name, error = %e, "storage failed");
                SourceReport::failed(SourceState::StoreFailed)
            }
            None => {
                histogram!("storage_processing_seconds", "api" => label, "status" => "error")
                    .record(elapsed);
                SourceReport::failed(SourceState::StoreFailed)
            }
        }
    }
}
