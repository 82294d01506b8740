// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod api;
pub mod config;
pub mod ingest;
pub mod logging;
pub mod metrics;

use std::sync::Arc;

use axum::Router;

pub use crate::api::{create_router, AppState};
pub use crate::config::Settings;
pub use crate::ingest::report::{ProcessingReport, SourceReport, SourceState};
pub use crate::ingest::types::{SourceDescriptor, SourceKind, SourceSpec};
pub use crate::ingest::{Orchestrator, PipelineError, PipelineSettings};

/// Assemble the HTTP app: metrics recorder, pipeline, router, and (optionally) the scheduler.
pub async fn app(settings: Settings) -> anyhow::Result<Router> {
    let metrics = metrics::Metrics::init()?;
    let orchestrator = Arc::new(Orchestrator::from_settings(&settings)?);

    if let Err(e) = orchestrator.store().prepare().await {
        tracing::warn!(error = %e, "database not ready at startup; runs will retry");
    }

    let state = AppState::new(orchestrator.clone(), settings.clone()).with_metrics(metrics);
    if settings.scheduler_enabled {
        let cfg = ingest::scheduler::IngestSchedulerCfg::every_minutes(
            settings.schedule_interval_minutes,
        );
        ingest::scheduler::spawn_scheduler(cfg, orchestrator, state.shutdown.clone());
        tracing::info!(
            every_minutes = settings.schedule_interval_minutes,
            "ingest scheduler enabled"
        );
    }
    Ok(create_router(state))
}
