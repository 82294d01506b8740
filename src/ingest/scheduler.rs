// src/ingest/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ingest::{config::load_sources_default, Orchestrator};

#[derive(Clone, Copy, Debug)]
pub struct IngestSchedulerCfg {
    pub interval: Duration,
}

impl IngestSchedulerCfg {
    pub fn every_minutes(minutes: u64) -> Self {
        Self {
            interval: Duration::from_secs(minutes.max(1) * 60),
        }
    }
}

/// Spawn the periodic ingest loop. The first run starts immediately.
///
/// The source list is reloaded on every tick so edits to the config file apply without a
/// restart. Cancelling `shutdown` stops the loop and cancels an in-flight run.
pub fn spawn_scheduler(
    cfg: IngestSchedulerCfg,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            run_tick(&orchestrator, shutdown.child_token()).await;
        }
        tracing::info!(target: "ingest", "scheduler stopped");
    })
}

async fn run_tick(orchestrator: &Orchestrator, cancel: CancellationToken) {
    let sources = match load_sources_default() {
        Ok(s) if s.is_empty() => {
            tracing::error!(target: "ingest", "no sources configured, skipping run");
            return;
        }
        Ok(s) => s,
        Err(e) => {
            tracing::error!(target: "ingest", error = ?e, "loading sources failed, skipping run");
            return;
        }
    };

    counter!("ingest_runs_total").increment(1);
    match orchestrator.run_with_cancel(sources, cancel).await {
        Ok(report) => tracing::info!(
            target: "ingest",
            sources = report.len(),
            failed = report.failures(),
            total_rows = report.total_rows(),
            "scheduled ingest tick"
        ),
        Err(e) => tracing::error!(target: "ingest", error = %e, "scheduled ingest run failed"),
    }
}
