// src/bin/scheduler.rs
//! Standalone periodic ingest with a Prometheus endpoint on METRICS_PORT.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tabular_ingest::ingest::scheduler::{spawn_scheduler, IngestSchedulerCfg};
use tabular_ingest::metrics::Metrics;
use tabular_ingest::{logging, Orchestrator, Settings};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    logging::init_tracing();

    let settings = Settings::from_env()?;
    let metrics = Metrics::init()?;
    let orchestrator = Arc::new(Orchestrator::from_settings(&settings)?);
    let shutdown = CancellationToken::new();

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding metrics listener on {addr}"))?;
    let server_stop = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, metrics.router())
            .with_graceful_shutdown(async move { server_stop.cancelled().await })
            .await
    });
    tracing::info!(%addr, "metrics endpoint listening");

    let cfg = IngestSchedulerCfg::every_minutes(settings.schedule_interval_minutes);
    let scheduler = spawn_scheduler(cfg, orchestrator, shutdown.clone());
    tracing::info!(
        every_minutes = settings.schedule_interval_minutes,
        "scheduler started"
    );

    wait_for_signal().await;
    tracing::info!("shutting down scheduler");
    shutdown.cancel();

    if let Err(e) = scheduler.await {
        tracing::error!(error = %e, "scheduler task failed");
    }
    server
        .await
        .context("metrics server task")?
        .context("metrics server")?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
