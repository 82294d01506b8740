// src/bin/ingest_once.rs
//! One ingest run over the configured sources; prints the report as JSON.

use anyhow::{Context, Result};
use tabular_ingest::ingest::config::load_sources_default;
use tabular_ingest::{logging, Orchestrator, Settings};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    logging::init_tracing();

    let settings = Settings::from_env()?;
    let sources = load_sources_default()?;
    let orchestrator = Orchestrator::from_settings(&settings)?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            on_ctrl_c.cancel();
        }
    });

    let report = orchestrator.run_with_cancel(sources, cancel).await?;
    let out = serde_json::to_string_pretty(&report).context("encoding report")?;
    println!("{out}");
    Ok(())
}
