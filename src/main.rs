//! Tabular ingest service: binary entrypoint.
//! Boots the Axum HTTP server with the ingest pipeline wired in.
//!
//! See `README.md` for configuration.

use shuttle_axum::ShuttleAxum;

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    tabular_ingest::logging::init_tracing();

    let settings = tabular_ingest::Settings::from_env()?;
    let router = tabular_ingest::app(settings).await?;

    Ok(router.into())
}
