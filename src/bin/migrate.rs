//! Applies the configured backend's schema. For the pooled backend this runs
//! the embedded diesel migrations under an advisory lock; for the embedded
//! backend, schema initialization is a cheap no-op (sled has no DDL). Run
//! this once before pointing a harness at a fresh database.

use arena_telemetry::ArenaConfig;
use log::info;
use miette::IntoDiagnostic;

#[tokio::main]
async fn main() -> miette::Result<()> {
    env_logger::init();

    let config = ArenaConfig::config().into_diagnostic()?;
    let backend = config.build_backend();

    backend.connect().await.into_diagnostic()?;
    backend.initialize_schema().await.into_diagnostic()?;

    info!("schema is up to date");
    backend.disconnect().await.into_diagnostic()?;
    Ok(())
}
