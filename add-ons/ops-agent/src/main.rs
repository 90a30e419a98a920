//! OPS Agent Worker
//!
//! Long-running process that accepts WebSocket rooms and runs one voice
//! session per room until CTRL-C.

use anyhow::Context;
use ops_voice::{Worker, WorkerConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[ops-agent] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = WorkerConfig::load().context("load worker config")?;
    config.resolve_credentials();

    tracing::info!(
        listen_addr = %config.listen_addr,
        backend = ?config.backend,
        language = %config.session.language,
        "OPS agent starting"
    );

    let worker = Worker::from_config(config).context("invalid worker config")?;
    let listener = worker.bind().await.context("bind listen address")?;

    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(worker.serve(listener, shutdown.clone()));

    tokio::signal::ctrl_c().await.context("listen for CTRL-C")?;
    tracing::info!("CTRL-C received; shutting down worker");
    shutdown.cancel();

    serving.await.context("worker task")??;
    tracing::info!("OPS agent stopped");
    Ok(())
}
