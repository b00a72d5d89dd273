mod acquisition;
mod analysis;
mod broker_registry;
mod candidates;
mod candle;
mod candle_store;
mod config;
mod error;
mod error_sink;
mod extrema;
mod report;
mod scheduler;
mod session;
mod storage_utils;
mod terminal;
mod tick_metadata;

use anyhow::Context;
use config::RunConfig;
use session::SessionGate;
use std::sync::Arc;
use std::time::Duration;
use storage_utils::AsyncStorageManager;
use terminal::{HttpTerminalFactory, TerminalFactory};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let storage = AsyncStorageManager::from_env_or_relative().await?;
    info!(storage = %storage.base_dir.display(), "storage ready");

    // Configuration problems abort before any terminal is touched.
    let run = match RunConfig::load(&storage).await {
        Ok(run) => run,
        Err(e) => {
            error!(kind = e.kind(), "{e}");
            return Err(e.into());
        }
    };

    let factory: Arc<dyn TerminalFactory> = Arc::new(
        HttpTerminalFactory::new(run.app.terminal_bridge_url.as_str())
            .context("building terminal bridge client")?,
    );
    let mut gate = SessionGate::new(
        factory.create(),
        Duration::from_millis(run.app.connect_timeout_ms),
    );

    let summary = analysis::run_analysis_pipeline(&run, &storage, factory, &mut gate).await;
    // No session outlives the run, whatever the pipeline left behind.
    gate.force_release().await;

    report::print_summary(&summary);
    Ok(())
}
