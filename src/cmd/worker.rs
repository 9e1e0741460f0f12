//! `ticketsmith init` and `ticketsmith worker`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use super::open_stores;
use ticketsmith::config::Config;
use ticketsmith::engine::providers::ProviderRegistry;
use ticketsmith::engine::sandbox::SandboxManager;
use ticketsmith::engine::{LoopContext, LoopSettings, ProcessExecutor, Worker};

pub async fn cmd_init(config: &Config) -> Result<()> {
    open_stores(config).await?;
    println!(
        "Database initialized at {}",
        config.database_path.display()
    );
    Ok(())
}

/// Run until Ctrl-C, then hand live jobs back to the queue.
pub async fn cmd_worker(config: &Config) -> Result<()> {
    let (db, queue) = open_stores(config).await?;
    let ctx = LoopContext {
        db,
        runner: Arc::new(ProcessExecutor::new(config.agent.clone())),
        sandbox: Arc::new(SandboxManager::new(config.sandbox.clone())),
        providers: Arc::new(ProviderRegistry::new()),
        settings: LoopSettings::new(&config.worker, &config.agent),
    };
    let worker = Worker::new(
        ctx,
        queue,
        config.sandbox.base_path.to_string_lossy(),
        config.worker.concurrency,
    );

    let report = worker.start().await?;
    println!(
        "Worker {} running ({} handlers per topic); recovered {} released, {} requeued. Ctrl-C to stop.",
        config.worker.worker_id, config.worker.concurrency, report.released, report.requeued
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    worker.stop().await;
    Ok(())
}
