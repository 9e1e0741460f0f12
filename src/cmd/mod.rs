//! CLI command implementations.
//!
//! | Module    | Commands handled                                      |
//! |-----------|-------------------------------------------------------|
//! | `worker`  | `Init`, `Worker`                                      |
//! | `jobs`    | `Dispatch`, `Jobs`                                    |

pub mod jobs;
pub mod worker;

pub use jobs::{cmd_dispatch, cmd_jobs};
pub use worker::{cmd_init, cmd_worker};

use std::sync::Arc;

use anyhow::{Context, Result};
use ticketsmith::config::Config;
use ticketsmith::engine::{DbHandle, EngineDb, Queue, QueueConfig};
use ticketsmith_common::topics;

/// Open the job store and the queue. Both live in the same SQLite file,
/// each on its own connection.
pub async fn open_stores(config: &Config) -> Result<(DbHandle, Arc<Queue>)> {
    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
    }
    let db = EngineDb::new(&config.database_path)?;
    let queue = Queue::open(
        &config.database_path,
        QueueConfig::from_settings(&config.queue, config.worker.worker_id.clone()),
    )?;
    for topic in topics::ALL {
        queue.declare_topic(topic).await?;
    }
    Ok((DbHandle::new(db), Arc::new(queue)))
}
