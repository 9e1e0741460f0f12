//! Durable, SQLite-backed work queue with named topics.
//!
//! Messages move `created → active → completed | failed`. A claim stamps a
//! lease on the message; a heartbeat keeps extending it while the handler
//! runs, so a message is only redelivered when its worker died. Handler
//! errors and panics put the message back with exponential backoff until
//! `max_attempts` is reached. Delivery is at-least-once.

use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::db::{DbHandle, open_connection};
use crate::config::QueueSettings;
use crate::errors::QueueError;
use crate::util::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Created,
    Active,
    Completed,
    Failed,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for MessageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid message state: {}", s)),
        }
    }
}

/// A stored queue message.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: String,
    pub topic: String,
    pub job_id: Option<String>,
    pub payload: serde_json::Value,
    pub state: MessageState,
    pub attempts: u32,
    pub locked_by: Option<String>,
    pub locked_until: Option<i64>,
    pub last_error: Option<String>,
}

/// One delivery of a message to a handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    /// 1 on first delivery.
    pub attempt: u32,
}

impl Delivery {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| QueueError::Payload {
            topic: self.topic.clone(),
            source,
        })
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

pub struct QueueDb {
    conn: Connection,
}

impl QueueDb {
    pub fn new(path: &Path) -> Result<Self> {
        let db = Self {
            conn: open_connection(path)?,
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory queue database")?;
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS queue_topics (
                    name TEXT PRIMARY KEY,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS queue_messages (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    topic TEXT NOT NULL REFERENCES queue_topics(name),
                    job_id TEXT,
                    payload TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'created',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    locked_by TEXT,
                    locked_until INTEGER,
                    available_at INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    completed_at INTEGER,
                    last_error TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_queue_messages_claim
                    ON queue_messages(topic, state, available_at);
                CREATE INDEX IF NOT EXISTS idx_queue_messages_job
                    ON queue_messages(job_id, state);
                ",
            )
            .context("Failed to create queue tables")?;
        Ok(())
    }

    pub fn declare_topic(&self, name: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO queue_topics (name, created_at) VALUES (?1, ?2)",
                params![name, now_millis()],
            )
            .context("Failed to declare topic")?;
        Ok(())
    }

    pub fn topic_exists(&self, name: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM queue_topics WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up topic")?;
        Ok(found.is_some())
    }

    pub fn insert_message(
        &self,
        topic: &str,
        job_id: Option<&str>,
        payload: &str,
        now: i64,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO queue_messages (id, topic, job_id, payload, available_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, topic, job_id, payload, now],
            )
            .context("Failed to insert queue message")?;
        Ok(id)
    }

    /// Atomically lease the next deliverable message on `topic`: a fresh one
    /// whose backoff has elapsed, or an active one whose lease expired and
    /// still has attempts left.
    pub fn claim_next(
        &self,
        topic: &str,
        worker_id: &str,
        now: i64,
        lease_ms: i64,
        max_attempts: u32,
    ) -> Result<Option<QueueMessage>> {
        let sql = format!(
            "UPDATE queue_messages
             SET state = 'active', attempts = attempts + 1, locked_by = ?1, locked_until = ?2
             WHERE seq = (
                 SELECT seq FROM queue_messages
                 WHERE topic = ?3
                   AND ((state = 'created' AND available_at <= ?4)
                        OR (state = 'active' AND locked_until < ?4 AND attempts < ?5))
                 ORDER BY available_at, seq
                 LIMIT 1
             )
             RETURNING {}",
            MESSAGE_COLUMNS
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![worker_id, now + lease_ms, topic, now, max_attempts],
                MessageRow::from_row,
            )
            .optional()
            .context("Failed to claim queue message")?;
        row.map(MessageRow::into_message).transpose()
    }

    /// Push the lease forward. Returns false if the message is no longer ours.
    pub fn extend_lease(&self, id: &str, worker_id: &str, locked_until: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE queue_messages SET locked_until = ?1
                 WHERE id = ?2 AND locked_by = ?3 AND state = 'active'",
                params![locked_until, id, worker_id],
            )
            .context("Failed to extend lease")?;
        Ok(changed > 0)
    }

    pub fn complete(&self, id: &str, now: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE queue_messages
                 SET state = 'completed', completed_at = ?1, locked_by = NULL, locked_until = NULL
                 WHERE id = ?2",
                params![now, id],
            )
            .context("Failed to complete queue message")?;
        Ok(())
    }

    pub fn release_for_retry(&self, id: &str, error: &str, available_at: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE queue_messages
                 SET state = 'created', available_at = ?1, last_error = ?2,
                     locked_by = NULL, locked_until = NULL
                 WHERE id = ?3",
                params![available_at, error, id],
            )
            .context("Failed to release queue message")?;
        Ok(())
    }

    pub fn fail(&self, id: &str, error: &str, now: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE queue_messages
                 SET state = 'failed', completed_at = ?1, last_error = ?2,
                     locked_by = NULL, locked_until = NULL
                 WHERE id = ?3",
                params![now, error, id],
            )
            .context("Failed to fail queue message")?;
        Ok(())
    }

    /// Fail active messages whose lease expired after their last attempt.
    pub fn sweep_exhausted(&self, now: i64, max_attempts: u32) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE queue_messages
                 SET state = 'failed', completed_at = ?1,
                     last_error = 'lease expired after final attempt',
                     locked_by = NULL, locked_until = NULL
                 WHERE state = 'active' AND locked_until < ?1 AND attempts >= ?2",
                params![now, max_attempts],
            )
            .context("Failed to sweep exhausted messages")
    }

    /// Whether a job has an undelivered or in-progress message, optionally
    /// restricted to one topic.
    pub fn has_in_flight(&self, job_id: &str, topic: Option<&str>) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM queue_messages
                 WHERE job_id = ?1 AND state IN ('created', 'active')
                   AND (?2 IS NULL OR topic = ?2)
                 LIMIT 1",
                params![job_id, topic],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query in-flight messages")?;
        Ok(found.is_some())
    }

    /// Whether some handler other than `except_id` currently holds an
    /// unexpired lease on a message for this job.
    pub fn has_live_lease(&self, job_id: &str, except_id: &str, now: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM queue_messages
                 WHERE job_id = ?1 AND id != ?2 AND state = 'active' AND locked_until >= ?3
                 LIMIT 1",
                params![job_id, except_id, now],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query message leases")?;
        Ok(found.is_some())
    }

    pub fn get_message(&self, id: &str) -> Result<Option<QueueMessage>> {
        let sql = format!("SELECT {} FROM queue_messages WHERE id = ?1", MESSAGE_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], MessageRow::from_row)
            .optional()
            .context("Failed to query queue message")?;
        row.map(MessageRow::into_message).transpose()
    }

    pub fn count(&self, topic: &str, state: MessageState) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM queue_messages WHERE topic = ?1 AND state = ?2",
                params![topic, state.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count queue messages")
    }
}

const MESSAGE_COLUMNS: &str =
    "id, topic, job_id, payload, state, attempts, locked_by, locked_until, last_error";

struct MessageRow {
    id: String,
    topic: String,
    job_id: Option<String>,
    payload: String,
    state: String,
    attempts: u32,
    locked_by: Option<String>,
    locked_until: Option<i64>,
    last_error: Option<String>,
}

impl MessageRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            topic: row.get(1)?,
            job_id: row.get(2)?,
            payload: row.get(3)?,
            state: row.get(4)?,
            attempts: row.get(5)?,
            locked_by: row.get(6)?,
            locked_until: row.get(7)?,
            last_error: row.get(8)?,
        })
    }

    fn into_message(self) -> Result<QueueMessage> {
        let state = MessageState::from_str(&self.state)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse message state")?;
        let payload =
            serde_json::from_str(&self.payload).context("Failed to parse message payload")?;
        Ok(QueueMessage {
            id: self.id,
            topic: self.topic,
            job_id: self.job_id,
            payload,
            state,
            attempts: self.attempts,
            locked_by: self.locked_by,
            locked_until: self.locked_until,
            last_error: self.last_error,
        })
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl QueueConfig {
    pub fn from_settings(settings: &QueueSettings, worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            lease: Duration::from_secs(settings.lease_secs),
            max_attempts: settings.max_attempts,
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
        }
    }

    fn lease_ms(&self) -> i64 {
        self.lease.as_millis() as i64
    }

    fn backoff_ms(&self, attempt: u32) -> i64 {
        let factor = 1i64 << attempt.saturating_sub(1).min(10);
        self.retry_backoff.as_millis() as i64 * factor
    }
}

pub struct Queue {
    db: DbHandle<QueueDb>,
    config: QueueConfig,
    running: AtomicBool,
    shutdown: std::sync::Mutex<CancellationToken>,
    pollers: tokio::sync::Mutex<JoinSet<()>>,
    wake: Arc<Notify>,
}

impl Queue {
    pub fn new(db: QueueDb, config: QueueConfig) -> Self {
        Self {
            db: DbHandle::new(db),
            config,
            running: AtomicBool::new(false),
            shutdown: std::sync::Mutex::new(CancellationToken::new()),
            pollers: tokio::sync::Mutex::new(JoinSet::new()),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn open(path: &Path, config: QueueConfig) -> Result<Self> {
        Ok(Self::new(QueueDb::new(path)?, config))
    }

    pub fn db(&self) -> &DbHandle<QueueDb> {
        &self.db
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Begin accepting subscriptions. Idempotent.
    pub async fn start(&self) -> Result<(), QueueError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut token = self
                .shutdown
                .lock()
                .map_err(|e| QueueError::Database(anyhow::anyhow!("shutdown lock poisoned: {}", e)))?;
            *token = CancellationToken::new();
        }
        let max_attempts = self.config.max_attempts;
        let swept = self
            .db
            .call(move |q| q.sweep_exhausted(now_millis(), max_attempts))
            .await
            .map_err(QueueError::Database)?;
        if swept > 0 {
            warn!(count = swept, "Failed queue messages whose final lease expired");
        }
        info!(worker_id = %self.config.worker_id, "Queue started");
        Ok(())
    }

    /// Stop all pollers and wait for in-progress handlers to return.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(token) = self.shutdown.lock() {
            token.cancel();
        }
        let mut pollers = self.pollers.lock().await;
        while let Some(result) = pollers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Queue poller ended abnormally");
            }
        }
        info!("Queue stopped");
    }

    pub async fn declare_topic(&self, name: &str) -> Result<(), QueueError> {
        let name = name.to_string();
        self.db
            .call(move |q| q.declare_topic(&name))
            .await
            .map_err(QueueError::Database)
    }

    /// Persist a message and return its id. The payload's `jobId` (or
    /// `spec.jobId`) becomes the message's job key for in-flight lookups.
    pub async fn send<T: Serialize>(&self, topic: &str, payload: &T) -> Result<String, QueueError> {
        let value = serde_json::to_value(payload).map_err(|source| QueueError::Payload {
            topic: topic.to_string(),
            source,
        })?;
        let job_id = job_key(&value);
        let body = value.to_string();
        let topic_owned = topic.to_string();
        let id = self
            .db
            .call(move |q| {
                if !q.topic_exists(&topic_owned)? {
                    return Err(QueueError::UnknownTopic(topic_owned).into());
                }
                q.insert_message(&topic_owned, job_id.as_deref(), &body, now_millis())
            })
            .await
            .map_err(|e| match e.downcast::<QueueError>() {
                Ok(queue_err) => queue_err,
                Err(other) => QueueError::Database(other),
            })?;
        debug!(topic, message_id = %id, "Message enqueued");
        self.wake.notify_waiters();
        Ok(id)
    }

    /// Run `concurrency` pollers on `topic`, each invoking `handler` once per
    /// delivered message.
    pub async fn subscribe<F, Fut>(
        &self,
        topic: &str,
        concurrency: usize,
        handler: F,
    ) -> Result<(), QueueError>
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if !self.is_running() {
            return Err(QueueError::NotStarted);
        }
        let topic_owned = topic.to_string();
        let exists = self
            .db
            .call(move |q| q.topic_exists(&topic_owned))
            .await
            .map_err(QueueError::Database)?;
        if !exists {
            return Err(QueueError::UnknownTopic(topic.to_string()));
        }

        let token = self
            .shutdown
            .lock()
            .map_err(|e| QueueError::Database(anyhow::anyhow!("shutdown lock poisoned: {}", e)))?
            .clone();
        let handler = Arc::new(handler);
        let mut pollers = self.pollers.lock().await;
        for slot in 0..concurrency.max(1) {
            let poller = Poller {
                db: self.db.clone(),
                config: self.config.clone(),
                topic: topic.to_string(),
                token: token.clone(),
                wake: self.wake.clone(),
            };
            let handler = handler.clone();
            pollers.spawn(async move { poller.run(slot, handler).await });
        }
        info!(topic, concurrency, "Subscribed");
        Ok(())
    }

    pub async fn has_in_flight(&self, job_id: &str, topic: Option<&str>) -> Result<bool, QueueError> {
        let job_id = job_id.to_string();
        let topic = topic.map(str::to_string);
        self.db
            .call(move |q| q.has_in_flight(&job_id, topic.as_deref()))
            .await
            .map_err(QueueError::Database)
    }

    pub async fn has_live_lease(&self, job_id: &str, except_id: &str) -> Result<bool, QueueError> {
        let job_id = job_id.to_string();
        let except_id = except_id.to_string();
        self.db
            .call(move |q| q.has_live_lease(&job_id, &except_id, now_millis()))
            .await
            .map_err(QueueError::Database)
    }

    pub async fn sweep_exhausted(&self) -> Result<usize, QueueError> {
        let max_attempts = self.config.max_attempts;
        self.db
            .call(move |q| q.sweep_exhausted(now_millis(), max_attempts))
            .await
            .map_err(QueueError::Database)
    }
}

fn job_key(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("jobId")
        .or_else(|| payload.get("spec").and_then(|s| s.get("jobId")))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

struct Poller {
    db: DbHandle<QueueDb>,
    config: QueueConfig,
    topic: String,
    token: CancellationToken,
    wake: Arc<Notify>,
}

impl Poller {
    async fn run<F, Fut>(self, slot: usize, handler: Arc<F>)
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        debug!(topic = %self.topic, slot, "Poller started");
        while !self.token.is_cancelled() {
            let topic = self.topic.clone();
            let worker_id = self.config.worker_id.clone();
            let lease_ms = self.config.lease_ms();
            let max_attempts = self.config.max_attempts;
            let claimed = self
                .db
                .call(move |q| q.claim_next(&topic, &worker_id, now_millis(), lease_ms, max_attempts))
                .await;
            match claimed {
                Ok(Some(message)) => self.deliver(message, handler.as_ref()).await,
                Ok(None) => {
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(topic = %self.topic, error = %format!("{:#}", e), "Failed to claim message");
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
        debug!(topic = %self.topic, slot, "Poller stopped");
    }

    async fn deliver<F, Fut>(&self, message: QueueMessage, handler: &F)
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let message_id = message.id.clone();
        let attempt = message.attempts;
        let delivery = Delivery {
            id: message.id,
            topic: message.topic,
            payload: message.payload,
            attempt,
        };
        debug!(topic = %self.topic, message_id = %message_id, attempt, "Delivering message");

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat(
            self.db.clone(),
            message_id.clone(),
            self.config.clone(),
            heartbeat_stop.clone(),
        ));

        // Spawned so a panicking handler is contained to this delivery.
        let outcome = tokio::spawn(handler(delivery)).await;
        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(join_err) => Some(format!("handler panicked: {}", join_err)),
        };

        let id = message_id.clone();
        let now = now_millis();
        let result = match failure {
            None => self.db.call(move |q| q.complete(&id, now)).await,
            Some(error) if attempt >= self.config.max_attempts => {
                error!(topic = %self.topic, message_id = %message_id, attempt, error = %error, "Message failed permanently");
                self.db.call(move |q| q.fail(&id, &error, now)).await
            }
            Some(error) => {
                let available_at = now + self.config.backoff_ms(attempt);
                warn!(topic = %self.topic, message_id = %message_id, attempt, error = %error, "Message handler failed, will retry");
                self.db
                    .call(move |q| q.release_for_retry(&id, &error, available_at))
                    .await
            }
        };
        if let Err(e) = result {
            error!(message_id = %message_id, error = %format!("{:#}", e), "Failed to settle message");
        }
    }
}

async fn heartbeat(
    db: DbHandle<QueueDb>,
    message_id: String,
    config: QueueConfig,
    stop: CancellationToken,
) {
    let period = (config.lease / 3).max(Duration::from_millis(10));
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
        let id = message_id.clone();
        let worker_id = config.worker_id.clone();
        let until = now_millis() + config.lease_ms();
        match db.call(move |q| q.extend_lease(&id, &worker_id, until)).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(message_id = %message_id, "Lease lost while handler still running");
                return;
            }
            Err(e) => error!(message_id = %message_id, error = %format!("{:#}", e), "Failed to extend lease"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> QueueConfig {
        QueueConfig {
            worker_id: "worker-test".to_string(),
            poll_interval: Duration::from_millis(20),
            lease: Duration::from_secs(30),
            max_attempts: 2,
            retry_backoff: Duration::from_millis(10),
        }
    }

    fn test_queue() -> Queue {
        Queue::new(QueueDb::new_in_memory().unwrap(), test_config())
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_claim_marks_active_and_counts_attempt() -> Result<()> {
        let db = QueueDb::new_in_memory()?;
        db.declare_topic("t")?;
        let id = db.insert_message("t", Some("job-1"), r#"{"jobId":"job-1"}"#, 1_000)?;
        let claimed = db.claim_next("t", "w1", 1_000, 500, 3)?.expect("message");
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.state, MessageState::Active);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.locked_until, Some(1_500));
        assert!(db.claim_next("t", "w2", 1_100, 500, 3)?.is_none());
        Ok(())
    }

    #[test]
    fn test_expired_lease_is_redelivered() -> Result<()> {
        let db = QueueDb::new_in_memory()?;
        db.declare_topic("t")?;
        db.insert_message("t", None, "{}", 1_000)?;
        db.claim_next("t", "w1", 1_000, 500, 3)?.expect("first claim");
        let again = db.claim_next("t", "w2", 2_000, 500, 3)?.expect("redelivery");
        assert_eq!(again.attempts, 2);
        assert_eq!(again.locked_by.as_deref(), Some("w2"));
        Ok(())
    }

    #[test]
    fn test_exhausted_lease_is_swept_not_redelivered() -> Result<()> {
        let db = QueueDb::new_in_memory()?;
        db.declare_topic("t")?;
        let id = db.insert_message("t", None, "{}", 1_000)?;
        db.claim_next("t", "w1", 1_000, 500, 1)?.expect("claim");
        assert!(db.claim_next("t", "w2", 2_000, 500, 1)?.is_none());
        assert_eq!(db.sweep_exhausted(2_000, 1)?, 1);
        assert_eq!(db.get_message(&id)?.unwrap().state, MessageState::Failed);
        Ok(())
    }

    #[test]
    fn test_backoff_delays_redelivery() -> Result<()> {
        let db = QueueDb::new_in_memory()?;
        db.declare_topic("t")?;
        let id = db.insert_message("t", None, "{}", 1_000)?;
        db.claim_next("t", "w1", 1_000, 500, 3)?.expect("claim");
        db.release_for_retry(&id, "boom", 5_000)?;
        assert!(db.claim_next("t", "w1", 4_999, 500, 3)?.is_none());
        assert!(db.claim_next("t", "w1", 5_000, 500, 3)?.is_some());
        Ok(())
    }

    #[test]
    fn test_messages_claimed_in_fifo_order() -> Result<()> {
        let db = QueueDb::new_in_memory()?;
        db.declare_topic("t")?;
        let first = db.insert_message("t", None, "1", 1_000)?;
        let second = db.insert_message("t", None, "2", 1_000)?;
        assert_eq!(db.claim_next("t", "w", 1_000, 500, 3)?.unwrap().id, first);
        assert_eq!(db.claim_next("t", "w", 1_000, 500, 3)?.unwrap().id, second);
        Ok(())
    }

    #[test]
    fn test_has_in_flight_by_job_and_topic() -> Result<()> {
        let db = QueueDb::new_in_memory()?;
        db.declare_topic("a")?;
        db.declare_topic("b")?;
        let id = db.insert_message("a", Some("job-1"), "{}", 1_000)?;
        assert!(db.has_in_flight("job-1", None)?);
        assert!(db.has_in_flight("job-1", Some("a"))?);
        assert!(!db.has_in_flight("job-1", Some("b"))?);
        db.complete(&id, 1_001)?;
        assert!(!db.has_in_flight("job-1", None)?);
        Ok(())
    }

    #[test]
    fn test_live_lease_excludes_own_message() -> Result<()> {
        let db = QueueDb::new_in_memory()?;
        db.declare_topic("t")?;
        let own = db.insert_message("t", Some("job-1"), "{}", 1_000)?;
        db.claim_next("t", "w", 1_000, 500, 3)?.expect("claim");
        assert!(!db.has_live_lease("job-1", &own, 1_100)?);
        let other = db.insert_message("t", Some("job-1"), "{}", 1_000)?;
        db.claim_next("t", "w", 1_000, 500, 3)?.expect("claim");
        assert!(db.has_live_lease("job-1", &own, 1_100)?);
        assert!(!db.has_live_lease("job-1", &own, 2_000)?);
        assert!(db.has_live_lease("job-1", &other, 1_100)?);
        Ok(())
    }

    #[tokio::test]
    async fn test_send_to_undeclared_topic_fails() {
        let queue = test_queue();
        let err = queue
            .send("nope", &serde_json::json!({"jobId": "j"}))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownTopic(t) if t == "nope"));
    }

    #[tokio::test]
    async fn test_subscribe_requires_start() {
        let queue = test_queue();
        queue.declare_topic("t").await.unwrap();
        let err = queue
            .subscribe("t", 1, |_d| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotStarted));
    }

    #[tokio::test]
    async fn test_send_records_job_key() {
        let queue = test_queue();
        queue.declare_topic("t").await.unwrap();
        queue
            .send("t", &serde_json::json!({"spec": {"jobId": "job-7"}}))
            .await
            .unwrap();
        assert!(queue.has_in_flight("job-7", Some("t")).await.unwrap());
    }

    #[tokio::test]
    async fn test_delivered_message_completes() {
        let queue = test_queue();
        queue.declare_topic("t").await.unwrap();
        queue.start().await.unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_handler = seen.clone();
        queue
            .subscribe("t", 2, move |delivery| {
                let seen = seen_handler.clone();
                async move {
                    assert_eq!(delivery.payload["jobId"], "job-1");
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();
        let id = queue
            .send("t", &serde_json::json!({"jobId": "job-1"}))
            .await
            .unwrap();

        wait_until(|| seen.load(Ordering::SeqCst) == 1).await;
        queue.stop().await;
        let message = queue.db().lock_sync().unwrap().get_message(&id).unwrap().unwrap();
        assert_eq!(message.state, MessageState::Completed);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_retries_then_fails() {
        let queue = test_queue();
        queue.declare_topic("t").await.unwrap();
        queue.start().await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_handler = calls.clone();
        queue
            .subscribe("t", 1, move |_delivery| {
                let calls = calls_handler.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("handler exploded")
                }
            })
            .await
            .unwrap();
        let id = queue.send("t", &serde_json::json!({})).await.unwrap();

        let db = queue.db().clone();
        let id_check = id.clone();
        wait_until(move || {
            db.lock_sync()
                .unwrap()
                .get_message(&id_check)
                .unwrap()
                .map(|m| m.state == MessageState::Failed)
                .unwrap_or(false)
        })
        .await;
        queue.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let message = queue.db().lock_sync().unwrap().get_message(&id).unwrap().unwrap();
        assert_eq!(message.attempts, 2);
        assert!(message.last_error.unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_kill_poller() {
        let queue = test_queue();
        queue.declare_topic("t").await.unwrap();
        queue.start().await.unwrap();
        let ok = Arc::new(AtomicUsize::new(0));
        let ok_handler = ok.clone();
        queue
            .subscribe("t", 1, move |delivery| {
                let ok = ok_handler.clone();
                async move {
                    if delivery.payload["panic"] == true {
                        panic!("bad payload");
                    }
                    ok.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();
        queue.send("t", &serde_json::json!({"panic": true})).await.unwrap();
        queue.send("t", &serde_json::json!({"panic": false})).await.unwrap();

        wait_until(|| ok.load(Ordering::SeqCst) == 1).await;
        queue.stop().await;
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let config = test_config();
        assert_eq!(config.backoff_ms(1), 10);
        assert_eq!(config.backoff_ms(2), 20);
        assert_eq!(config.backoff_ms(3), 40);
    }
}
