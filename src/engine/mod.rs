//! Job execution engine.
//!
//! ## Overview
//!
//! A ticket that becomes ready is turned into a `pending` job and a
//! `job-process` message carrying an immutable `JobSpec` snapshot. A worker
//! claims the message, provisions a sandbox, and runs the execution loop:
//! prompt the agent, stream and persist its output, parse control signals,
//! and transition the job. Pauses for a human return from the loop; the
//! answer arrives later as its own message and the loop is resumed, live or
//! rebuilt from the database.
//!
//! ## Module Map
//!
//! ```text
//!  dispatch.rs ──send──> queue.rs (SQLite topics, leases, retries)
//!                             │ Delivery
//!                             v
//!                        worker.rs (topic handlers, orphan rules)
//!                             │            │ live abort / answers
//!                             │            v
//!                             │       registry.rs (DashMap of live loops)
//!                             v
//!                        execution.rs (ExecutionLoop, one job)
//!                         │      │        │
//!              prompt.rs ─┘      │        └─ providers.rs (tracker calls)
//!                                v
//!               executor.rs (AgentRunner) ── sandbox.rs (clone + branch)
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                              |
//! |-----------|-------------------------------------------------------------|
//! | `models`  | Row types: `Project`, `Ticket`, `Job`, `JobLog`             |
//! | `db`      | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)         |

pub mod db;
pub mod dispatch;
pub mod execution;
pub mod executor;
pub mod models;
pub mod prompt;
pub mod providers;
pub mod queue;
pub mod registry;
pub mod sandbox;
pub mod worker;

pub use db::{DbHandle, EngineDb};
pub use dispatch::{Dispatcher, RecoveryReport};
pub use execution::{ExecutionLoop, LoopContext, LoopOutcome, LoopSettings};
pub use executor::{AgentRunner, ProcessExecutor};
pub use queue::{Queue, QueueConfig};
pub use worker::Worker;
