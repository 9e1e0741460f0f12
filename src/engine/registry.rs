//! In-process registry of live execution loops, keyed by job id.
//!
//! The queue handlers use it to reach a running loop: cancel messages trip
//! its abort signal, and resume/permission answers are forwarded on its
//! command channel. An entry is removed when the loop's registration guard
//! drops, whichever way the loop ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use super::executor::{AbortReason, AbortSignal};

/// Input delivered to a live loop while it is paused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopCommand {
    Answer(String),
    Permission { approved: bool, command: String },
}

#[derive(Debug, Clone)]
pub struct LoopHandle {
    pub abort: AbortSignal,
    commands: mpsc::UnboundedSender<LoopCommand>,
    generation: u64,
}

impl LoopHandle {
    /// Forward a command. Returns it back if the loop no longer listens.
    pub fn send(&self, command: LoopCommand) -> Result<(), LoopCommand> {
        self.commands.send(command).map_err(|e| e.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    loops: Arc<DashMap<String, LoopHandle>>,
    generation: Arc<AtomicU64>,
}

/// Removes the registry entry on drop, unless it was since replaced.
#[derive(Debug)]
pub struct RegistrationGuard {
    loops: Arc<DashMap<String, LoopHandle>>,
    job_id: String,
    generation: u64,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        let generation = self.generation;
        if self
            .loops
            .remove_if(&self.job_id, |_, handle| handle.generation == generation)
            .is_some()
        {
            debug!(job_id = %self.job_id, "Loop unregistered");
        }
    }
}

pub struct Registration {
    pub guard: RegistrationGuard,
    pub abort: AbortSignal,
    pub commands: mpsc::UnboundedReceiver<LoopCommand>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loop for `job_id`, replacing any stale entry.
    pub fn register(&self, job_id: &str) -> Registration {
        let (tx, rx) = mpsc::unbounded_channel();
        let abort = AbortSignal::new();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        self.loops.insert(
            job_id.to_string(),
            LoopHandle {
                abort: abort.clone(),
                commands: tx,
                generation,
            },
        );
        debug!(job_id, "Loop registered");
        Registration {
            guard: RegistrationGuard {
                loops: self.loops.clone(),
                job_id: job_id.to_string(),
                generation,
            },
            abort,
            commands: rx,
        }
    }

    pub fn get(&self, job_id: &str) -> Option<LoopHandle> {
        self.loops.get(job_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.loops.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Trip every live loop's abort signal.
    pub fn abort_all(&self, reason: AbortReason) -> usize {
        let mut count = 0;
        for entry in self.loops.iter() {
            entry.value().abort.abort(reason.clone());
            count += 1;
        }
        count
    }
}
