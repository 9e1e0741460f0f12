//! Agent subprocess execution.
//!
//! `AgentRunner` is the seam the execution loop talks to; `ProcessExecutor`
//! is the real implementation that spawns the agent CLI inside a sandbox and
//! streams its stdout back chunk by chunk.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{AgentSettings, OutputFormat};
use crate::errors::ExecutorError;
use crate::stream::StreamDecoder;

const READ_CHUNK: usize = 8192;
const STDERR_TAIL_CHARS: usize = 2000;

/// Why a running job was told to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Cancelled by a user; the job ends as `cancelled`.
    Cancelled(String),
    /// The worker is going away; the job is handed back to the queue.
    Shutdown,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled(reason) => write!(f, "cancelled: {}", reason),
            Self::Shutdown => write!(f, "worker shutting down"),
        }
    }
}

/// Cancellation token that remembers the first reason it was tripped with.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<AbortReason>>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self, reason: AbortReason) {
        if let Ok(mut slot) = self.reason.lock() {
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.reason.lock().ok().and_then(|slot| slot.clone())
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub working_dir: PathBuf,
    pub prompt: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Everything the agent printed, after stream decoding.
    pub output: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one agent iteration. Output fragments are sent on `output` as they
    /// arrive; the full output is also returned.
    async fn execute(
        &self,
        request: ExecutionRequest,
        output: mpsc::UnboundedSender<String>,
        abort: &AbortSignal,
    ) -> Result<ExecutionResult, ExecutorError>;
}

/// Runs the configured agent CLI as a child process.
pub struct ProcessExecutor {
    settings: AgentSettings,
}

impl ProcessExecutor {
    pub fn new(settings: AgentSettings) -> Self {
        Self { settings }
    }

    fn command(&self, request: &ExecutionRequest) -> Command {
        let mut cmd = Command::new(&self.settings.command);
        cmd.args(self.settings.command_args())
            .arg(&request.prompt)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for var in &self.settings.env_remove {
            cmd.env_remove(var);
        }
        cmd
    }
}

#[async_trait]
impl AgentRunner for ProcessExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        output: mpsc::UnboundedSender<String>,
        abort: &AbortSignal,
    ) -> Result<ExecutionResult, ExecutorError> {
        let mut child = self
            .command(&request)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                command: self.settings.command.clone(),
                source,
            })?;
        debug!(
            command = %self.settings.command,
            dir = %request.working_dir.display(),
            pid = ?child.id(),
            "Agent process spawned"
        );

        let mut stdout = child.stdout.take().ok_or_else(|| {
            ExecutorError::Stream(std::io::Error::other("agent stdout was not captured"))
        })?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let deadline = Instant::now() + request.timeout;
        let timeout_secs = request.timeout.as_secs();
        let mut decoder = match self.settings.output_format {
            OutputFormat::StreamJson => Some(StreamDecoder::new()),
            OutputFormat::Text => None,
        };
        let mut utf8 = Utf8Carry::default();
        let mut collected = String::new();
        let mut emit = |text: String| {
            if !text.is_empty() {
                collected.push_str(&text);
                let _ = output.send(text);
            }
        };
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            tokio::select! {
                read = stdout.read(&mut buf) => {
                    let n = read.map_err(ExecutorError::Stream)?;
                    if n == 0 {
                        break;
                    }
                    let text = utf8.decode(&buf[..n]);
                    emit(match decoder.as_mut() {
                        Some(decoder) => decoder.push(&text),
                        None => text,
                    });
                }
                _ = abort.cancelled() => {
                    let _ = child.kill().await;
                    return Err(aborted(abort));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = child.kill().await;
                    return Err(ExecutorError::Timeout { secs: timeout_secs });
                }
            }
        }

        let tail = utf8.finish();
        match decoder.as_mut() {
            Some(decoder) => {
                emit(decoder.push(&tail));
                emit(decoder.finish());
            }
            None => emit(tail),
        }

        let status = tokio::select! {
            status = child.wait() => status.map_err(ExecutorError::Stream)?,
            _ = abort.cancelled() => {
                let _ = child.kill().await;
                return Err(aborted(abort));
            }
            _ = tokio::time::sleep_until(deadline) => {
                let _ = child.kill().await;
                return Err(ExecutorError::Timeout { secs: timeout_secs });
            }
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            let start = stderr.len().saturating_sub(STDERR_TAIL_CHARS);
            let start = (start..stderr.len())
                .find(|i| stderr.is_char_boundary(*i))
                .unwrap_or(stderr.len());
            warn!(
                exit_code = ?status.code(),
                stderr = %stderr[start..].trim(),
                "Agent process exited with failure"
            );
        }

        Ok(ExecutionResult {
            output: collected,
            exit_code: status.code(),
        })
    }
}

fn aborted(abort: &AbortSignal) -> ExecutorError {
    ExecutorError::Aborted {
        reason: abort
            .reason()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "aborted".to_string()),
    }
}

/// Decodes a byte stream as UTF-8, holding back a multi-byte sequence that
/// was split across reads.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            // Incomplete sequence at the end: keep it for the next read.
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        }
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> ProcessExecutor {
        ProcessExecutor::new(AgentSettings {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..AgentSettings::default()
        })
    }

    fn request(prompt: &str, timeout: Duration) -> ExecutionRequest {
        ExecutionRequest {
            working_dir: std::env::temp_dir(),
            prompt: prompt.to_string(),
            timeout,
        }
    }

    fn drain(mut rx: mpsc::UnboundedReceiver<String>) -> String {
        let mut out = String::new();
        while let Ok(chunk) = rx.try_recv() {
            out.push_str(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_prompt_is_passed_as_last_argument() {
        let executor = shell("printf 'hello %s' \"$0\"");
        let (tx, rx) = mpsc::unbounded_channel();
        let result = executor
            .execute(request("world", Duration::from_secs(10)), tx, &AbortSignal::new())
            .await
            .unwrap();
        assert_eq!(result.output, "hello world");
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(drain(rx), "hello world");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let executor = shell("echo partial; echo oops >&2; exit 3");
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = executor
            .execute(request("x", Duration::from_secs(10)), tx, &AbortSignal::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.output, "partial\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let executor = shell("exec sleep 5");
        let (tx, _rx) = mpsc::unbounded_channel();
        let started = std::time::Instant::now();
        let err = executor
            .execute(request("x", Duration::from_millis(200)), tx, &AbortSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_abort_kills_process_with_reason() {
        let executor = shell("exec sleep 5");
        let (tx, _rx) = mpsc::unbounded_channel();
        let abort = AbortSignal::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.abort(AbortReason::Cancelled("user request".to_string()));
        });
        let err = executor
            .execute(request("x", Duration::from_secs(10)), tx, &abort)
            .await
            .unwrap_err();
        match err {
            ExecutorError::Aborted { reason } => assert!(reason.contains("user request")),
            other => panic!("expected abort, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let executor = ProcessExecutor::new(AgentSettings {
            command: "/nonexistent/agent-binary".to_string(),
            ..AgentSettings::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = executor
            .execute(request("x", Duration::from_secs(1)), tx, &AbortSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_stream_json_output_is_decoded() {
        let executor = ProcessExecutor::new(AgentSettings {
            command: "sh".to_string(),
            output_format: OutputFormat::StreamJson,
            args: vec![
                "-c".to_string(),
                r#"printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"hi there"}]}}'"#
                    .to_string(),
            ],
            ..AgentSettings::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = executor
            .execute(request("x", Duration::from_secs(10)), tx, &AbortSignal::new())
            .await
            .unwrap();
        assert_eq!(result.output, "hi there\n");
    }

    #[tokio::test]
    async fn test_removed_env_vars_are_not_inherited() {
        let executor = ProcessExecutor::new(AgentSettings {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "printf '%s' \"${HOME:-unset}\"".to_string()],
            env_remove: vec!["HOME".to_string()],
            ..AgentSettings::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = executor
            .execute(request("x", Duration::from_secs(10)), tx, &AbortSignal::new())
            .await
            .unwrap();
        assert_eq!(result.output, "unset");
    }

    #[test]
    fn test_utf8_carry_joins_split_sequence() {
        let bytes = "héllo".as_bytes();
        let mut carry = Utf8Carry::default();
        // Split inside the two-byte 'é'.
        let first = carry.decode(&bytes[..2]);
        let second = carry.decode(&bytes[2..]);
        assert_eq!(first, "h");
        assert_eq!(format!("{}{}", first, second), "héllo");
        assert!(carry.finish().is_empty());
    }

    #[test]
    fn test_abort_keeps_first_reason() {
        let signal = AbortSignal::new();
        assert!(!signal.is_aborted());
        signal.abort(AbortReason::Shutdown);
        signal.abort(AbortReason::Cancelled("late".to_string()));
        assert!(signal.is_aborted());
        assert_eq!(signal.reason(), Some(AbortReason::Shutdown));
    }
}
