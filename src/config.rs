//! Layered runtime configuration.
//!
//! Precedence, lowest first: built-in defaults, `ticketsmith.toml` (or the
//! file passed with `--config`), environment variables (a `.env` file is
//! loaded by `main` through `dotenvy`), then CLI flags applied by the caller.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "ticketsmith.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_path: PathBuf,
    pub worker: WorkerSettings,
    pub queue: QueueSettings,
    pub agent: AgentSettings,
    pub sandbox: SandboxSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub worker_id: String,
    /// Handlers per topic.
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    pub poll_interval_ms: u64,
    pub lease_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    Text,
    StreamJson,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub command: String,
    pub output_format: OutputFormat,
    pub max_turns: u32,
    /// Replaces the generated argument list when non-empty. The prompt is
    /// always appended last.
    pub args: Vec<String>,
    pub iteration_timeout_secs: u64,
    pub flush_interval_ms: u64,
    pub flush_bytes: usize,
    /// Variables stripped from the agent's environment.
    pub env_remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSettings {
    pub base_path: PathBuf,
    pub branch_prefix: String,
    pub instructions_file: String,
    /// Layer a `jj` colocated repo over the git checkout.
    pub vcs_overlay: bool,
    pub git_command: String,
    pub overlay_command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
    /// Also write daily-rolling log files here.
    pub directory: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(".ticketsmith/ticketsmith.db"),
            worker: WorkerSettings::default(),
            queue: QueueSettings::default(),
            agent: AgentSettings::default(),
            sandbox: SandboxSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", crate::util::now_millis()),
            concurrency: 5,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            lease_secs: 60,
            max_attempts: 3,
            retry_backoff_ms: 1000,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            output_format: OutputFormat::Text,
            max_turns: 50,
            args: Vec::new(),
            iteration_timeout_secs: 600,
            flush_interval_ms: 2000,
            flush_bytes: 10_000,
            env_remove: vec!["CLAUDECODE".to_string()],
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/tmp/ticketsmith/sandboxes"),
            branch_prefix: "ticketsmith".to_string(),
            instructions_file: "CLAUDE.md".to_string(),
            vcs_overlay: false,
            git_command: "git".to_string(),
            overlay_command: "jj".to_string(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            directory: None,
        }
    }
}

impl AgentSettings {
    /// Argument list passed before the prompt.
    pub fn command_args(&self) -> Vec<String> {
        if !self.args.is_empty() {
            return self.args.clone();
        }
        let mut args = vec![
            "--print".to_string(),
            "--max-turns".to_string(),
            self.max_turns.to_string(),
            "--output-format".to_string(),
        ];
        match self.output_format {
            OutputFormat::Text => args.push("text".to_string()),
            OutputFormat::StreamJson => {
                args.push("stream-json".to_string());
                args.push("--verbose".to_string());
            }
        }
        args
    }
}

/// Raw TOML structure for `ticketsmith.toml`
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    database: Option<PathBuf>,
    worker: Option<WorkerSection>,
    queue: Option<QueueSection>,
    agent: Option<AgentSection>,
    sandbox: Option<SandboxSection>,
    logging: Option<LoggingSection>,
}

#[derive(Debug, Deserialize)]
struct WorkerSection {
    id: Option<String>,
    concurrency: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct QueueSection {
    poll_interval_ms: Option<u64>,
    lease_secs: Option<u64>,
    max_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AgentSection {
    command: Option<String>,
    output_format: Option<OutputFormat>,
    max_turns: Option<u32>,
    args: Option<Vec<String>>,
    iteration_timeout_secs: Option<u64>,
    flush_interval_ms: Option<u64>,
    flush_bytes: Option<usize>,
    env_remove: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    base_path: Option<PathBuf>,
    branch_prefix: Option<String>,
    instructions_file: Option<String>,
    vcs_overlay: Option<bool>,
    git_command: Option<String>,
    overlay_command: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoggingSection {
    level: Option<String>,
    format: Option<LogFormat>,
    directory: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `path` (must exist) or, when `None`, from
    /// `ticketsmith.toml` in the working directory if present, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let toml: ConfigToml = toml::from_str(content)?;
        let mut config = Self::default();

        if let Some(database) = toml.database {
            config.database_path = database;
        }
        if let Some(section) = toml.worker {
            if let Some(id) = section.id {
                config.worker.worker_id = id;
            }
            if let Some(concurrency) = section.concurrency {
                config.worker.concurrency = concurrency;
            }
        }
        if let Some(section) = toml.queue {
            if let Some(v) = section.poll_interval_ms {
                config.queue.poll_interval_ms = v;
            }
            if let Some(v) = section.lease_secs {
                config.queue.lease_secs = v;
            }
            if let Some(v) = section.max_attempts {
                config.queue.max_attempts = v;
            }
            if let Some(v) = section.retry_backoff_ms {
                config.queue.retry_backoff_ms = v;
            }
        }
        if let Some(section) = toml.agent {
            if let Some(command) = section.command {
                config.agent.command = command;
            }
            if let Some(format) = section.output_format {
                config.agent.output_format = format;
            }
            if let Some(v) = section.max_turns {
                config.agent.max_turns = v;
            }
            if let Some(args) = section.args {
                config.agent.args = args;
            }
            if let Some(v) = section.iteration_timeout_secs {
                config.agent.iteration_timeout_secs = v;
            }
            if let Some(v) = section.flush_interval_ms {
                config.agent.flush_interval_ms = v;
            }
            if let Some(v) = section.flush_bytes {
                config.agent.flush_bytes = v;
            }
            if let Some(env_remove) = section.env_remove {
                config.agent.env_remove = env_remove;
            }
        }
        if let Some(section) = toml.sandbox {
            if let Some(base_path) = section.base_path {
                config.sandbox.base_path = base_path;
            }
            if let Some(prefix) = section.branch_prefix {
                config.sandbox.branch_prefix = prefix;
            }
            if let Some(file) = section.instructions_file {
                config.sandbox.instructions_file = file;
            }
            if let Some(overlay) = section.vcs_overlay {
                config.sandbox.vcs_overlay = overlay;
            }
            if let Some(cmd) = section.git_command {
                config.sandbox.git_command = cmd;
            }
            if let Some(cmd) = section.overlay_command {
                config.sandbox.overlay_command = cmd;
            }
        }
        if let Some(section) = toml.logging {
            if let Some(level) = section.level {
                config.logging.level = level;
            }
            if let Some(format) = section.format {
                config.logging.format = format;
            }
            if let Some(dir) = section.directory {
                config.logging.directory = Some(dir);
            }
        }

        Ok(config)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TICKETSMITH_DATABASE") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("TICKETSMITH_WORKER_ID") {
            self.worker.worker_id = v;
        }
        if let Some(v) = lookup("TICKETSMITH_CONCURRENCY") {
            self.worker.concurrency = v
                .parse()
                .with_context(|| format!("TICKETSMITH_CONCURRENCY must be a number, got '{}'", v))?;
        }
        if let Some(v) = lookup("TICKETSMITH_SANDBOX_BASE") {
            self.sandbox.base_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CLAUDE_CMD") {
            self.agent.command = v;
        }
        if let Some(v) = lookup("TICKETSMITH_LOG_FORMAT") {
            self.logging.format = match v.as_str() {
                "json" => LogFormat::Json,
                "compact" => LogFormat::Compact,
                other => bail!("TICKETSMITH_LOG_FORMAT must be 'compact' or 'json', got '{}'", other),
            };
        }
        if let Some(v) = lookup("TICKETSMITH_LOG_DIR") {
            self.logging.directory = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            bail!("worker concurrency must be at least 1");
        }
        if self.queue.max_attempts == 0 {
            bail!("queue max_attempts must be at least 1");
        }
        if self.queue.lease_secs == 0 {
            bail!("queue lease_secs must be at least 1");
        }
        if self.agent.command.trim().is_empty() {
            bail!("agent command must not be empty");
        }
        Ok(())
    }
}
