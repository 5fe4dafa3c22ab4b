//! Configuration management for vscanner

use crate::error::{Result, VscannerError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How a detector that throws while running is classified
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeErrorPolicy {
    /// A throwing detector counts as "not vulnerable"
    #[default]
    FailOpen,
    /// A throwing detector is recorded as failed with its error message
    FailClosed,
}

impl std::str::FromStr for RuntimeErrorPolicy {
    type Err = VscannerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fail_open" | "open" => Ok(Self::FailOpen),
            "fail_closed" | "closed" => Ok(Self::FailClosed),
            other => Err(VscannerError::ConfigError(format!(
                "Unknown runtime error policy '{other}' (use fail_open or fail_closed)"
            ))),
        }
    }
}

/// Settings for the out-of-process detector runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Interpreter executable that runs the harness
    pub runtime: String,
    /// Extra arguments placed before the harness path
    pub runtime_args: Vec<String>,
    /// Hard deadline for one detector, in seconds
    pub timeout_secs: u64,
    /// Detectors evaluated at once for a single item
    pub concurrency: usize,
    pub runtime_error_policy: RuntimeErrorPolicy,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: "node".to_string(),
            runtime_args: Vec::new(),
            timeout_secs: 30,
            concurrency: 4,
            runtime_error_policy: RuntimeErrorPolicy::FailOpen,
        }
    }
}

/// Mailgun transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailgunConfig {
    pub api_base: String,
    pub domain: String,
    pub from: String,
    pub to: Vec<String>,
    /// Link placed in the message body
    pub results_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for MailgunConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.mailgun.net".to_string(),
            domain: "vscanner.dev".to_string(),
            from: "VScanner <mailgun@vscanner.dev>".to_string(),
            to: Vec::new(),
            results_url: "https://vscanner.dev/".to_string(),
            api_key: None,
        }
    }
}

/// Runtime configuration for the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the trigger endpoint listens on
    pub bind: String,
    /// SQLite database file
    pub database_path: String,
    /// Worker tasks draining the job queue
    pub workers: usize,
    /// Jobs that may wait in the queue before triggers are refused
    pub queue_capacity: usize,
    pub sandbox: SandboxConfig,
    pub mailgun: MailgunConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            database_path: "vscanner.db".to_string(),
            workers: 2,
            queue_capacity: 64,
            sandbox: SandboxConfig::default(),
            mailgun: MailgunConfig::default(),
        }
    }
}

/// File-based configuration structure matching default.toml
#[derive(Debug, Deserialize)]
struct FileConfig {
    server: Option<ServerSection>,
    database: Option<DatabaseSection>,
    worker: Option<WorkerSection>,
    sandbox: Option<SandboxSection>,
    mailgun: Option<MailgunSection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DatabaseSection {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkerSection {
    workers: Option<usize>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    runtime: Option<String>,
    runtime_args: Option<Vec<String>>,
    timeout_secs: Option<u64>,
    concurrency: Option<usize>,
    runtime_error_policy: Option<RuntimeErrorPolicy>,
}

#[derive(Debug, Deserialize)]
struct MailgunSection {
    api_base: Option<String>,
    domain: Option<String>,
    from: Option<String>,
    to: Option<Vec<String>>,
    results_url: Option<String>,
}

/// Loads configuration from a TOML file and merges with defaults
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(VscannerError::IoError)?;
    parse_config(&content)
}

/// Parses TOML configuration text and merges it over the defaults
pub fn parse_config(content: &str) -> Result<Config> {
    let file_config: FileConfig = toml::from_str(content)?;
    let mut config = Config::default();

    if let Some(server) = file_config.server {
        if let Some(bind) = server.bind {
            config.bind = bind;
        }
    }

    if let Some(database) = file_config.database {
        if let Some(path) = database.path {
            config.database_path = path;
        }
    }

    if let Some(worker) = file_config.worker {
        if let Some(workers) = worker.workers {
            config.workers = workers;
        }
        if let Some(capacity) = worker.queue_capacity {
            config.queue_capacity = capacity;
        }
    }

    if let Some(sandbox) = file_config.sandbox {
        if let Some(runtime) = sandbox.runtime {
            config.sandbox.runtime = runtime;
        }
        if let Some(args) = sandbox.runtime_args {
            config.sandbox.runtime_args = args;
        }
        if let Some(timeout) = sandbox.timeout_secs {
            config.sandbox.timeout_secs = timeout;
        }
        if let Some(concurrency) = sandbox.concurrency {
            config.sandbox.concurrency = concurrency;
        }
        if let Some(policy) = sandbox.runtime_error_policy {
            config.sandbox.runtime_error_policy = policy;
        }
    }

    if let Some(mailgun) = file_config.mailgun {
        if let Some(api_base) = mailgun.api_base {
            config.mailgun.api_base = api_base;
        }
        if let Some(domain) = mailgun.domain {
            config.mailgun.domain = domain;
        }
        if let Some(from) = mailgun.from {
            config.mailgun.from = from;
        }
        if let Some(to) = mailgun.to {
            config.mailgun.to = to;
        }
        if let Some(url) = mailgun.results_url {
            config.mailgun.results_url = url;
        }
    }

    validate(&config)?;
    Ok(config)
}

/// Applies `DATABASE_URL` and `MAILGUN_API_KEY` from the process environment
pub fn apply_env(config: &mut Config) {
    apply_env_values(
        config,
        std::env::var("DATABASE_URL").ok(),
        std::env::var("MAILGUN_API_KEY").ok(),
    );
}

fn apply_env_values(config: &mut Config, database_url: Option<String>, api_key: Option<String>) {
    if let Some(url) = database_url.filter(|u| !u.trim().is_empty()) {
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(&url);
        config.database_path = path.to_string();
    }
    if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
        config.mailgun.api_key = Some(key);
    }
}

/// Merges CLI arguments into an existing Config
pub fn merge_cli_args(
    config: &mut Config,
    bind: Option<String>,
    database: Option<String>,
    workers: Option<usize>,
    runtime: Option<String>,
    detector_timeout: Option<u64>,
    policy: Option<RuntimeErrorPolicy>,
) {
    if let Some(b) = bind {
        config.bind = b;
    }
    if let Some(d) = database {
        config.database_path = d;
    }
    if let Some(w) = workers {
        config.workers = w;
    }
    if let Some(r) = runtime {
        config.sandbox.runtime = r;
    }
    if let Some(t) = detector_timeout {
        config.sandbox.timeout_secs = t;
    }
    if let Some(p) = policy {
        config.sandbox.runtime_error_policy = p;
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.workers == 0 {
        return Err(VscannerError::ConfigError(
            "worker.workers must be at least 1".to_string(),
        ));
    }
    if config.queue_capacity == 0 {
        return Err(VscannerError::ConfigError(
            "worker.queue_capacity must be at least 1".to_string(),
        ));
    }
    if config.sandbox.concurrency == 0 {
        return Err(VscannerError::ConfigError(
            "sandbox.concurrency must be at least 1".to_string(),
        ));
    }
    if config.sandbox.timeout_secs == 0 {
        return Err(VscannerError::ConfigError(
            "sandbox.timeout_secs must be at least 1".to_string(),
        ));
    }
    Ok(())
}
