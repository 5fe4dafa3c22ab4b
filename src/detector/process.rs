//! Out-of-process detector runtime
//!
//! Each execution stages the harness and the detector module in a fresh
//! scratch directory, runs the configured interpreter on them with a
//! cleared environment and a hard deadline, then reads the report file the
//! harness wrote. Detector stdout is discarded.
//! The scratch directory is owned by a [`TempDir`] and removed when the
//! execution returns, whichever way it returns.

use super::harness::{
    self, NODE_HARNESS, NODE_HARNESS_FILE, NODE_MODULE_EXTENSION, REPORT_FILE,
};
use super::{DetectorRuntime, Execution};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

const STDERR_LOG_LIMIT: usize = 2048;

/// Harness source plus the file names it is staged under
#[derive(Debug, Clone)]
pub struct Harness {
    pub file_name: String,
    pub source: String,
    pub module_extension: String,
}

impl Harness {
    pub fn new(
        file_name: impl Into<String>,
        source: impl Into<String>,
        module_extension: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            source: source.into(),
            module_extension: module_extension.into(),
        }
    }

    /// The ES module harness for Node.js
    pub fn node() -> Self {
        Self::new(NODE_HARNESS_FILE, NODE_HARNESS, NODE_MODULE_EXTENSION)
    }
}

/// Scratch directory holding one staged detector
struct DetectorWorkspace {
    dir: TempDir,
    harness_path: PathBuf,
    module_path: PathBuf,
    report_path: PathBuf,
}

impl DetectorWorkspace {
    fn create(
        scratch_root: Option<&Path>,
        harness: &Harness,
        script: &str,
    ) -> std::io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("vscanner-detect-");
        let dir = match scratch_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };

        let harness_path = dir.path().join(&harness.file_name);
        std::fs::write(&harness_path, &harness.source)?;

        let module_path = dir.path().join(format!(
            "detect-{}.{}",
            uuid::Uuid::new_v4().simple(),
            harness.module_extension
        ));
        std::fs::write(&module_path, script)?;

        let report_path = dir.path().join(REPORT_FILE);

        Ok(Self {
            dir,
            harness_path,
            module_path,
            report_path,
        })
    }

    /// Report file contents. A harness that never reported leaves no file.
    async fn read_reports(&self) -> std::io::Result<String> {
        match tokio::fs::read_to_string(&self.report_path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }
}

/// Runs detectors in a child interpreter process
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    harness: Harness,
    scratch_root: Option<PathBuf>,
}

impl ProcessRuntime {
    /// Creates a runtime using the Node.js harness
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            harness: Harness::node(),
            scratch_root: None,
        }
    }

    /// Replaces the harness staged next to each module
    pub fn with_harness(mut self, harness: Harness) -> Self {
        self.harness = harness;
        self
    }

    /// Stages scratch directories under `root` instead of the system temp dir
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn command(&self, workspace: &DetectorWorkspace, target: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&workspace.harness_path)
            .arg(&workspace.module_path)
            .arg(target)
            .arg(&workspace.report_path)
            .current_dir(workspace.dir.path())
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl DetectorRuntime for ProcessRuntime {
    fn name(&self) -> &str {
        &self.program
    }

    async fn execute(&self, script: &str, target: &str) -> Execution {
        let workspace =
            match DetectorWorkspace::create(self.scratch_root.as_deref(), &self.harness, script) {
                Ok(workspace) => workspace,
                Err(e) => {
                    warn!("Failed to stage detector module: {e}");
                    return Execution::LoadFailed(format!("Failed to stage detector module: {e}"));
                }
            };

        let child = match self.command(&workspace, target).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to start detector runtime '{}': {e}", self.program);
                return Execution::LoadFailed(format!(
                    "Failed to start detector runtime '{}': {e}",
                    self.program
                ));
            }
        };

        // Dropping the output future on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Execution::LoadFailed(format!("Detector runtime I/O failure: {e}"));
            }
            Err(_) => {
                warn!(
                    "Detector for {target} exceeded {}s, killed",
                    self.timeout.as_secs()
                );
                return Execution::TimedOut(self.timeout);
            }
        };

        if !output.stderr.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let end = stderr
                .char_indices()
                .nth(STDERR_LOG_LIMIT)
                .map_or(stderr.len(), |(i, _)| i);
            debug!("Detector stderr for {target}: {}", &stderr[..end]);
        }

        let contents = match workspace.read_reports().await {
            Ok(contents) => contents,
            Err(e) => {
                return Execution::LoadFailed(format!("Failed to read detector report: {e}"));
            }
        };
        let reports = harness::parse_reports(&contents);
        harness::interpret(&reports, &output.status.to_string())
    }
}
