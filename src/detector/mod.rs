//! Detector sandbox and outcome classification
//!
//! A detector is untrusted code taken from a vulnerability's detection
//! script. It only ever sees a target string and answers with a boolean or
//! an error. Execution happens behind the [`DetectorRuntime`] trait so the
//! host process never evaluates the script itself.

pub mod harness;
pub mod process;

pub use process::ProcessRuntime;

use crate::config::{RuntimeErrorPolicy, SandboxConfig};
use crate::models::DetectionOutcome;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Message recorded when a vulnerability has no detection script
pub const NOT_IMPLEMENTED: &str = "Detect code not implemented";

/// What happened when a detector module was executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    /// The entry point returned; the flag is the truthiness of its value
    Returned(bool),
    /// The module could not be loaded or exposes no entry point
    LoadFailed(String),
    /// The entry point raised while running
    Threw(String),
    /// The hard deadline elapsed and the detector was killed
    TimedOut(Duration),
}

/// Capability that executes one detector module against one target
#[async_trait]
pub trait DetectorRuntime: Send + Sync {
    /// Returns the runtime name
    fn name(&self) -> &str;

    /// Loads `script` in isolation and invokes its entry point with `target`
    async fn execute(&self, script: &str, target: &str) -> Execution;
}

/// Runs detection scripts through a runtime and classifies the result
#[derive(Clone)]
pub struct SandboxRunner {
    runtime: Arc<dyn DetectorRuntime>,
    policy: RuntimeErrorPolicy,
}

impl SandboxRunner {
    pub fn new(runtime: Arc<dyn DetectorRuntime>, policy: RuntimeErrorPolicy) -> Self {
        Self { runtime, policy }
    }

    /// Builds a runner over the process runtime described by `config`
    pub fn from_config(config: &SandboxConfig) -> Self {
        let runtime = ProcessRuntime::new(
            &config.runtime,
            config.runtime_args.clone(),
            Duration::from_secs(config.timeout_secs),
        );
        Self::new(Arc::new(runtime), config.runtime_error_policy)
    }

    pub fn policy(&self) -> RuntimeErrorPolicy {
        self.policy
    }

    /// Evaluates one detection script against one target.
    ///
    /// Never fails: load errors, runtime errors and timeouts all become
    /// outcomes here.
    pub async fn run(&self, detection_script: Option<&str>, target: &str) -> DetectionOutcome {
        let Some(script) = detection_script.filter(|s| !s.trim().is_empty()) else {
            return DetectionOutcome::Failed(NOT_IMPLEMENTED.to_string());
        };

        let execution = self.runtime.execute(script, target).await;
        debug!("Detector on {target} via {}: {execution:?}", self.runtime.name());
        classify(execution, self.policy)
    }
}

/// Maps a raw execution result onto an outcome under the given policy
pub fn classify(execution: Execution, policy: RuntimeErrorPolicy) -> DetectionOutcome {
    match execution {
        Execution::Returned(true) => DetectionOutcome::Found,
        Execution::Returned(false) => DetectionOutcome::Passed,
        Execution::LoadFailed(message) => DetectionOutcome::Failed(message),
        Execution::Threw(message) => match policy {
            RuntimeErrorPolicy::FailOpen => DetectionOutcome::Passed,
            RuntimeErrorPolicy::FailClosed => DetectionOutcome::Failed(message),
        },
        Execution::TimedOut(limit) => DetectionOutcome::Failed(format!(
            "Detection timed out after {}s",
            limit.as_secs()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRuntime {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DetectorRuntime for CountingRuntime {
        fn name(&self) -> &str {
            "counting"
        }

        async fn execute(&self, _script: &str, _target: &str) -> Execution {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Execution::Returned(true)
        }
    }

    #[test]
    fn test_classify_fail_open() {
        let policy = RuntimeErrorPolicy::FailOpen;
        assert_eq!(classify(Execution::Returned(true), policy), DetectionOutcome::Found);
        assert_eq!(classify(Execution::Returned(false), policy), DetectionOutcome::Passed);
        assert_eq!(
            classify(Execution::Threw("TypeError: x is undefined".into()), policy),
            DetectionOutcome::Passed
        );
        assert_eq!(
            classify(Execution::LoadFailed("Unexpected token".into()), policy),
            DetectionOutcome::Failed("Unexpected token".into())
        );
    }

    #[test]
    fn test_classify_fail_closed() {
        let outcome = classify(
            Execution::Threw("ECONNREFUSED".into()),
            RuntimeErrorPolicy::FailClosed,
        );
        assert_eq!(outcome, DetectionOutcome::Failed("ECONNREFUSED".into()));
    }

    #[test]
    fn test_classify_timeout() {
        let outcome = classify(
            Execution::TimedOut(Duration::from_secs(30)),
            RuntimeErrorPolicy::FailOpen,
        );
        assert_eq!(
            outcome,
            DetectionOutcome::Failed("Detection timed out after 30s".into())
        );
    }

    #[tokio::test]
    async fn test_missing_script_skips_execution() {
        let runtime = Arc::new(CountingRuntime {
            calls: AtomicUsize::new(0),
        });
        let runner = SandboxRunner::new(runtime.clone(), RuntimeErrorPolicy::FailOpen);

        assert_eq!(
            runner.run(None, "example.com").await,
            DetectionOutcome::Failed(NOT_IMPLEMENTED.into())
        );
        assert_eq!(
            runner.run(Some("   "), "example.com").await,
            DetectionOutcome::Failed(NOT_IMPLEMENTED.into())
        );
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 0);

        assert_eq!(
            runner.run(Some("export default () => true"), "example.com").await,
            DetectionOutcome::Found
        );
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 1);
    }
}
