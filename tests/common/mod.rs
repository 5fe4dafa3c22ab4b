//! Common test utilities
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vscanner::config::RuntimeErrorPolicy;
use vscanner::detector::{DetectorRuntime, Execution, SandboxRunner};
use vscanner::error::{Result, VscannerError};
use vscanner::models::{CompletionReport, ItemResult, Scan, ScanItem, Vulnerability};
use vscanner::notify::Notifier;
use vscanner::scanner::ScanEngine;
use vscanner::store::{MemoryStore, ScanStore};

/// Detector runtime interpreting a tiny script language:
/// `found`, `passed`, `throw <msg>`, `syntax <msg>`, `slow <found|passed>`.
#[derive(Default)]
pub struct ScriptedRuntime {
    pub calls: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn targets(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(_, target)| target.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

#[async_trait]
impl DetectorRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, script: &str, target: &str) -> Execution {
        self.calls
            .lock()
            .expect("calls lock")
            .push((script.to_string(), target.to_string()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let mut script = script.trim();
        if let Some(rest) = script.strip_prefix("slow ") {
            tokio::time::sleep(Duration::from_millis(50)).await;
            script = rest.trim();
        }

        let execution = if script == "found" {
            Execution::Returned(true)
        } else if script == "passed" {
            Execution::Returned(false)
        } else if let Some(message) = script.strip_prefix("throw ") {
            Execution::Threw(message.to_string())
        } else if let Some(message) = script.strip_prefix("syntax ") {
            Execution::LoadFailed(message.to_string())
        } else {
            Execution::LoadFailed(format!("unknown script '{script}'"))
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        execution
    }
}

/// Notifier that records every report and can be told to fail
#[derive(Default)]
pub struct RecordingNotifier {
    pub reports: Mutex<Vec<CompletionReport>>,
    pub fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let notifier = Self::default();
        notifier.fail.store(true, Ordering::SeqCst);
        Arc::new(notifier)
    }

    pub fn reports(&self) -> Vec<CompletionReport> {
        self.reports.lock().expect("reports lock").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, report: &CompletionReport) -> Result<()> {
        self.reports
            .lock()
            .expect("reports lock")
            .push(report.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(VscannerError::NotifyError("smtp relay down".to_string()));
        }
        Ok(())
    }
}

/// Store wrapper whose item writes start failing after a number of successes
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    item_writes_before_failure: usize,
    item_writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>, item_writes_before_failure: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            item_writes_before_failure,
            item_writes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ScanStore for FlakyStore {
    async fn load_scan(&self, scan_id: &str) -> Result<Scan> {
        self.inner.load_scan(scan_id).await
    }

    async fn load_items(&self, scan_id: &str) -> Result<Vec<ScanItem>> {
        self.inner.load_items(scan_id).await
    }

    async fn load_vulnerabilities(&self, ids: &[String]) -> Result<Vec<Vulnerability>> {
        self.inner.load_vulnerabilities(ids).await
    }

    async fn mark_started(&self, scan_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.inner.mark_started(scan_id, at).await
    }

    async fn complete_item(
        &self,
        item_id: &str,
        result: &ItemResult,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if self.item_writes.fetch_add(1, Ordering::SeqCst) >= self.item_writes_before_failure {
            return Err(VscannerError::StoreError(
                "connection terminated unexpectedly".to_string(),
            ));
        }
        self.inner.complete_item(item_id, result, at).await
    }

    async fn complete_scan(
        &self,
        scan_id: &str,
        fail_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.complete_scan(scan_id, fail_message, at).await
    }

    async fn stalled_scans(&self) -> Result<Vec<Scan>> {
        self.inner.stalled_scans().await
    }
}

/// Builds an engine over the given store with the scripted runtime
pub fn engine(
    store: Arc<dyn ScanStore>,
    runtime: Arc<ScriptedRuntime>,
    notifier: Arc<RecordingNotifier>,
    policy: RuntimeErrorPolicy,
) -> ScanEngine {
    ScanEngine::new(store, SandboxRunner::new(runtime, policy), notifier)
}

/// A pending scan with one item per `(item id, domain, vulnerability list)`
pub async fn seed_scan(store: &MemoryStore, scan_id: &str, items: &[(&str, &str, &str)]) {
    store.insert_scan(Scan::new(scan_id)).await;
    for (item_id, domain, vulnerabilities) in items {
        store
            .insert_item(ScanItem::new(
                *item_id,
                scan_id,
                Some(domain.to_string()),
                None,
                vulnerabilities,
            ))
            .await;
    }
}

pub async fn seed_vulnerability(store: &MemoryStore, id: &str, script: Option<&str>) {
    store.insert_vulnerability(Vulnerability::new(id, script)).await;
}

/// A cancel receiver that stays `false`
pub fn no_cancel() -> tokio::sync::watch::Receiver<bool> {
    tokio::sync::watch::channel(false).1
}
