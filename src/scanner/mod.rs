//! Scan orchestration
//!
//! Loads a scan and its items, runs every item's detectors through the
//! sandbox, persists each item as it completes and finally closes the scan
//! and notifies. Detector failures become outcomes; only errors around the
//! item loop itself (store failures, cancellation) abort a scan.

pub mod aggregate;
pub mod state;

pub use aggregate::ScanTotals;
pub use state::ScanPersister;

use crate::config::Config;
use crate::detector::{SandboxRunner, NOT_IMPLEMENTED};
use crate::error::{Result, VscannerError};
use crate::models::{
    CompletionReport, DetectionOutcome, ItemResult, Scan, ScanItem, ScanStatus, Vulnerability,
};
use crate::notify::{self, Notifier};
use crate::store::{ScanStore, SqliteStore};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Recorded for ids listed on an item but absent from the catalog
pub const VULNERABILITY_NOT_FOUND: &str = "Vulnerability not found";

/// Recorded for every vulnerability of an item with neither domain nor IP
pub const NO_TARGET: &str = "Scan item has no target";

/// Terminal result of one scan execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanRun {
    Completed(CompletionReport),
    Failed(String),
}

/// Drives scans from `Started` to a terminal state
pub struct ScanEngine {
    store: Arc<dyn ScanStore>,
    persister: ScanPersister,
    runner: SandboxRunner,
    notifier: Arc<dyn Notifier>,
    concurrency: usize,
}

impl ScanEngine {
    pub fn new(
        store: Arc<dyn ScanStore>,
        runner: SandboxRunner,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            persister: ScanPersister::new(Arc::clone(&store)),
            store,
            runner,
            notifier,
            concurrency: 1,
        }
    }

    /// Builds an engine over the SQLite store, process sandbox and configured notifier
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = SqliteStore::open(Path::new(&config.database_path))?;
        let runner = SandboxRunner::from_config(&config.sandbox);
        let notifier = notify::from_config(&config.mailgun)?;
        info!("Completion notifier: {}", notifier.name());
        Ok(Self::new(Arc::new(store), runner, notifier)
            .with_concurrency(config.sandbox.concurrency))
    }

    /// Detectors evaluated at once within one item
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn ScanStore> {
        &self.store
    }

    /// Loads the scan and moves it to `Started`. Nothing is written when the
    /// scan does not exist or was already started.
    pub async fn start(&self, scan_id: &str) -> Result<Scan> {
        let scan = self.store.load_scan(scan_id).await?;
        self.persister.start(&scan).await
    }

    /// Closes a started scan with a failure message
    pub async fn abort(&self, scan_id: &str, message: &str) -> Result<()> {
        self.persister.complete(scan_id, Some(message)).await
    }

    /// Current persisted state of a scan, for polling
    pub async fn status(&self, scan_id: &str) -> Result<ScanStatus> {
        let scan = self.store.load_scan(scan_id).await?;
        let items = self.store.load_items(scan_id).await?;
        Ok(ScanStatus::from_parts(&scan, &items))
    }

    /// Logs scans that were started but never reached a terminal state
    pub async fn report_stalled(&self) -> Result<usize> {
        let stalled = self.store.stalled_scans().await?;
        for scan in &stalled {
            let since = scan
                .started_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default();
            warn!(
                "Scan {} has been started since {since} without completing; it will not be retried",
                scan.id
            );
        }
        Ok(stalled.len())
    }

    /// Runs every item of a started scan and writes the terminal state.
    ///
    /// `cancel` is checked between items only. Notification happens after
    /// the terminal write and cannot undo it.
    pub async fn execute(&self, scan_id: &str, cancel: &watch::Receiver<bool>) -> ScanRun {
        let processed = match self.process_items(scan_id, cancel).await {
            Ok(totals) => self.persister.complete(scan_id, None).await.map(|_| totals),
            Err(e) => Err(e),
        };

        match processed {
            Ok(totals) => {
                let report = totals.report(scan_id);
                if let Err(e) = self.notifier.notify(&report).await {
                    error!("Notification for scan {scan_id} failed: {e}");
                }
                ScanRun::Completed(report)
            }
            Err(e) => {
                let message = e.to_string();
                error!("Scan {scan_id} aborted: {message}");
                if let Err(write_err) = self.persister.complete(scan_id, Some(&message)).await {
                    error!("Could not record failure of scan {scan_id}: {write_err}");
                }
                ScanRun::Failed(message)
            }
        }
    }

    async fn process_items(
        &self,
        scan_id: &str,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ScanTotals> {
        let items = self.store.load_items(scan_id).await?;
        info!("Scan {scan_id}: {} items to evaluate", items.len());

        let mut totals = ScanTotals::default();
        for item in &items {
            if *cancel.borrow() {
                return Err(VscannerError::Cancelled);
            }

            let result = self.evaluate_item(item).await?;
            self.persister.complete_item(item, &result).await?;
            info!(
                "Item {} ({}): {} found, {} passed, {} failed",
                item.id,
                item.target().unwrap_or("-"),
                result.found.len(),
                result.passed.len(),
                result.failed.len()
            );
            totals.add(&result);
        }

        Ok(totals)
    }

    /// Produces exactly one outcome per vulnerability id of the item
    pub async fn evaluate_item(&self, item: &ScanItem) -> Result<ItemResult> {
        let vulnerabilities = self.store.load_vulnerabilities(&item.vulnerabilities).await?;
        let catalog: HashMap<String, Vulnerability> = vulnerabilities
            .into_iter()
            .map(|v| (v.id.clone(), v))
            .collect();
        let target = item.target().map(str::to_string);

        // Each future owns its inputs so the scan future stays `Send` on worker tasks
        let evaluations: Vec<_> = item
            .vulnerabilities
            .iter()
            .map(|id| {
                let id = id.clone();
                let vulnerability = catalog.get(&id).cloned();
                let target = target.clone();
                let runner = self.runner.clone();
                async move {
                    let outcome = evaluate_one(&runner, vulnerability, target.as_deref()).await;
                    debug!("{id} on {}: {outcome}", target.as_deref().unwrap_or("-"));
                    (id, outcome)
                }
            })
            .collect();

        let outcomes: Vec<(String, DetectionOutcome)> = stream::iter(evaluations)
            .buffered(self.concurrency)
            .collect()
            .await;

        Ok(aggregate::partition(outcomes))
    }
}

async fn evaluate_one(
    runner: &SandboxRunner,
    vulnerability: Option<Vulnerability>,
    target: Option<&str>,
) -> DetectionOutcome {
    let Some(vulnerability) = vulnerability else {
        return DetectionOutcome::Failed(VULNERABILITY_NOT_FOUND.to_string());
    };
    let script = vulnerability.detection_script.as_deref();
    match target {
        Some(target) => runner.run(script, target).await,
        None if script.map_or(true, |s| s.trim().is_empty()) => {
            DetectionOutcome::Failed(NOT_IMPLEMENTED.to_string())
        }
        None => DetectionOutcome::Failed(NO_TARGET.to_string()),
    }
}
