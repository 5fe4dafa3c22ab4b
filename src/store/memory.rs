//! In-memory scan store for tests and dry runs

use super::ScanStore;
use crate::error::{Result, VscannerError};
use crate::models::{ItemResult, Scan, ScanItem, Vulnerability};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    scans: HashMap<String, Scan>,
    /// Insertion order is the natural order
    items: Vec<ScanItem>,
    vulnerabilities: Vec<Vulnerability>,
}

/// Thread-safe store keeping everything in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_scan(&self, scan: Scan) {
        self.state.lock().await.scans.insert(scan.id.clone(), scan);
    }

    pub async fn insert_item(&self, item: ScanItem) {
        self.state.lock().await.items.push(item);
    }

    pub async fn insert_vulnerability(&self, vulnerability: Vulnerability) {
        self.state.lock().await.vulnerabilities.push(vulnerability);
    }

    /// Fetches one item by id
    pub async fn item(&self, item_id: &str) -> Option<ScanItem> {
        self.state
            .lock()
            .await
            .items
            .iter()
            .find(|i| i.id == item_id)
            .cloned()
    }

    /// Number of successful state-changing writes
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScanStore for MemoryStore {
    async fn load_scan(&self, scan_id: &str) -> Result<Scan> {
        self.state
            .lock()
            .await
            .scans
            .get(scan_id)
            .cloned()
            .ok_or_else(|| VscannerError::ScanNotFound(scan_id.to_string()))
    }

    async fn load_items(&self, scan_id: &str) -> Result<Vec<ScanItem>> {
        Ok(self
            .state
            .lock()
            .await
            .items
            .iter()
            .filter(|i| i.scan_id == scan_id)
            .cloned()
            .collect())
    }

    async fn load_vulnerabilities(&self, ids: &[String]) -> Result<Vec<Vulnerability>> {
        Ok(self
            .state
            .lock()
            .await
            .vulnerabilities
            .iter()
            .filter(|v| ids.contains(&v.id))
            .cloned()
            .collect())
    }

    async fn mark_started(&self, scan_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let scan = state
            .scans
            .get_mut(scan_id)
            .ok_or_else(|| VscannerError::ScanNotFound(scan_id.to_string()))?;
        if scan.started_at.is_some() {
            return Err(VscannerError::InvalidTransition {
                scan_id: scan_id.to_string(),
                from: scan.state().to_string(),
                to: "started".to_string(),
            });
        }
        scan.started_at = Some(at);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn complete_item(
        &self,
        item_id: &str,
        result: &ItemResult,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .iter_mut()
            .find(|i| i.id == item_id && i.completed_at.is_none())
            .ok_or_else(|| {
                VscannerError::StoreError(format!(
                    "Scan item '{item_id}' is missing or already completed"
                ))
            })?;
        item.passed_count = result.passed_count() as u32;
        item.found_exploits = result.found.clone();
        item.failed_exploits = result.failed.clone();
        item.completed_at = Some(at);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn complete_scan(
        &self,
        scan_id: &str,
        fail_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let scan = state
            .scans
            .get_mut(scan_id)
            .ok_or_else(|| VscannerError::ScanNotFound(scan_id.to_string()))?;
        if scan.completed_at.is_some() {
            return Err(VscannerError::InvalidTransition {
                scan_id: scan_id.to_string(),
                from: scan.state().to_string(),
                to: "completed".to_string(),
            });
        }
        scan.completed_at = Some(at);
        scan.fail_message = fail_message.map(str::to_string);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stalled_scans(&self) -> Result<Vec<Scan>> {
        let state = self.state.lock().await;
        let mut stalled: Vec<Scan> = state
            .scans
            .values()
            .filter(|s| s.started_at.is_some() && s.completed_at.is_none())
            .cloned()
            .collect();
        stalled.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(stalled)
    }
}
