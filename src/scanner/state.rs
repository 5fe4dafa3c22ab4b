//! Scan and scan-item transitions
//!
//! `Pending -> Started -> Completed{ok | fail_message}`. Every write goes
//! through here so timestamps are issued in strictly increasing order.

use crate::error::{Result, VscannerError};
use crate::models::{ItemResult, Scan, ScanItem, ScanState};
use crate::store::ScanStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Writes state transitions through the scan store
#[derive(Clone)]
pub struct ScanPersister {
    store: Arc<dyn ScanStore>,
    last_stamp: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl ScanPersister {
    pub fn new(store: Arc<dyn ScanStore>) -> Self {
        Self {
            store,
            last_stamp: Arc::new(Mutex::new(None)),
        }
    }

    /// Current time, nudged forward so no two stamps are equal
    fn stamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let Ok(mut last) = self.last_stamp.lock() else {
            return now;
        };
        let next = match *last {
            Some(prev) if now <= prev => prev + Duration::microseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }

    /// `Pending -> Started`. Must be persisted before the caller is acknowledged.
    pub async fn start(&self, scan: &Scan) -> Result<Scan> {
        if scan.state() != ScanState::Pending {
            return Err(VscannerError::InvalidTransition {
                scan_id: scan.id.clone(),
                from: scan.state().to_string(),
                to: "started".to_string(),
            });
        }
        let at = self.stamp();
        self.store.mark_started(&scan.id, at).await?;
        info!("Scan {} started", scan.id);
        Ok(Scan {
            started_at: Some(at),
            ..scan.clone()
        })
    }

    /// Records the result of an item once all its vulnerabilities are evaluated
    pub async fn complete_item(&self, item: &ScanItem, result: &ItemResult) -> Result<()> {
        if item.completed_at.is_some() {
            return Err(VscannerError::StoreError(format!(
                "Scan item '{}' is already completed",
                item.id
            )));
        }
        self.store.complete_item(&item.id, result, self.stamp()).await
    }

    /// Terminal transition. `fail_message` marks an aborted scan.
    pub async fn complete(&self, scan_id: &str, fail_message: Option<&str>) -> Result<()> {
        self.store
            .complete_scan(scan_id, fail_message, self.stamp())
            .await?;
        match fail_message {
            Some(message) => info!("Scan {scan_id} completed with failure: {message}"),
            None => info!("Scan {scan_id} completed"),
        }
        Ok(())
    }
}
