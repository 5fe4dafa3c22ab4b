//! Scan store: persisted scans, scan items and the vulnerability catalog

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::models::{ItemResult, Scan, ScanItem, Vulnerability};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Storage collaborator used by the engine.
///
/// Write operations are guarded: each one only applies to a record that
/// has not yet made the transition, so a repeated write is an error rather
/// than a silent overwrite.
#[async_trait]
pub trait ScanStore: Send + Sync {
    /// Fetches a scan, failing with `ScanNotFound` when it does not exist
    async fn load_scan(&self, scan_id: &str) -> Result<Scan>;

    /// Items of a scan, in the store's natural order
    async fn load_items(&self, scan_id: &str) -> Result<Vec<ScanItem>>;

    /// Catalog entries for the given ids. Unknown ids are simply absent.
    async fn load_vulnerabilities(&self, ids: &[String]) -> Result<Vec<Vulnerability>>;

    /// Sets `started_at` on a scan that has never been started
    async fn mark_started(&self, scan_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Writes an item's partitioned result and `completed_at` in one transaction
    async fn complete_item(&self, item_id: &str, result: &ItemResult, at: DateTime<Utc>)
        -> Result<()>;

    /// Sets `completed_at` (and the failure text, if any) on an open scan
    async fn complete_scan(
        &self,
        scan_id: &str,
        fail_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Scans left started without a terminal write
    async fn stalled_scans(&self) -> Result<Vec<Scan>>;
}
