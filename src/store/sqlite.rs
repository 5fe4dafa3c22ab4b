//! SQLite-backed scan store
//!
//! Column layout follows the shared schema: `scan_items.vulnerabilities`
//! is a comma-separated id list and the exploit columns hold JSON arrays.
//! Timestamps are RFC 3339 text with microsecond precision.

use super::ScanStore;
use crate::error::{Result, VscannerError};
use crate::models::{
    parse_vulnerability_ids, FailedExploit, ItemResult, Scan, ScanItem, Vulnerability,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS scans (
    id            TEXT PRIMARY KEY,
    started_at    TEXT,
    completed_at  TEXT,
    fail_message  TEXT
);

CREATE TABLE IF NOT EXISTS scan_items (
    id               TEXT PRIMARY KEY,
    scan_id          TEXT NOT NULL REFERENCES scans(id),
    domain           TEXT,
    ip               TEXT,
    vulnerabilities  TEXT NOT NULL DEFAULT '',
    passed_exploits  INTEGER NOT NULL DEFAULT 0,
    found_exploits   TEXT NOT NULL DEFAULT '[]',
    failed_exploits  TEXT NOT NULL DEFAULT '[]',
    completed_at     TEXT
);

CREATE INDEX IF NOT EXISTS idx_scan_items_scan_id ON scan_items(scan_id);

CREATE TABLE IF NOT EXISTS vulnerability (
    id                 TEXT PRIMARY KEY,
    "detectionScript"  TEXT
);
"#;

/// Scan store over a single SQLite connection
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| VscannerError::StoreError(format!("Invalid timestamp '{s}': {e}")))
    })
    .transpose()
}

/// id, started_at, completed_at, fail_message
type ScanRow = (String, Option<String>, Option<String>, Option<String>);

fn scan_from_row(row: &Row<'_>) -> rusqlite::Result<ScanRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn build_scan(raw: ScanRow) -> Result<Scan> {
    let (id, started_at, completed_at, fail_message) = raw;
    Ok(Scan {
        id,
        started_at: parse_ts(started_at)?,
        completed_at: parse_ts(completed_at)?,
        fail_message,
    })
}

struct ItemRow {
    id: String,
    scan_id: String,
    domain: Option<String>,
    ip: Option<String>,
    vulnerabilities: Option<String>,
    passed_exploits: Option<i64>,
    found_exploits: Option<String>,
    failed_exploits: Option<String>,
    completed_at: Option<String>,
}

impl ItemRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            scan_id: row.get(1)?,
            domain: row.get(2)?,
            ip: row.get(3)?,
            vulnerabilities: row.get(4)?,
            passed_exploits: row.get(5)?,
            found_exploits: row.get(6)?,
            failed_exploits: row.get(7)?,
            completed_at: row.get(8)?,
        })
    }

    fn into_item(self) -> Result<ScanItem> {
        let found_exploits: Vec<String> = match self.found_exploits.as_deref() {
            Some(json) if !json.trim().is_empty() => serde_json::from_str(json)?,
            _ => Vec::new(),
        };
        let failed_exploits: Vec<FailedExploit> = match self.failed_exploits.as_deref() {
            Some(json) if !json.trim().is_empty() => serde_json::from_str(json)?,
            _ => Vec::new(),
        };
        Ok(ScanItem {
            id: self.id,
            scan_id: self.scan_id,
            domain: self.domain,
            ip: self.ip,
            vulnerabilities: parse_vulnerability_ids(self.vulnerabilities.as_deref().unwrap_or("")),
            passed_count: self.passed_exploits.unwrap_or(0).max(0) as u32,
            found_exploits,
            failed_exploits,
            completed_at: parse_ts(self.completed_at)?,
        })
    }
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and applies the schema
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        debug!("Scan database opened at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| VscannerError::StoreError("Connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| VscannerError::StoreError(format!("Store task failed: {e}")))?
    }

    pub async fn insert_scan(&self, scan_id: &str) -> Result<()> {
        let scan_id = scan_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("INSERT INTO scans (id) VALUES (?1)", params![scan_id])?;
            Ok(())
        })
        .await
    }

    pub async fn insert_item(
        &self,
        item_id: &str,
        scan_id: &str,
        domain: Option<&str>,
        ip: Option<&str>,
        vulnerabilities: &str,
    ) -> Result<()> {
        let values = (
            item_id.to_string(),
            scan_id.to_string(),
            domain.map(str::to_string),
            ip.map(str::to_string),
            vulnerabilities.to_string(),
        );
        self.with_conn(move |conn| {
            let (id, scan_id, domain, ip, vulnerabilities) = values;
            conn.execute(
                "INSERT INTO scan_items (id, scan_id, domain, ip, vulnerabilities) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, scan_id, domain, ip, vulnerabilities],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn insert_vulnerability(
        &self,
        id: &str,
        detection_script: Option<&str>,
    ) -> Result<()> {
        let id = id.to_string();
        let script = detection_script.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO vulnerability (id, \"detectionScript\") VALUES (?1, ?2)",
                params![id, script],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ScanStore for SqliteStore {
    async fn load_scan(&self, scan_id: &str) -> Result<Scan> {
        let scan_id = scan_id.to_string();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    "SELECT id, started_at, completed_at, fail_message FROM scans WHERE id = ?1",
                    params![scan_id],
                    scan_from_row,
                )
                .optional()?;
            match raw {
                Some(raw) => build_scan(raw),
                None => Err(VscannerError::ScanNotFound(scan_id)),
            }
        })
        .await
    }

    async fn load_items(&self, scan_id: &str) -> Result<Vec<ScanItem>> {
        let scan_id = scan_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, scan_id, domain, ip, vulnerabilities, passed_exploits, \
                 found_exploits, failed_exploits, completed_at \
                 FROM scan_items WHERE scan_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map(params![scan_id], ItemRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(ItemRow::into_item).collect()
        })
        .await
    }

    async fn load_vulnerabilities(&self, ids: &[String]) -> Result<Vec<Vulnerability>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let sql = format!(
                "SELECT id, \"detectionScript\" FROM vulnerability WHERE id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(ids.iter()), |row| {
                    Ok(Vulnerability {
                        id: row.get(0)?,
                        detection_script: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn mark_started(&self, scan_id: &str, at: DateTime<Utc>) -> Result<()> {
        let scan_id = scan_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE scans SET started_at = ?1 WHERE id = ?2 AND started_at IS NULL",
                params![format_ts(at), scan_id],
            )?;
            if changed == 0 {
                return Err(VscannerError::InvalidTransition {
                    scan_id,
                    from: "started".to_string(),
                    to: "started".to_string(),
                });
            }
            Ok(())
        })
        .await
    }

    async fn complete_item(
        &self,
        item_id: &str,
        result: &ItemResult,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let item_id = item_id.to_string();
        let passed = result.passed_count() as i64;
        let found = serde_json::to_string(&result.found)?;
        let failed = serde_json::to_string(&result.failed)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE scan_items SET passed_exploits = ?1, found_exploits = ?2, \
                 failed_exploits = ?3, completed_at = ?4 \
                 WHERE id = ?5 AND completed_at IS NULL",
                params![passed, found, failed, format_ts(at), item_id],
            )?;
            if changed == 0 {
                return Err(VscannerError::StoreError(format!(
                    "Scan item '{item_id}' is missing or already completed"
                )));
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn complete_scan(
        &self,
        scan_id: &str,
        fail_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let scan_id = scan_id.to_string();
        let fail_message = fail_message.map(str::to_string);
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE scans SET completed_at = ?1, fail_message = ?2 \
                 WHERE id = ?3 AND completed_at IS NULL",
                params![format_ts(at), fail_message, scan_id],
            )?;
            if changed == 0 {
                return Err(VscannerError::InvalidTransition {
                    scan_id,
                    from: "completed".to_string(),
                    to: "completed".to_string(),
                });
            }
            Ok(())
        })
        .await
    }

    async fn stalled_scans(&self) -> Result<Vec<Scan>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, started_at, completed_at, fail_message FROM scans \
                 WHERE started_at IS NOT NULL AND completed_at IS NULL ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], scan_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(build_scan).collect()
        })
        .await
    }
}
