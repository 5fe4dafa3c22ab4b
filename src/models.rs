//! Core data models for the scan engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A requested run of checks across a target inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    pub id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub fail_message: Option<String>,
}

impl Scan {
    /// Creates a scan that has not been started yet
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            started_at: None,
            completed_at: None,
            fail_message: None,
        }
    }

    /// Derives the lifecycle state from the persisted timestamps
    pub fn state(&self) -> ScanState {
        match (self.started_at, self.completed_at) {
            (_, Some(_)) => ScanState::Completed {
                fail_message: self.fail_message.clone(),
            },
            (Some(_), None) => ScanState::Started,
            (None, None) => ScanState::Pending,
        }
    }
}

/// Lifecycle of a scan. Both `Completed` shapes are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ScanState {
    Pending,
    Started,
    Completed { fail_message: Option<String> },
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Completed { .. })
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Pending => write!(f, "pending"),
            ScanState::Started => write!(f, "started"),
            ScanState::Completed { fail_message: None } => write!(f, "completed"),
            ScanState::Completed { fail_message: Some(_) } => write!(f, "failed"),
        }
    }
}

/// A vulnerability that could not be evaluated, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedExploit {
    pub id: String,
    pub message: String,
}

/// One target within a scan, bound to the vulnerability ids it must be checked against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanItem {
    pub id: String,
    pub scan_id: String,
    pub domain: Option<String>,
    pub ip: Option<String>,
    /// Ordered, de-duplicated vulnerability ids
    pub vulnerabilities: Vec<String>,
    pub passed_count: u32,
    pub found_exploits: Vec<String>,
    pub failed_exploits: Vec<FailedExploit>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScanItem {
    /// Creates a pending item from the raw comma-separated vulnerability column
    pub fn new(
        id: impl Into<String>,
        scan_id: impl Into<String>,
        domain: Option<String>,
        ip: Option<String>,
        vulnerabilities: &str,
    ) -> Self {
        Self {
            id: id.into(),
            scan_id: scan_id.into(),
            domain,
            ip,
            vulnerabilities: parse_vulnerability_ids(vulnerabilities),
            passed_count: 0,
            found_exploits: Vec::new(),
            failed_exploits: Vec::new(),
            completed_at: None,
        }
    }

    /// Address handed to detectors. The domain wins when both are present.
    pub fn target(&self) -> Option<&str> {
        self.domain
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .or_else(|| self.ip.as_deref().filter(|ip| !ip.trim().is_empty()))
    }
}

/// Splits a comma-separated id list, dropping blanks and repeats while keeping order
pub fn parse_vulnerability_ids(raw: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in raw.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        if !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

/// Catalog entry carrying the source of its detection logic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: String,
    pub detection_script: Option<String>,
}

impl Vulnerability {
    pub fn new(id: impl Into<String>, detection_script: Option<&str>) -> Self {
        Self {
            id: id.into(),
            detection_script: detection_script.map(str::to_string),
        }
    }
}

/// Classification of one (item, vulnerability) evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionOutcome {
    Found,
    Passed,
    Failed(String),
}

impl fmt::Display for DetectionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionOutcome::Found => write!(f, "found"),
            DetectionOutcome::Passed => write!(f, "passed"),
            DetectionOutcome::Failed(message) => write!(f, "failed ({message})"),
        }
    }
}

/// Partitioned outcomes of one item, as written when the item completes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub found: Vec<String>,
    pub passed: Vec<String>,
    pub failed: Vec<FailedExploit>,
}

impl ItemResult {
    pub fn passed_count(&self) -> usize {
        self.passed.len()
    }
}

/// Totals handed to the notifier once a scan completes without error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub scan_id: String,
    pub total_found: usize,
    pub total_passed: usize,
    pub total_failed: usize,
}

/// Persisted view of a scan answered to status polls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanStatus {
    pub scan_id: String,
    pub state: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub fail_message: Option<String>,
    pub items_total: usize,
    pub items_completed: usize,
}

impl ScanStatus {
    pub fn from_parts(scan: &Scan, items: &[ScanItem]) -> Self {
        Self {
            scan_id: scan.id.clone(),
            state: scan.state().to_string(),
            started_at: scan.started_at,
            completed_at: scan.completed_at,
            fail_message: scan.fail_message.clone(),
            items_total: items.len(),
            items_completed: items.iter().filter(|i| i.completed_at.is_some()).count(),
        }
    }
}
