//! Outcome partitioning and scan-wide totals

use crate::models::{CompletionReport, DetectionOutcome, FailedExploit, ItemResult};

/// Splits an item's ordered outcomes into found, passed and failed
pub fn partition<I>(outcomes: I) -> ItemResult
where
    I: IntoIterator<Item = (String, DetectionOutcome)>,
{
    let mut result = ItemResult::default();
    for (id, outcome) in outcomes {
        match outcome {
            DetectionOutcome::Found => result.found.push(id),
            DetectionOutcome::Passed => result.passed.push(id),
            DetectionOutcome::Failed(message) => result.failed.push(FailedExploit { id, message }),
        }
    }
    result
}

/// Running totals across every item of a scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanTotals {
    pub found: usize,
    pub passed: usize,
    pub failed: usize,
}

impl ScanTotals {
    /// Adds the contribution of a freshly evaluated item
    pub fn add(&mut self, result: &ItemResult) {
        self.found += result.found.len();
        self.passed += result.passed.len();
        self.failed += result.failed.len();
    }

    pub fn report(&self, scan_id: &str) -> CompletionReport {
        CompletionReport {
            scan_id: scan_id.to_string(),
            total_found: self.found,
            total_passed: self.passed,
            total_failed: self.failed,
        }
    }
}
