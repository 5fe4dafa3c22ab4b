//! Completion notifications

pub mod mailgun;

pub use mailgun::MailgunNotifier;

use crate::config::MailgunConfig;
use crate::error::Result;
use crate::models::CompletionReport;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Receives the totals of a scan that completed without error
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, report: &CompletionReport) -> Result<()>;
}

/// Notifier used when no transport is configured; records the totals in the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, report: &CompletionReport) -> Result<()> {
        info!(
            "Scan {} completed: {} found, {} passed, {} failed",
            report.scan_id, report.total_found, report.total_passed, report.total_failed
        );
        Ok(())
    }
}

/// Picks Mailgun when it has an API key and recipients, the log otherwise
pub fn from_config(config: &MailgunConfig) -> Result<Arc<dyn Notifier>> {
    match (&config.api_key, config.to.is_empty()) {
        (Some(_), false) => Ok(Arc::new(MailgunNotifier::new(config.clone())?)),
        (Some(_), true) => {
            warn!("MAILGUN_API_KEY is set but mailgun.to is empty, completion emails disabled");
            Ok(Arc::new(LogNotifier))
        }
        (None, _) => Ok(Arc::new(LogNotifier)),
    }
}
