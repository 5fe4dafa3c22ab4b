//! Completion emails through the Mailgun messages API

use super::Notifier;
use crate::config::MailgunConfig;
use crate::error::{Result, VscannerError};
use crate::models::CompletionReport;
use async_trait::async_trait;
use reqwest::multipart::Form;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const SUBJECT: &str = "Scan completed";

/// Sends one email per completed scan
pub struct MailgunNotifier {
    client: Client,
    config: MailgunConfig,
}

impl MailgunNotifier {
    pub fn new(config: MailgunConfig) -> Result<Self> {
        if config.api_key.is_none() {
            return Err(VscannerError::ConfigError(
                "Mailgun API key is not set (MAILGUN_API_KEY)".to_string(),
            ));
        }
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v3/{}/messages",
            self.config.api_base.trim_end_matches('/'),
            self.config.domain
        )
    }
}

/// Plain-text body of the completion email
pub fn text_body(report: &CompletionReport, results_url: &str) -> String {
    format!(
        "Scan Results Summary\n\
         -------------------\n\
         Scan ID: {}\n\
         Found Vulnerabilities: {}\n\
         Passed Tests: {}\n\
         Failed Tests: {}\n\
         \n\
         View detailed results at: {}\n",
        report.scan_id, report.total_found, report.total_passed, report.total_failed, results_url
    )
}

/// HTML body of the completion email
pub fn html_body(report: &CompletionReport, results_url: &str) -> String {
    format!(
        r#"<div style="font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h1 style="color: #2c3e50; border-bottom: 2px solid #3498db; padding-bottom: 10px;">Scan Results Summary</h1>
    <div style="background: #f8f9fa; padding: 20px; border-radius: 5px; margin: 20px 0;">
        <p style="margin: 5px 0;"><strong>Scan ID:</strong> {}</p>
        <p style="margin: 5px 0;"><strong>Found Vulnerabilities:</strong> {}</p>
        <p style="margin: 5px 0;"><strong>Passed Tests:</strong> {}</p>
        <p style="margin: 5px 0;"><strong>Failed Tests:</strong> {}</p>
    </div>
    <p style="text-align: center;">
        <a href="{}" style="background: #3498db; color: white; padding: 10px 20px; text-decoration: none; border-radius: 5px; display: inline-block;">View Detailed Results</a>
    </p>
</div>"#,
        html_escape(&report.scan_id),
        report.total_found,
        report.total_passed,
        report.total_failed,
        html_escape(results_url)
    )
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[async_trait]
impl Notifier for MailgunNotifier {
    fn name(&self) -> &str {
        "mailgun"
    }

    async fn notify(&self, report: &CompletionReport) -> Result<()> {
        let api_key = self.config.api_key.clone().unwrap_or_default();

        let mut form = Form::new()
            .text("from", self.config.from.clone())
            .text("subject", SUBJECT)
            .text("text", text_body(report, &self.config.results_url))
            .text("html", html_body(report, &self.config.results_url));
        for recipient in &self.config.to {
            form = form.text("to", recipient.clone());
        }

        let response = self
            .client
            .post(self.endpoint())
            .basic_auth("api", Some(api_key))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VscannerError::NotifyError(format!(
                "Mailgun responded {status}: {}",
                body.trim()
            )));
        }

        debug!("Completion email for scan {} accepted", report.scan_id);
        Ok(())
    }
}
