use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::redmine::RedmineIssue;

/// Best-effort notification of new issues to an optional webhook.
///
/// The notification never influences per-issue state: a failed POST is an
/// error for the caller to log, nothing more.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// POST the batch of new issues. Returns Ok(false) when no webhook is
    /// configured, Ok(true) on a successful delivery.
    pub async fn notify(&self, issues: &[RedmineIssue]) -> Result<bool> {
        let Some(url) = &self.url else {
            warn!("WEBHOOK_URL is not defined. Skipping webhook call.");
            return Ok(false);
        };

        info!("Calling webhook: {} with {} new issues", url, issues.len());

        let response = self
            .client
            .post(url)
            .json(&json!({ "issues": issues }))
            .send()
            .await
            .context("Failed to send webhook request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!("Webhook error: {} - {}", status, error_text));
        }

        info!(
            "Webhook called for new issues: {:?}",
            issues.iter().map(|i| i.id).collect::<Vec<_>>()
        );
        Ok(true)
    }
}
