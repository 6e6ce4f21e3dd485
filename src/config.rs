use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Clone)]
pub struct Config {
    pub redmine_url: String,
    pub redmine_api_key: String,
    pub gitlab_api_url: String,
    pub gitlab_private_token: String,
    /// Optional webhook to notify with each cycle's batch of new issues.
    /// Unset (or blank) disables the notification without being an error.
    pub webhook_url: Option<String>,
    /// Cron expression (with seconds field) driving the reconciliation cycle.
    pub cron_schedule: String,
    /// Path to the persisted known-issues file.
    pub known_issues_file: PathBuf,
    pub port: u16,
}

pub const DEFAULT_CRON_SCHEDULE: &str = "0 */5 * * * *";

impl Config {
    pub fn from_env() -> Result<Self> {
        let redmine_url = env::var("REDMINE_URL")
            .context("REDMINE_URL environment variable is required")?;

        let redmine_api_key = env::var("REDMINE_API_KEY")
            .context("REDMINE_API_KEY environment variable is required")?;

        let gitlab_api_url = env::var("GITLAB_API_URL")
            .context("GITLAB_API_URL environment variable is required")?;

        let gitlab_private_token = env::var("GITLAB_PRIVATE_TOKEN")
            .context("GITLAB_PRIVATE_TOKEN environment variable is required")?;

        let webhook_url = parse_webhook_url(env::var("WEBHOOK_URL").ok());

        let cron_schedule =
            env::var("CRON_SCHEDULE").unwrap_or_else(|_| DEFAULT_CRON_SCHEDULE.to_string());
        validate_schedule(&cron_schedule)?;

        let known_issues_file = env::var("KNOWN_ISSUES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("known_issues.json"));

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        Ok(Config {
            redmine_url,
            redmine_api_key,
            gitlab_api_url,
            gitlab_private_token,
            webhook_url,
            cron_schedule,
            known_issues_file,
            port,
        })
    }
}

/// Parse WEBHOOK_URL from an optional string value.
///
/// Returns None if the value is missing, empty, or contains only whitespace,
/// so a blank variable behaves the same as an unset one.
pub fn parse_webhook_url(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Validate a cron expression at startup so a bad schedule fails fast
/// instead of surfacing after the first cycle.
pub fn validate_schedule(expr: &str) -> Result<()> {
    cron::Schedule::from_str(expr)
        .map(|_| ())
        .with_context(|| format!("CRON_SCHEDULE is not a valid cron expression: {:?}", expr))
}
