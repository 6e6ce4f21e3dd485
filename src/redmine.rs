use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

const API_KEY_HEADER: &str = "X-Redmine-API-Key";

/// Marker prepended to an issue's subject when the GitLab side of
/// onboarding failed and the issue was handed back (unassigned).
pub const GITLAB_FAILED_PREFIX: &str = "[GITLAB FAILED]";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamedRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedmineIssue {
    pub id: i64,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub project: NamedRef,
    pub status: NamedRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<NamedRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssueStatus {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct IssuesResponse {
    #[serde(default)]
    issues: Vec<RedmineIssue>,
}

#[derive(Debug, Deserialize)]
struct IssueStatusesResponse {
    #[serde(default)]
    issue_statuses: Vec<IssueStatus>,
}

/// The slice of the Redmine API the reconciliation engine consumes.
#[async_trait]
pub trait RedmineApi {
    /// Fetch all open issues assigned to the API key's identity.
    async fn fetch_assigned_issues(&self) -> Result<Vec<RedmineIssue>>;

    /// Fetch the full set of issue status definitions.
    async fn fetch_issue_statuses(&self) -> Result<Vec<IssueStatus>>;

    /// Transition a single issue to the given status.
    async fn update_issue_status(&self, issue_id: i64, status_id: i64) -> Result<()>;

    /// Prefix the issue's subject with [GITLAB FAILED] (exactly once) and
    /// clear its assignee, so the issue drops out of the assigned set.
    async fn mark_failed_and_unassign(&self, issue_id: i64, current_subject: &str) -> Result<()>;
}

#[async_trait]
impl<T: RedmineApi + Sync + Send> RedmineApi for Arc<T> {
    async fn fetch_assigned_issues(&self) -> Result<Vec<RedmineIssue>> {
        self.as_ref().fetch_assigned_issues().await
    }

    async fn fetch_issue_statuses(&self) -> Result<Vec<IssueStatus>> {
        self.as_ref().fetch_issue_statuses().await
    }

    async fn update_issue_status(&self, issue_id: i64, status_id: i64) -> Result<()> {
        self.as_ref().update_issue_status(issue_id, status_id).await
    }

    async fn mark_failed_and_unassign(&self, issue_id: i64, current_subject: &str) -> Result<()> {
        self.as_ref()
            .mark_failed_and_unassign(issue_id, current_subject)
            .await
    }
}

#[derive(Clone)]
pub struct RedmineClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RedmineClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn put_issue(&self, issue_id: i64, body: serde_json::Value) -> Result<()> {
        let url = format!("{}/issues/{}.json", self.base_url, issue_id);

        let response = self
            .client
            .put(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send issue update request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!("Redmine API error: {} - {}", status, error_text));
        }

        Ok(())
    }
}

#[async_trait]
impl RedmineApi for RedmineClient {
    async fn fetch_assigned_issues(&self) -> Result<Vec<RedmineIssue>> {
        let url = format!(
            "{}/issues.json?assigned_to_id=me&status_id=open",
            self.base_url
        );

        info!("Fetching assigned issues from Redmine...");

        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .context("Failed to send Redmine issues request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!("Redmine API error: {} - {}", status, error_text));
        }

        let body: IssuesResponse = response
            .json()
            .await
            .context("Failed to parse Redmine issues response")?;

        info!(
            "Fetched {} assigned issues from Redmine",
            body.issues.len()
        );
        Ok(body.issues)
    }

    async fn fetch_issue_statuses(&self) -> Result<Vec<IssueStatus>> {
        let url = format!("{}/issue_statuses.json", self.base_url);

        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .context("Failed to send issue statuses request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!("Redmine API error: {} - {}", status, error_text));
        }

        let body: IssueStatusesResponse = response
            .json()
            .await
            .context("Failed to parse issue statuses response")?;

        Ok(body.issue_statuses)
    }

    async fn update_issue_status(&self, issue_id: i64, status_id: i64) -> Result<()> {
        info!("Updating issue #{} status to {}", issue_id, status_id);
        self.put_issue(issue_id, json!({ "issue": { "status_id": status_id } }))
            .await
    }

    async fn mark_failed_and_unassign(&self, issue_id: i64, current_subject: &str) -> Result<()> {
        info!("Marking issue #{} as GitLab failed", issue_id);
        self.put_issue(
            issue_id,
            json!({
                "issue": {
                    "subject": failed_subject(current_subject),
                    "assigned_to_id": ""
                }
            }),
        )
        .await
    }
}

/// Prefix a subject with the failure marker. Applying this to an already
/// marked subject returns it unchanged, so repeated failures never stack
/// prefixes.
pub fn failed_subject(subject: &str) -> String {
    if subject.starts_with(GITLAB_FAILED_PREFIX) {
        subject.to_string()
    } else {
        format!("{} {}", GITLAB_FAILED_PREFIX, subject)
    }
}

/// Resolve the "in progress" status id from a list of status definitions.
///
/// Redmine installations name this status inconsistently, so the match is
/// case-insensitive over a small set of known spellings. Anything else
/// (e.g. "Doing") is treated as "no in-progress status available".
pub fn resolve_in_progress_id(statuses: &[IssueStatus]) -> Option<i64> {
    const IN_PROGRESS_NAMES: [&str; 3] = ["inprogress", "in progress", "in-progress"];

    statuses
        .iter()
        .find(|s| IN_PROGRESS_NAMES.contains(&s.name.to_lowercase().as_str()))
        .map(|s| s.id)
}

/// Process-local cache of Redmine status definitions.
///
/// Populated on the first cycle that manages to fetch the definitions and
/// kept for the process lifetime; a Redmine admin renaming statuses while
/// the watcher runs is a known staleness window. A failed fetch leaves
/// `last_fetched` unset so the next cycle retries.
#[derive(Debug, Default)]
pub struct StatusCache {
    pub statuses: Vec<IssueStatus>,
    pub in_progress_id: Option<i64>,
    pub last_fetched: Option<DateTime<Utc>>,
}

impl StatusCache {
    pub fn is_populated(&self) -> bool {
        self.last_fetched.is_some()
    }

    pub fn update(&mut self, statuses: Vec<IssueStatus>) {
        self.in_progress_id = resolve_in_progress_id(&statuses);
        self.statuses = statuses;
        self.last_fetched = Some(Utc::now());
    }
}
