use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PRIVATE_TOKEN_HEADER: &str = "PRIVATE-TOKEN";

/// Ref used when a project declares no default branch.
pub const DEFAULT_REF: &str = "main";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitLabProject {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub path_with_namespace: String,
    #[serde(default)]
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineTrigger {
    pub id: i64,
    #[serde(default)]
    pub description: Option<String>,
    pub token: String,
}

/// The slice of the GitLab API the reconciliation engine consumes.
#[async_trait]
pub trait GitLabApi {
    /// Search projects by name. Prefers a case-insensitive exact match on
    /// the project name or path; falls back to the first search result.
    async fn find_project_by_name(&self, project_name: &str) -> Result<Option<GitLabProject>>;

    /// Create a single-use pipeline trigger scoped to one project.
    async fn create_pipeline_trigger(
        &self,
        project_id: i64,
        description: &str,
    ) -> Result<PipelineTrigger>;

    /// Delete a pipeline trigger.
    async fn delete_pipeline_trigger(&self, project_id: i64, trigger_id: i64) -> Result<()>;

    /// Fire a pipeline on the given ref using a trigger token.
    async fn trigger_pipeline(
        &self,
        project_id: i64,
        token: &str,
        ref_name: &str,
        variables: &[(String, String)],
    ) -> Result<()>;
}

#[async_trait]
impl<T: GitLabApi + Sync + Send> GitLabApi for Arc<T> {
    async fn find_project_by_name(&self, project_name: &str) -> Result<Option<GitLabProject>> {
        self.as_ref().find_project_by_name(project_name).await
    }

    async fn create_pipeline_trigger(
        &self,
        project_id: i64,
        description: &str,
    ) -> Result<PipelineTrigger> {
        self.as_ref()
            .create_pipeline_trigger(project_id, description)
            .await
    }

    async fn delete_pipeline_trigger(&self, project_id: i64, trigger_id: i64) -> Result<()> {
        self.as_ref()
            .delete_pipeline_trigger(project_id, trigger_id)
            .await
    }

    async fn trigger_pipeline(
        &self,
        project_id: i64,
        token: &str,
        ref_name: &str,
        variables: &[(String, String)],
    ) -> Result<()> {
        self.as_ref()
            .trigger_pipeline(project_id, token, ref_name, variables)
            .await
    }
}

#[derive(Clone)]
pub struct GitLabClient {
    client: Client,
    base_url: String,
    token: String,
}

impl GitLabClient {
    pub fn new(base_url: String, token: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }
}

#[async_trait]
impl GitLabApi for GitLabClient {
    async fn find_project_by_name(&self, project_name: &str) -> Result<Option<GitLabProject>> {
        let url = format!("{}/projects", self.base_url);

        debug!("Searching for GitLab project: {}", project_name);

        let response = self
            .client
            .get(&url)
            .header(PRIVATE_TOKEN_HEADER, &self.token)
            .query(&[("search", project_name), ("per_page", "100")])
            .send()
            .await
            .context("Failed to send project search request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!("GitLab API error: {} - {}", status, error_text));
        }

        let projects: Vec<GitLabProject> = response
            .json()
            .await
            .context("Failed to parse project search response")?;

        let wanted = project_name.to_lowercase();
        if let Some(exact) = projects
            .iter()
            .find(|p| p.name.to_lowercase() == wanted || p.path.to_lowercase() == wanted)
        {
            info!(
                "Found exact GitLab project match: {} (ID: {})",
                exact.path_with_namespace, exact.id
            );
            return Ok(Some(exact.clone()));
        }

        match projects.into_iter().next() {
            Some(first) => {
                info!(
                    "Found similar GitLab project: {} (ID: {})",
                    first.path_with_namespace, first.id
                );
                Ok(Some(first))
            }
            None => {
                warn!("No GitLab project found for: {}", project_name);
                Ok(None)
            }
        }
    }

    async fn create_pipeline_trigger(
        &self,
        project_id: i64,
        description: &str,
    ) -> Result<PipelineTrigger> {
        let url = format!("{}/projects/{}/triggers", self.base_url, project_id);

        info!("Creating pipeline trigger for project ID {}...", project_id);

        let response = self
            .client
            .post(&url)
            .header(PRIVATE_TOKEN_HEADER, &self.token)
            .json(&json!({ "description": description }))
            .send()
            .await
            .context("Failed to send trigger creation request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!("GitLab API error: {} - {}", status, error_text));
        }

        let trigger: PipelineTrigger = response
            .json()
            .await
            .context("Failed to parse trigger response")?;

        info!(
            "Created pipeline trigger (ID: {}) for project {}",
            trigger.id, project_id
        );
        Ok(trigger)
    }

    async fn delete_pipeline_trigger(&self, project_id: i64, trigger_id: i64) -> Result<()> {
        let url = format!(
            "{}/projects/{}/triggers/{}",
            self.base_url, project_id, trigger_id
        );

        info!(
            "Deleting pipeline trigger {} from project {}...",
            trigger_id, project_id
        );

        let response = self
            .client
            .delete(&url)
            .header(PRIVATE_TOKEN_HEADER, &self.token)
            .send()
            .await
            .context("Failed to send trigger deletion request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!("GitLab API error: {} - {}", status, error_text));
        }

        info!(
            "Deleted pipeline trigger {} from project {}",
            trigger_id, project_id
        );
        Ok(())
    }

    async fn trigger_pipeline(
        &self,
        project_id: i64,
        token: &str,
        ref_name: &str,
        variables: &[(String, String)],
    ) -> Result<()> {
        let url = format!("{}/projects/{}/trigger/pipeline", self.base_url, project_id);

        info!(
            "Triggering pipeline for project {} on ref {}...",
            project_id, ref_name
        );

        let mut params: Vec<(String, String)> = vec![
            ("token".to_string(), token.to_string()),
            ("ref".to_string(), ref_name.to_string()),
        ];
        for (key, value) in variables {
            params.push((format!("variables[{}]", key), value.clone()));
        }

        let response = self
            .client
            .post(&url)
            .header(PRIVATE_TOKEN_HEADER, &self.token)
            .query(&params)
            .send()
            .await
            .context("Failed to send pipeline trigger request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!("GitLab API error: {} - {}", status, error_text));
        }

        info!("Pipeline triggered successfully for project {}", project_id);
        Ok(())
    }
}
