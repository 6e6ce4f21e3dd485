//! The reconciliation cycle: diff the tracker's assigned-open set against
//! the persisted known set, onboard what is new, offboard what is gone.
//!
//! A cycle never fails as a whole. Every remote call is caught at the call
//! site and logged; an issue whose onboarding stalls partway is persisted
//! in whatever state it reached and picked up again by a later cycle's
//! re-diff (or by offboarding, once the tracker stops reporting it).

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

use crate::gitlab::{GitLabApi, DEFAULT_REF};
use crate::redmine::{RedmineApi, RedmineIssue, StatusCache};
use crate::store::{IssueRecord, KnownIssueStore};
use crate::webhook::WebhookNotifier;

/// Outcome counts for one reconciliation cycle.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CycleSummary {
    /// Issues seen for the first time this cycle.
    pub new_issues: usize,
    /// Previously tracked issues that left the assigned set.
    pub removed_issues: usize,
    /// New issues whose pipeline was fired.
    pub pipelines_fired: usize,
    /// New issues that stalled before a pipeline fired.
    pub failures: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum OnboardingOutcome {
    ProjectNotFound,
    TriggerCreateFailed,
    PipelineFireFailed,
    PipelineFired,
}

pub struct ReconciliationEngine<R, G> {
    redmine: R,
    gitlab: G,
    notifier: WebhookNotifier,
    store: KnownIssueStore,
    status_cache: StatusCache,
}

impl<R: RedmineApi, G: GitLabApi> ReconciliationEngine<R, G> {
    pub fn new(redmine: R, gitlab: G, notifier: WebhookNotifier, store: KnownIssueStore) -> Self {
        Self {
            redmine,
            gitlab,
            notifier,
            store,
            status_cache: StatusCache::default(),
        }
    }

    pub fn store(&self) -> &KnownIssueStore {
        &self.store
    }

    pub fn tracked_issues(&self) -> usize {
        self.store.len()
    }

    /// Run one reconciliation cycle. Reports outcome counts; never errors.
    pub async fn run_cycle(&mut self) -> CycleSummary {
        info!("Checking for new issues...");

        self.refresh_status_cache().await;

        let current = match self.redmine.fetch_assigned_issues().await {
            Ok(issues) => issues,
            Err(e) => {
                // Without the tracker's view there is no diff to act on.
                // Treating the fetch failure as an empty set would offboard
                // every tracked issue, so the cycle ends here instead.
                error!("Error fetching Redmine issues: {:#}", e);
                return CycleSummary::default();
            }
        };

        let current_ids: HashSet<i64> = current.iter().map(|i| i.id).collect();
        let known_ids = self.store.issue_ids();
        debug!("Current Redmine issues: {:?}", current_ids);
        debug!("Known issues: {:?}", known_ids);

        let new_issues: Vec<&RedmineIssue> = current
            .iter()
            .filter(|i| !known_ids.contains(&i.id))
            .collect();

        let mut summary = CycleSummary {
            new_issues: new_issues.len(),
            ..CycleSummary::default()
        };

        if new_issues.is_empty() {
            info!("No new issues found");
        } else {
            info!(
                "Found {} new issue(s): {:?}",
                new_issues.len(),
                new_issues.iter().map(|i| i.id).collect::<Vec<_>>()
            );

            for issue in &new_issues {
                match self.onboard_issue(issue).await {
                    OnboardingOutcome::PipelineFired => summary.pipelines_fired += 1,
                    _ => summary.failures += 1,
                }
            }

            let batch: Vec<RedmineIssue> = new_issues.into_iter().cloned().collect();
            match self.notifier.notify(&batch).await {
                Ok(true) => {
                    info!("Webhook notification sent for {} new issues", batch.len());
                }
                Ok(false) => {}
                Err(e) => error!("Error calling webhook: {:#}", e),
            }
        }

        let removed: Vec<i64> = known_ids
            .iter()
            .copied()
            .filter(|id| !current_ids.contains(id))
            .collect();
        summary.removed_issues = removed.len();

        if !removed.is_empty() {
            info!("Found {} removed issue(s): {:?}", removed.len(), removed);
            for issue_id in removed {
                self.offboard_issue(issue_id).await;
            }
        }

        info!(
            "Cycle complete: {} new, {} removed, {} pipeline(s) fired, {} failure(s)",
            summary.new_issues, summary.removed_issues, summary.pipelines_fired, summary.failures
        );
        summary
    }

    /// Resolve the in-progress status id once per process. A failed fetch
    /// leaves the cache unpopulated so the next cycle retries.
    async fn refresh_status_cache(&mut self) {
        if self.status_cache.is_populated() {
            return;
        }

        match self.redmine.fetch_issue_statuses().await {
            Ok(statuses) => {
                self.status_cache.update(statuses);
                match self.status_cache.in_progress_id {
                    Some(id) => info!("Resolved in-progress status id: {}", id),
                    None => warn!("No in-progress status found among Redmine issue statuses"),
                }
            }
            Err(e) => warn!("Failed to fetch Redmine issue statuses: {:#}", e),
        }
    }

    /// Onboard one newly observed issue: find the GitLab project, create an
    /// ephemeral trigger, fire the pipeline, update the tracker. Each step's
    /// failure short-circuits the rest; the record is stored in whatever
    /// state onboarding reached so the issue is not re-processed next cycle.
    async fn onboard_issue(&mut self, issue: &RedmineIssue) -> OnboardingOutcome {
        info!("Processing new issue #{}: {}", issue.id, issue.subject);

        let mut record = IssueRecord::new(issue.id, issue.project.name.clone());

        let project = match self.gitlab.find_project_by_name(&issue.project.name).await {
            Ok(Some(project)) => project,
            Ok(None) => {
                warn!(
                    "No GitLab project found for Redmine project: {}",
                    issue.project.name
                );
                self.store.add(record);
                return OnboardingOutcome::ProjectNotFound;
            }
            Err(e) => {
                error!(
                    "Error searching for GitLab project {:?}: {:#}",
                    issue.project.name, e
                );
                self.store.add(record);
                return OnboardingOutcome::ProjectNotFound;
            }
        };

        record.gitlab_project_id = Some(project.id);
        record.gitlab_project_path = Some(project.path_with_namespace.clone());

        let description = format!("Redmine Issue #{}: {}", issue.id, issue.subject);
        let trigger = match self
            .gitlab
            .create_pipeline_trigger(project.id, &description)
            .await
        {
            Ok(trigger) => trigger,
            Err(e) => {
                error!(
                    "Failed to create pipeline trigger for issue #{}: {:#}",
                    issue.id, e
                );
                self.store.add(record);
                return OnboardingOutcome::TriggerCreateFailed;
            }
        };

        record.trigger_id = Some(trigger.id);
        record.trigger_token = Some(trigger.token.clone());

        let ref_name = project.default_branch.as_deref().unwrap_or(DEFAULT_REF);
        let variables = pipeline_variables(issue);

        let outcome = match self
            .gitlab
            .trigger_pipeline(project.id, &trigger.token, ref_name, &variables)
            .await
        {
            Ok(()) => {
                info!("Pipeline triggered successfully for issue #{}", issue.id);
                self.transition_to_in_progress(issue.id).await;
                OnboardingOutcome::PipelineFired
            }
            Err(e) => {
                error!("Failed to trigger pipeline for issue #{}: {:#}", issue.id, e);

                // Hand the issue back: marked and unassigned, it leaves the
                // assigned set and next cycle's offboarding deletes the
                // now-orphaned trigger recorded below.
                match self
                    .redmine
                    .mark_failed_and_unassign(issue.id, &issue.subject)
                    .await
                {
                    Ok(()) => {
                        info!("Issue #{} marked as GitLab failed and unassigned", issue.id);
                    }
                    Err(e) => {
                        error!("Failed to mark issue #{} as GitLab failed: {:#}", issue.id, e);
                    }
                }
                OnboardingOutcome::PipelineFireFailed
            }
        };

        self.store.add(record);
        outcome
    }

    async fn transition_to_in_progress(&self, issue_id: i64) {
        let Some(status_id) = self.status_cache.in_progress_id else {
            warn!(
                "In-progress status id not available, skipping status update for issue #{}",
                issue_id
            );
            return;
        };

        match self.redmine.update_issue_status(issue_id, status_id).await {
            Ok(()) => info!("Issue #{} status updated to in progress", issue_id),
            Err(e) => warn!("Failed to update issue #{} status: {:#}", issue_id, e),
        }
    }

    /// Offboard one issue that disappeared from the assigned set: delete
    /// its ephemeral trigger if one was created, then drop the record.
    /// Trigger deletion is best-effort; the record is removed regardless.
    async fn offboard_issue(&mut self, issue_id: i64) {
        info!("Processing removed issue #{}", issue_id);

        let Some(record) = self.store.get(issue_id).cloned() else {
            warn!("Issue #{} not found in storage", issue_id);
            return;
        };

        if let (Some(project_id), Some(trigger_id)) = (record.gitlab_project_id, record.trigger_id)
        {
            info!(
                "Cleaning up pipeline trigger {} for issue #{} from project {}",
                trigger_id,
                issue_id,
                record.gitlab_project_path.as_deref().unwrap_or("?")
            );

            if let Err(e) = self.gitlab.delete_pipeline_trigger(project_id, trigger_id).await {
                error!(
                    "Failed to delete pipeline trigger for issue #{}: {:#}",
                    issue_id, e
                );
            }
        }

        self.store.remove(issue_id);
    }
}

/// Variables handed to the fired pipeline so it has the issue's full
/// context without a callback to Redmine.
fn pipeline_variables(issue: &RedmineIssue) -> Vec<(String, String)> {
    vec![
        ("REDMINE_ISSUE_TITLE".to_string(), issue.subject.clone()),
        (
            "REDMINE_ISSUE_DESCRIPTION".to_string(),
            issue.description.clone().unwrap_or_default(),
        ),
        ("REDMINE_ISSUE_ID".to_string(), issue.id.to_string()),
    ]
}
