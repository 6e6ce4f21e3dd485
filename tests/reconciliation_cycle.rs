//! End-to-end reconciliation cycles driven by in-memory collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tempfile::TempDir;

use redmine_watcher::gitlab::{GitLabApi, GitLabProject, PipelineTrigger};
use redmine_watcher::reconciliation::ReconciliationEngine;
use redmine_watcher::redmine::{IssueStatus, NamedRef, RedmineApi, RedmineIssue};
use redmine_watcher::store::{IssueRecord, KnownIssueStore};
use redmine_watcher::webhook::WebhookNotifier;

#[derive(Default)]
struct FakeRedmine {
    issues: Mutex<Vec<RedmineIssue>>,
    statuses: Mutex<Vec<IssueStatus>>,
    fail_fetch: AtomicBool,
    fail_statuses: AtomicBool,
    status_updates: Mutex<Vec<(i64, i64)>>,
    failure_marks: Mutex<Vec<(i64, String)>>,
}

impl FakeRedmine {
    fn set_issues(&self, issues: Vec<RedmineIssue>) {
        *self.issues.lock().unwrap() = issues;
    }

    fn set_statuses(&self, statuses: Vec<IssueStatus>) {
        *self.statuses.lock().unwrap() = statuses;
    }
}

#[async_trait]
impl RedmineApi for FakeRedmine {
    async fn fetch_assigned_issues(&self) -> Result<Vec<RedmineIssue>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(anyhow!("redmine unreachable"));
        }
        Ok(self.issues.lock().unwrap().clone())
    }

    async fn fetch_issue_statuses(&self) -> Result<Vec<IssueStatus>> {
        if self.fail_statuses.load(Ordering::SeqCst) {
            return Err(anyhow!("redmine unreachable"));
        }
        Ok(self.statuses.lock().unwrap().clone())
    }

    async fn update_issue_status(&self, issue_id: i64, status_id: i64) -> Result<()> {
        self.status_updates.lock().unwrap().push((issue_id, status_id));
        Ok(())
    }

    async fn mark_failed_and_unassign(&self, issue_id: i64, current_subject: &str) -> Result<()> {
        self.failure_marks
            .lock()
            .unwrap()
            .push((issue_id, current_subject.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct FakeGitLab {
    projects: Mutex<HashMap<String, GitLabProject>>,
    fail_trigger_create: AtomicBool,
    fail_pipeline: AtomicBool,
    fail_trigger_delete: AtomicBool,
    next_trigger_id: AtomicI64,
    created_triggers: Mutex<Vec<(i64, String)>>,
    deleted_triggers: Mutex<Vec<(i64, i64)>>,
    fired_pipelines: Mutex<Vec<(i64, String, String, Vec<(String, String)>)>>,
}

impl FakeGitLab {
    fn add_project(&self, project: GitLabProject) {
        self.projects
            .lock()
            .unwrap()
            .insert(project.name.to_lowercase(), project);
    }
}

#[async_trait]
impl GitLabApi for FakeGitLab {
    async fn find_project_by_name(&self, project_name: &str) -> Result<Option<GitLabProject>> {
        Ok(self
            .projects
            .lock()
            .unwrap()
            .get(&project_name.to_lowercase())
            .cloned())
    }

    async fn create_pipeline_trigger(
        &self,
        project_id: i64,
        description: &str,
    ) -> Result<PipelineTrigger> {
        if self.fail_trigger_create.load(Ordering::SeqCst) {
            return Err(anyhow!("trigger creation refused"));
        }
        let id = 1000 + self.next_trigger_id.fetch_add(1, Ordering::SeqCst);
        self.created_triggers
            .lock()
            .unwrap()
            .push((project_id, description.to_string()));
        Ok(PipelineTrigger {
            id,
            description: Some(description.to_string()),
            token: format!("trigger-token-{}", id),
        })
    }

    async fn delete_pipeline_trigger(&self, project_id: i64, trigger_id: i64) -> Result<()> {
        self.deleted_triggers
            .lock()
            .unwrap()
            .push((project_id, trigger_id));
        if self.fail_trigger_delete.load(Ordering::SeqCst) {
            return Err(anyhow!("trigger already gone"));
        }
        Ok(())
    }

    async fn trigger_pipeline(
        &self,
        project_id: i64,
        token: &str,
        ref_name: &str,
        variables: &[(String, String)],
    ) -> Result<()> {
        if self.fail_pipeline.load(Ordering::SeqCst) {
            return Err(anyhow!("pipeline refused"));
        }
        self.fired_pipelines.lock().unwrap().push((
            project_id,
            token.to_string(),
            ref_name.to_string(),
            variables.to_vec(),
        ));
        Ok(())
    }
}

fn issue(id: i64, subject: &str, project_name: &str) -> RedmineIssue {
    RedmineIssue {
        id,
        subject: subject.to_string(),
        description: Some(format!("Description of {}", subject)),
        project: NamedRef {
            id: 1,
            name: project_name.to_string(),
        },
        status: NamedRef {
            id: 1,
            name: "New".to_string(),
        },
        assigned_to: Some(NamedRef {
            id: 5,
            name: "CI Bot".to_string(),
        }),
    }
}

fn project(id: i64, name: &str) -> GitLabProject {
    GitLabProject {
        id,
        name: name.to_string(),
        path: name.to_lowercase(),
        path_with_namespace: format!("group/{}", name.to_lowercase()),
        default_branch: Some("main".to_string()),
    }
}

fn engine_in(
    dir: &TempDir,
    redmine: Arc<FakeRedmine>,
    gitlab: Arc<FakeGitLab>,
) -> ReconciliationEngine<Arc<FakeRedmine>, Arc<FakeGitLab>> {
    let store = KnownIssueStore::load(dir.path().join("known_issues.json"));
    ReconciliationEngine::new(redmine, gitlab, WebhookNotifier::disabled(), store)
}

#[tokio::test]
async fn new_issues_onboard_with_partial_project_match() {
    let dir = TempDir::new().unwrap();
    let redmine = Arc::new(FakeRedmine::default());
    let gitlab = Arc::new(FakeGitLab::default());

    redmine.set_issues(vec![
        issue(101, "Fix the build", "widgets"),
        issue(102, "Write the docs", "gadgets"),
    ]);
    gitlab.add_project(project(42, "widgets"));

    let mut engine = engine_in(&dir, redmine.clone(), gitlab.clone());
    let summary = engine.run_cycle().await;

    assert_eq!(summary.new_issues, 2);
    assert_eq!(summary.pipelines_fired, 1);
    assert_eq!(summary.failures, 1);
    assert_eq!(summary.removed_issues, 0);

    // 101: fully onboarded, trigger fields set
    let record = engine.store().get(101).unwrap();
    assert_eq!(record.gitlab_project_id, Some(42));
    assert_eq!(record.gitlab_project_path.as_deref(), Some("group/widgets"));
    assert!(record.trigger_id.is_some());
    assert!(record.trigger_token.is_some());

    // 102: no project match, identity fields only
    let record = engine.store().get(102).unwrap();
    assert_eq!(record.project_name, "gadgets");
    assert!(record.gitlab_project_id.is_none());
    assert!(record.trigger_id.is_none());

    // The trigger description references the issue
    let created = gitlab.created_triggers.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].0, 42);
    assert_eq!(created[0].1, "Redmine Issue #101: Fix the build");

    // The pipeline carried the issue context on the default branch
    let fired = gitlab.fired_pipelines.lock().unwrap();
    assert_eq!(fired.len(), 1);
    let (project_id, _token, ref_name, variables) = &fired[0];
    assert_eq!(*project_id, 42);
    assert_eq!(ref_name, "main");
    assert!(variables.contains(&(
        "REDMINE_ISSUE_TITLE".to_string(),
        "Fix the build".to_string()
    )));
    assert!(variables.contains(&("REDMINE_ISSUE_ID".to_string(), "101".to_string())));
}

#[tokio::test]
async fn second_cycle_does_not_reonboard_known_issues() {
    let dir = TempDir::new().unwrap();
    let redmine = Arc::new(FakeRedmine::default());
    let gitlab = Arc::new(FakeGitLab::default());

    redmine.set_issues(vec![issue(101, "Fix the build", "widgets")]);
    gitlab.add_project(project(42, "widgets"));

    let mut engine = engine_in(&dir, redmine.clone(), gitlab.clone());
    let first = engine.run_cycle().await;
    assert_eq!(first.new_issues, 1);

    let second = engine.run_cycle().await;
    assert_eq!(second.new_issues, 0);
    assert_eq!(second.removed_issues, 0);

    // Exactly one trigger and one pipeline across both cycles
    assert_eq!(gitlab.created_triggers.lock().unwrap().len(), 1);
    assert_eq!(gitlab.fired_pipelines.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn removed_issue_offboards_and_deletes_trigger() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("known_issues.json");

    // Seed the store with two previously onboarded issues
    {
        let mut store = KnownIssueStore::load(&path);
        let mut record = IssueRecord::new(101, "widgets");
        record.gitlab_project_id = Some(42);
        record.trigger_id = Some(1000);
        record.trigger_token = Some("trigger-token-1000".to_string());
        store.add(record);

        let mut record = IssueRecord::new(102, "gadgets");
        record.gitlab_project_id = Some(43);
        record.gitlab_project_path = Some("group/gadgets".to_string());
        record.trigger_id = Some(1001);
        record.trigger_token = Some("trigger-token-1001".to_string());
        store.add(record);
    }

    let redmine = Arc::new(FakeRedmine::default());
    let gitlab = Arc::new(FakeGitLab::default());
    redmine.set_issues(vec![issue(101, "Fix the build", "widgets")]);

    let store = KnownIssueStore::load(&path);
    let mut engine =
        ReconciliationEngine::new(redmine, gitlab.clone(), WebhookNotifier::disabled(), store);
    let summary = engine.run_cycle().await;

    assert_eq!(summary.new_issues, 0);
    assert_eq!(summary.removed_issues, 1);
    assert!(engine.store().has(101));
    assert!(!engine.store().has(102));

    let deleted = gitlab.deleted_triggers.lock().unwrap();
    assert_eq!(deleted.as_slice(), &[(43, 1001)]);
}

#[tokio::test]
async fn record_is_removed_even_when_trigger_deletion_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("known_issues.json");

    {
        let mut store = KnownIssueStore::load(&path);
        let mut record = IssueRecord::new(102, "gadgets");
        record.gitlab_project_id = Some(43);
        record.trigger_id = Some(1001);
        record.trigger_token = Some("trigger-token-1001".to_string());
        store.add(record);
    }

    let redmine = Arc::new(FakeRedmine::default());
    let gitlab = Arc::new(FakeGitLab::default());
    gitlab.fail_trigger_delete.store(true, Ordering::SeqCst);

    let store = KnownIssueStore::load(&path);
    let mut engine =
        ReconciliationEngine::new(redmine, gitlab.clone(), WebhookNotifier::disabled(), store);
    engine.run_cycle().await;

    assert!(!engine.store().has(102));
    // Deletion was attempted
    assert_eq!(gitlab.deleted_triggers.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn offboarding_without_trigger_fields_skips_deletion() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("known_issues.json");

    {
        let mut store = KnownIssueStore::load(&path);
        store.add(IssueRecord::new(102, "gadgets"));
    }

    let redmine = Arc::new(FakeRedmine::default());
    let gitlab = Arc::new(FakeGitLab::default());

    let store = KnownIssueStore::load(&path);
    let mut engine =
        ReconciliationEngine::new(redmine, gitlab.clone(), WebhookNotifier::disabled(), store);
    engine.run_cycle().await;

    assert!(!engine.store().has(102));
    assert!(gitlab.deleted_triggers.lock().unwrap().is_empty());
}

#[tokio::test]
async fn pipeline_failure_marks_issue_and_keeps_trigger_fields() {
    let dir = TempDir::new().unwrap();
    let redmine = Arc::new(FakeRedmine::default());
    let gitlab = Arc::new(FakeGitLab::default());

    redmine.set_issues(vec![issue(103, "Fix the build", "widgets")]);
    redmine.set_statuses(vec![
        IssueStatus {
            id: 1,
            name: "New".to_string(),
        },
        IssueStatus {
            id: 2,
            name: "In Progress".to_string(),
        },
    ]);
    gitlab.add_project(project(42, "widgets"));
    gitlab.fail_pipeline.store(true, Ordering::SeqCst);

    let mut engine = engine_in(&dir, redmine.clone(), gitlab.clone());
    let summary = engine.run_cycle().await;

    assert_eq!(summary.pipelines_fired, 0);
    assert_eq!(summary.failures, 1);

    // The issue was handed back to the tracker...
    let marks = redmine.failure_marks.lock().unwrap();
    assert_eq!(marks.as_slice(), &[(103, "Fix the build".to_string())]);
    // ...and never transitioned to in-progress
    assert!(redmine.status_updates.lock().unwrap().is_empty());

    // The record keeps the trigger fields so the orphaned trigger is
    // cleaned up once the issue leaves the assigned set
    let record = engine.store().get(103).unwrap();
    assert_eq!(record.gitlab_project_id, Some(42));
    assert!(record.trigger_id.is_some());
    assert!(record.trigger_token.is_some());
}

#[tokio::test]
async fn trigger_creation_failure_stores_project_fields_without_marking() {
    let dir = TempDir::new().unwrap();
    let redmine = Arc::new(FakeRedmine::default());
    let gitlab = Arc::new(FakeGitLab::default());

    redmine.set_issues(vec![issue(104, "Fix the build", "widgets")]);
    gitlab.add_project(project(42, "widgets"));
    gitlab.fail_trigger_create.store(true, Ordering::SeqCst);

    let mut engine = engine_in(&dir, redmine.clone(), gitlab.clone());
    let summary = engine.run_cycle().await;

    assert_eq!(summary.failures, 1);

    let record = engine.store().get(104).unwrap();
    assert_eq!(record.gitlab_project_id, Some(42));
    assert!(record.trigger_id.is_none());

    // Only a pipeline-fire failure hands the issue back
    assert!(redmine.failure_marks.lock().unwrap().is_empty());
    assert!(gitlab.fired_pipelines.lock().unwrap().is_empty());
}

#[tokio::test]
async fn successful_onboarding_transitions_issue_to_in_progress() {
    let dir = TempDir::new().unwrap();
    let redmine = Arc::new(FakeRedmine::default());
    let gitlab = Arc::new(FakeGitLab::default());

    redmine.set_issues(vec![issue(101, "Fix the build", "widgets")]);
    redmine.set_statuses(vec![
        IssueStatus {
            id: 1,
            name: "New".to_string(),
        },
        IssueStatus {
            id: 2,
            name: "In Progress".to_string(),
        },
    ]);
    gitlab.add_project(project(42, "widgets"));

    let mut engine = engine_in(&dir, redmine.clone(), gitlab.clone());
    engine.run_cycle().await;

    let updates = redmine.status_updates.lock().unwrap();
    assert_eq!(updates.as_slice(), &[(101, 2)]);
}

#[tokio::test]
async fn missing_in_progress_status_skips_transition_but_fires_pipeline() {
    let dir = TempDir::new().unwrap();
    let redmine = Arc::new(FakeRedmine::default());
    let gitlab = Arc::new(FakeGitLab::default());

    redmine.set_issues(vec![issue(101, "Fix the build", "widgets")]);
    redmine.set_statuses(vec![IssueStatus {
        id: 2,
        name: "Doing".to_string(),
    }]);
    gitlab.add_project(project(42, "widgets"));

    let mut engine = engine_in(&dir, redmine.clone(), gitlab.clone());
    let summary = engine.run_cycle().await;

    assert_eq!(summary.pipelines_fired, 1);
    assert!(redmine.status_updates.lock().unwrap().is_empty());
}

#[tokio::test]
async fn status_fetch_failure_is_retried_on_next_cycle() {
    let dir = TempDir::new().unwrap();
    let redmine = Arc::new(FakeRedmine::default());
    let gitlab = Arc::new(FakeGitLab::default());

    redmine.set_statuses(vec![IssueStatus {
        id: 2,
        name: "In Progress".to_string(),
    }]);
    redmine.fail_statuses.store(true, Ordering::SeqCst);
    gitlab.add_project(project(42, "widgets"));

    let mut engine = engine_in(&dir, redmine.clone(), gitlab.clone());
    engine.run_cycle().await;

    // Statuses become reachable; a new issue onboarded on the next cycle
    // gets the transition because the cache retried the fetch.
    redmine.fail_statuses.store(false, Ordering::SeqCst);
    redmine.set_issues(vec![issue(101, "Fix the build", "widgets")]);
    engine.run_cycle().await;

    let updates = redmine.status_updates.lock().unwrap();
    assert_eq!(updates.as_slice(), &[(101, 2)]);
}

#[tokio::test]
async fn tracker_fetch_failure_aborts_cycle_without_offboarding() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("known_issues.json");

    {
        let mut store = KnownIssueStore::load(&path);
        store.add(IssueRecord::new(101, "widgets"));
    }

    let redmine = Arc::new(FakeRedmine::default());
    let gitlab = Arc::new(FakeGitLab::default());
    redmine.fail_fetch.store(true, Ordering::SeqCst);

    let store = KnownIssueStore::load(&path);
    let mut engine =
        ReconciliationEngine::new(redmine, gitlab.clone(), WebhookNotifier::disabled(), store);
    let summary = engine.run_cycle().await;

    assert_eq!(summary.new_issues, 0);
    assert_eq!(summary.removed_issues, 0);
    // Known issues are untouched: an unreachable tracker is not the same
    // as an empty assignment list.
    assert!(engine.store().has(101));
    assert!(gitlab.deleted_triggers.lock().unwrap().is_empty());
}

#[tokio::test]
async fn diff_splits_current_and_known_into_new_and_removed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("known_issues.json");

    {
        let mut store = KnownIssueStore::load(&path);
        store.add(IssueRecord::new(2, "widgets"));
        store.add(IssueRecord::new(3, "widgets"));
        store.add(IssueRecord::new(4, "widgets"));
    }

    let redmine = Arc::new(FakeRedmine::default());
    let gitlab = Arc::new(FakeGitLab::default());
    redmine.set_issues(vec![
        issue(1, "One", "widgets"),
        issue(2, "Two", "widgets"),
        issue(3, "Three", "widgets"),
    ]);

    let store = KnownIssueStore::load(&path);
    let mut engine =
        ReconciliationEngine::new(redmine, gitlab, WebhookNotifier::disabled(), store);
    let summary = engine.run_cycle().await;

    // new = {1}, removed = {4}, intersection {2, 3} untouched
    assert_eq!(summary.new_issues, 1);
    assert_eq!(summary.removed_issues, 1);
    let ids = engine.store().issue_ids();
    assert_eq!(ids, [1, 2, 3].into_iter().collect());
}

#[tokio::test]
async fn webhook_receives_one_batch_per_cycle_with_new_issues() {
    use httpmock::prelude::*;

    let dir = TempDir::new().unwrap();
    let server = MockServer::start();
    let hook = server.mock(|when, then| {
        when.method(POST)
            .path("/hook")
            .json_body_partial(r#"{ "issues": [{ "id": 101 }] }"#);
        then.status(200);
    });

    let redmine = Arc::new(FakeRedmine::default());
    let gitlab = Arc::new(FakeGitLab::default());
    redmine.set_issues(vec![issue(101, "Fix the build", "widgets")]);
    gitlab.add_project(project(42, "widgets"));

    let store = KnownIssueStore::load(dir.path().join("known_issues.json"));
    let notifier = WebhookNotifier::new(Some(server.url("/hook")));
    let mut engine = ReconciliationEngine::new(redmine, gitlab, notifier, store);

    engine.run_cycle().await;
    hook.assert();

    // No new issues on the second cycle: the webhook is not called again
    engine.run_cycle().await;
    assert_eq!(hook.hits(), 1);
}
