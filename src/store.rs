use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// One tracked issue and everything needed to clean up after it.
///
/// A record with no trigger fields means onboarding stopped partway
/// (no project match, or trigger creation failed); the issue is still
/// tracked so it is not re-processed every cycle, but offboarding has
/// nothing to delete. `trigger_id` set implies `gitlab_project_id` set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IssueRecord {
    pub issue_id: i64,
    pub project_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitlab_project_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitlab_project_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl IssueRecord {
    pub fn new(issue_id: i64, project_name: impl Into<String>) -> Self {
        Self {
            issue_id,
            project_name: project_name.into(),
            gitlab_project_id: None,
            gitlab_project_path: None,
            trigger_id: None,
            trigger_token: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnownIssuesData {
    issues: Vec<IssueRecord>,
}

/// Durable map of tracked issues, backed by a single JSON file.
///
/// Every mutation rewrites the whole file before returning, so the disk
/// copy never lags the in-memory state by more than the write in flight.
/// A failed write is logged loudly; the in-memory state stays
/// authoritative for the rest of the process lifetime.
pub struct KnownIssueStore {
    path: PathBuf,
    data: KnownIssuesData,
}

impl KnownIssueStore {
    /// Load the store from `path`, starting empty if the file is missing
    /// or unreadable. A legacy file holding a bare array of issue ids is
    /// upgraded in place and immediately rewritten in the current format.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        info!("Loading known issues from file: {}", path.display());

        let mut store = Self {
            path,
            data: KnownIssuesData::default(),
        };
        store.load_from_disk();
        store
    }

    fn load_from_disk(&mut self) {
        if !self.path.exists() {
            debug!("Known issues file does not exist yet, starting empty");
            return;
        }

        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Failed to load known issues file: {}", e);
                return;
            }
        };

        let parsed: serde_json::Value = match serde_json::from_str(&contents) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Failed to parse known issues file: {}", e);
                return;
            }
        };

        if parsed.is_array() {
            let ids: Vec<i64> = match serde_json::from_value(parsed) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!("Failed to parse legacy known issues list: {}", e);
                    return;
                }
            };

            info!("Migrating legacy known issues format ({} ids)", ids.len());
            self.data = KnownIssuesData {
                issues: ids
                    .into_iter()
                    .map(|id| IssueRecord::new(id, "unknown"))
                    .collect(),
            };
            self.save();
        } else {
            match serde_json::from_value(parsed) {
                Ok(data) => self.data = data,
                Err(e) => {
                    warn!("Failed to parse known issues file: {}", e);
                    return;
                }
            }
        }

        debug!("Loaded {} known issues from storage", self.data.issues.len());
    }

    fn save(&self) {
        let serialized = match serde_json::to_string_pretty(&self.data) {
            Ok(serialized) => serialized,
            Err(e) => {
                error!("Failed to serialize known issues: {}", e);
                return;
            }
        };

        if let Err(e) = fs::write(&self.path, serialized) {
            error!("Failed to save known issues file: {}", e);
        } else {
            debug!("Known issues saved to disk");
        }
    }

    pub fn get(&self, issue_id: i64) -> Option<&IssueRecord> {
        self.data.issues.iter().find(|r| r.issue_id == issue_id)
    }

    pub fn has(&self, issue_id: i64) -> bool {
        self.data.issues.iter().any(|r| r.issue_id == issue_id)
    }

    /// Add a record unless one with the same id already exists.
    /// First write wins; an existing record is never silently replaced.
    pub fn add(&mut self, record: IssueRecord) {
        if self.has(record.issue_id) {
            return;
        }
        info!("Added issue {} to storage", record.issue_id);
        self.data.issues.push(record);
        self.save();
    }

    /// Apply a partial update to an existing record. No-op if absent.
    pub fn update(&mut self, issue_id: i64, apply: impl FnOnce(&mut IssueRecord)) {
        let Some(record) = self
            .data
            .issues
            .iter_mut()
            .find(|r| r.issue_id == issue_id)
        else {
            return;
        };
        apply(record);
        self.save();
        debug!("Updated issue {} in storage", issue_id);
    }

    pub fn remove(&mut self, issue_id: i64) -> Option<IssueRecord> {
        let index = self
            .data
            .issues
            .iter()
            .position(|r| r.issue_id == issue_id)?;
        let removed = self.data.issues.remove(index);
        self.save();
        info!("Removed issue {} from storage", issue_id);
        Some(removed)
    }

    pub fn issue_ids(&self) -> HashSet<i64> {
        self.data.issues.iter().map(|r| r.issue_id).collect()
    }

    pub fn all(&self) -> &[IssueRecord] {
        &self.data.issues
    }

    pub fn len(&self) -> usize {
        self.data.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.issues.is_empty()
    }
}
