//! Append-only audit log of actor actions.
//!
//! `RepositoryHistoryItem` is the outward wire shape operators see. The
//! store keeps a `HistoryRecord` around it, which also holds the work item
//! that produced it so the `retry_url` can re-enqueue exactly that item.

use crate::error::Result;
use crate::queue::WorkItem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ACTION_UPDATE_ASSETS: &str = "UpdateAssets";
pub const ACTION_CHECK_PULL_REQUEST: &str = "CheckPullRequest";
pub const ACTION_DISPATCH: &str = "DispatchWorkItem";

// ---------------------------------------------------------------------------
// RepositoryHistoryItem
// ---------------------------------------------------------------------------

/// One attempted action against a target repository/branch. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryHistoryItem {
    #[serde(rename = "timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "success")]
    success: bool,
    #[serde(rename = "repositoryName")]
    repository_name: String,
    #[serde(rename = "branchName")]
    branch_name: String,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
    #[serde(rename = "action")]
    action: String,
    #[serde(rename = "retryUrl")]
    retry_url: Option<String>,
}

impl RepositoryHistoryItem {
    pub fn new(
        timestamp: DateTime<Utc>,
        success: bool,
        repository_name: impl Into<String>,
        branch_name: impl Into<String>,
        error_message: Option<String>,
        action: impl Into<String>,
        retry_url: Option<String>,
    ) -> Self {
        Self {
            timestamp,
            success,
            repository_name: repository_name.into(),
            branch_name: branch_name.into(),
            error_message,
            action: action.into(),
            retry_url,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn repository_name(&self) -> &str {
        &self.repository_name
    }

    pub fn branch_name(&self) -> &str {
        &self.branch_name
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn retry_url(&self) -> Option<&str> {
        self.retry_url.as_deref()
    }
}

// ---------------------------------------------------------------------------
// HistoryRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Uuid,
    #[serde(default)]
    pub subscription_id: Option<Uuid>,
    pub item: RepositoryHistoryItem,
    /// Non-error note, e.g. "policy rejected: …" or "already applied".
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
    /// Present on failures; what the retry URL re-enqueues.
    #[serde(default)]
    pub work_item: Option<WorkItem>,
}

/// Builder for the fields every record needs; keeps success and failure
/// construction in one place so the retry URL is only minted for failures.
pub struct HistoryDraft {
    pub subscription_id: Option<Uuid>,
    pub repository: String,
    pub branch: String,
    pub action: &'static str,
}

impl HistoryDraft {
    pub fn success(self, detail: Option<String>) -> HistoryRecord {
        HistoryRecord {
            id: Uuid::new_v4(),
            subscription_id: self.subscription_id,
            item: RepositoryHistoryItem::new(
                Utc::now(),
                true,
                self.repository,
                self.branch,
                None,
                self.action,
                None,
            ),
            detail,
            error_kind: None,
            work_item: None,
        }
    }

    pub fn failure(
        self,
        public_url: &str,
        error_kind: &str,
        message: impl Into<String>,
        work_item: Option<WorkItem>,
    ) -> HistoryRecord {
        let id = Uuid::new_v4();
        let retry_url = work_item.as_ref().map(|_| retry_url(public_url, id));
        HistoryRecord {
            id,
            subscription_id: self.subscription_id,
            item: RepositoryHistoryItem::new(
                Utc::now(),
                false,
                self.repository,
                self.branch,
                Some(message.into()),
                self.action,
                retry_url,
            ),
            detail: None,
            error_kind: Some(error_kind.to_string()),
            work_item,
        }
    }
}

pub fn retry_url(public_url: &str, id: Uuid) -> String {
    format!("{}/api/history/{id}/retry", public_url.trim_end_matches('/'))
}

// ---------------------------------------------------------------------------
// Recorder / query
// ---------------------------------------------------------------------------

/// Durable sink for history. Errors must reach the caller; an unrecorded
/// failure is invisible to operators.
pub trait HistoryRecorder: Send + Sync {
    fn record(&self, record: &HistoryRecord) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<Uuid>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn matches(&self, record: &HistoryRecord) -> bool {
        let repo_ok = match self.repository.as_deref() {
            Some(r) => record.item.repository_name() == r,
            None => true,
        };
        let branch_ok = match self.branch.as_deref() {
            Some(b) => record.item.branch_name() == b,
            None => true,
        };
        let sub_ok = match self.subscription_id {
            Some(s) => record.subscription_id == Some(s),
            None => true,
        };
        repo_ok && branch_ok && sub_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> HistoryDraft {
        HistoryDraft {
            subscription_id: None,
            repository: "target.repo".into(),
            branch: "target.branch".into(),
            action: ACTION_UPDATE_ASSETS,
        }
    }

    #[test]
    fn wire_shape_uses_camel_case_names() {
        let record = draft().failure("http://localhost:3150/", "host_rejected", "403", None);
        let json = serde_json::to_value(&record.item).unwrap();
        for key in [
            "timestamp",
            "success",
            "repositoryName",
            "branchName",
            "errorMessage",
            "action",
            "retryUrl",
        ] {
            assert!(json.get(key).is_some(), "missing {key} in {json}");
        }
        assert_eq!(json["success"], false);
        assert_eq!(json["errorMessage"], "403");
    }

    #[test]
    fn success_has_no_retry_url_or_error() {
        let record = draft().success(Some("merged".into()));
        assert!(record.item.success());
        assert!(record.item.retry_url().is_none());
        assert!(record.item.error_message().is_none());
        assert_eq!(record.detail.as_deref(), Some("merged"));
    }

    #[test]
    fn failure_with_work_item_gets_retry_url() {
        let item = WorkItem::pull_request_check(&crate::actor::ActorId::new(
            Uuid::new_v4(),
            "main",
        ));
        let record = draft().failure("http://localhost:3150/", "host_unavailable", "503", Some(item));
        let url = record.item.retry_url().unwrap();
        assert_eq!(
            url,
            format!("http://localhost:3150/api/history/{}/retry", record.id)
        );
    }

    #[test]
    fn query_filters_by_repository_and_branch() {
        let record = draft().success(None);
        let mut q = HistoryQuery::default();
        assert!(q.matches(&record));
        q.repository = Some("target.repo".into());
        assert!(q.matches(&record));
        q.branch = Some("other".into());
        assert!(!q.matches(&record));
    }
}
