use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::{PullRequest, PullRequestContent, SourceControlHost};
use crate::error::Result;
use crate::policy::{CheckRun, CheckState, CheckStatus};

/// Host that only logs what it would do and keeps PRs in memory.
///
/// Every PR reports a single green `dry-run` check and is mergeable, so the
/// full actor lifecycle can be exercised locally without credentials.
#[derive(Default)]
pub struct DryRunHost {
    open: Mutex<HashMap<(String, String), PullRequest>>,
    next_number: AtomicU64,
}

impl DryRunHost {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SourceControlHost for DryRunHost {
    async fn get_open_pull_request(
        &self,
        repo: &str,
        branch: &str,
    ) -> Result<Option<PullRequest>> {
        let open = self.open.lock().await;
        Ok(open.get(&(repo.to_string(), branch.to_string())).cloned())
    }

    async fn create_or_update_pull_request(
        &self,
        repo: &str,
        branch: &str,
        content: &PullRequestContent,
    ) -> Result<PullRequest> {
        let mut open = self.open.lock().await;
        let key = (repo.to_string(), branch.to_string());
        if let Some(pr) = open.get_mut(&key) {
            pr.title = content.title.clone();
            info!(repo, branch, number = pr.number, updates = content.updates.len(), "dry-run: update pull request");
            return Ok(pr.clone());
        }
        let number = self.next_number.fetch_add(1, Ordering::SeqCst) + 1;
        let pr = PullRequest {
            number,
            url: format!("dry-run://{repo}/pull/{number}"),
            repository: repo.to_string(),
            target_branch: branch.to_string(),
            head_branch: content.head_branch.clone(),
            title: content.title.clone(),
        };
        info!(repo, branch, number, updates = content.updates.len(), "dry-run: create pull request");
        open.insert(key, pr.clone());
        Ok(pr)
    }

    async fn attempt_merge(&self, pr: &PullRequest) -> Result<bool> {
        let mut open = self.open.lock().await;
        open.remove(&(pr.repository.clone(), pr.target_branch.clone()));
        info!(repo = %pr.repository, branch = %pr.target_branch, number = pr.number, "dry-run: merge pull request");
        Ok(true)
    }

    async fn get_check_status(&self, _pr: &PullRequest) -> Result<CheckState> {
        Ok(CheckState {
            checks: vec![CheckRun::new("dry-run", CheckStatus::Success)],
            approvals: 1,
            changes_requested: false,
            mergeable: Some(true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merge_closes_the_dry_run_pr() {
        let host = DryRunHost::new();
        let content = PullRequestContent {
            title: "t".into(),
            description: String::new(),
            head_branch: "h".into(),
            updates: vec![],
        };
        let pr = host
            .create_or_update_pull_request("repo", "main", &content)
            .await
            .unwrap();
        assert_eq!(pr.number, 1);
        assert!(host.attempt_merge(&pr).await.unwrap());
        assert!(host.get_open_pull_request("repo", "main").await.unwrap().is_none());
    }
}
