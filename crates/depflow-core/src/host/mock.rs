use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{PullRequest, PullRequestContent, SourceControlHost};
use crate::error::{FlowError, Result};
use crate::policy::CheckState;

/// Host method names as recorded in the call log.
pub const GET_OPEN_PULL_REQUEST: &str = "get_open_pull_request";
pub const CREATE_OR_UPDATE_PULL_REQUEST: &str = "create_or_update_pull_request";
pub const ATTEMPT_MERGE: &str = "attempt_merge";
pub const GET_CHECK_STATUS: &str = "get_check_status";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCall {
    pub method: &'static str,
    pub repository: String,
    pub branch: String,
}

/// A failure the mock returns instead of performing a call.
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    Unavailable(String),
    Rejected(String),
}

impl ScriptedFailure {
    fn into_error(self) -> FlowError {
        match self {
            ScriptedFailure::Unavailable(m) => FlowError::HostUnavailable(m),
            ScriptedFailure::Rejected(m) => FlowError::HostRejected(m),
        }
    }
}

/// Scriptable, instrumented host for tests.
///
/// Every call is appended to `calls` in the order it *started*; an optional
/// per-call delay widens the window in which concurrent callers could
/// interleave.
pub struct MockHost {
    pub calls: Mutex<Vec<HostCall>>,
    /// Content pushed by each create/update call.
    pub pushed: Mutex<Vec<PullRequestContent>>,
    open: Mutex<HashMap<(String, String), PullRequest>>,
    failures: Mutex<HashMap<&'static str, VecDeque<ScriptedFailure>>>,
    check_state: Mutex<CheckState>,
    merge_result: Mutex<bool>,
    delay: Mutex<Option<Duration>>,
    next_number: Mutex<u64>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            pushed: Mutex::new(Vec::new()),
            open: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            check_state: Mutex::new(CheckState::default()),
            merge_result: Mutex::new(true),
            delay: Mutex::new(None),
            next_number: Mutex::new(1),
        }
    }
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call to `method` with `failure`. Queued per method.
    pub fn fail_next(&self, method: &'static str, failure: ScriptedFailure) {
        self.failures
            .lock()
            .unwrap()
            .entry(method)
            .or_default()
            .push_back(failure);
    }

    pub fn set_check_state(&self, state: CheckState) {
        *self.check_state.lock().unwrap() = state;
    }

    pub fn set_merge_result(&self, merged: bool) {
        *self.merge_result.lock().unwrap() = merged;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Pretend the PR was closed or merged outside the engine.
    pub fn close_pull_request(&self, repo: &str, branch: &str) {
        self.open
            .lock()
            .unwrap()
            .remove(&(repo.to_string(), branch.to_string()));
    }

    pub fn open_pull_request(&self, repo: &str, branch: &str) -> Option<PullRequest> {
        self.open
            .lock()
            .unwrap()
            .get(&(repo.to_string(), branch.to_string()))
            .cloned()
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().iter().map(|c| c.method).collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    async fn enter(&self, method: &'static str, repo: &str, branch: &str) -> Result<()> {
        self.calls.lock().unwrap().push(HostCall {
            method,
            repository: repo.to_string(),
            branch: branch.to_string(),
        });
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(|q| q.pop_front());
        match scripted {
            Some(f) => Err(f.into_error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SourceControlHost for MockHost {
    async fn get_open_pull_request(
        &self,
        repo: &str,
        branch: &str,
    ) -> Result<Option<PullRequest>> {
        self.enter(GET_OPEN_PULL_REQUEST, repo, branch).await?;
        Ok(self.open_pull_request(repo, branch))
    }

    async fn create_or_update_pull_request(
        &self,
        repo: &str,
        branch: &str,
        content: &PullRequestContent,
    ) -> Result<PullRequest> {
        self.enter(CREATE_OR_UPDATE_PULL_REQUEST, repo, branch).await?;
        self.pushed.lock().unwrap().push(content.clone());
        let key = (repo.to_string(), branch.to_string());
        let mut open = self.open.lock().unwrap();
        let pr = match open.get(&key) {
            Some(existing) => PullRequest {
                title: content.title.clone(),
                ..existing.clone()
            },
            None => {
                let mut n = self.next_number.lock().unwrap();
                let number = *n;
                *n += 1;
                PullRequest {
                    number,
                    url: format!("https://host.test/{repo}/pull/{number}"),
                    repository: repo.to_string(),
                    target_branch: branch.to_string(),
                    head_branch: content.head_branch.clone(),
                    title: content.title.clone(),
                }
            }
        };
        open.insert(key, pr.clone());
        Ok(pr)
    }

    async fn attempt_merge(&self, pr: &PullRequest) -> Result<bool> {
        self.enter(ATTEMPT_MERGE, &pr.repository, &pr.target_branch)
            .await?;
        let merged = *self.merge_result.lock().unwrap();
        if merged {
            self.close_pull_request(&pr.repository, &pr.target_branch);
        }
        Ok(merged)
    }

    async fn get_check_status(&self, pr: &PullRequest) -> Result<CheckState> {
        self.enter(GET_CHECK_STATUS, &pr.repository, &pr.target_branch)
            .await?;
        Ok(self.check_state.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content() -> PullRequestContent {
        PullRequestContent {
            title: "Update dependencies".into(),
            description: String::new(),
            head_branch: "depflow-update".into(),
            updates: vec![],
        }
    }

    #[tokio::test]
    async fn create_then_update_reuses_pr_number() {
        let host = MockHost::new();
        let first = host
            .create_or_update_pull_request("repo", "main", &content())
            .await
            .unwrap();
        let second = host
            .create_or_update_pull_request("repo", "main", &content())
            .await
            .unwrap();
        assert_eq!(first.number, second.number);
        assert_eq!(host.count(CREATE_OR_UPDATE_PULL_REQUEST), 2);
    }

    #[tokio::test]
    async fn scripted_failure_fires_once() {
        let host = MockHost::new();
        host.fail_next(GET_OPEN_PULL_REQUEST, ScriptedFailure::Unavailable("503".into()));
        let err = host.get_open_pull_request("repo", "main").await.unwrap_err();
        assert!(err.is_transient());
        assert!(host.get_open_pull_request("repo", "main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn successful_merge_closes_pr() {
        let host = MockHost::new();
        let pr = host
            .create_or_update_pull_request("repo", "main", &content())
            .await
            .unwrap();
        assert!(host.attempt_merge(&pr).await.unwrap());
        assert!(host.open_pull_request("repo", "main").is_none());
    }
}
