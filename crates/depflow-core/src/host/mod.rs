//! Source-control host capability.
//!
//! The engine never talks to a hosting API directly; it goes through
//! `SourceControlHost`. Implementations map their transport failures onto
//! `FlowError::HostUnavailable` (transient) or `FlowError::HostRejected`
//! (needs an operator).

pub mod dry_run;
pub mod mock;

use crate::error::Result;
use crate::policy::CheckState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use dry_run::DryRunHost;
pub use mock::MockHost;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub repository: String,
    pub target_branch: String,
    pub head_branch: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyUpdate {
    pub name: String,
    /// `None` when the dependency is new to the target.
    pub from_version: Option<String>,
    pub to_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestContent {
    pub title: String,
    pub description: String,
    pub head_branch: String,
    pub updates: Vec<DependencyUpdate>,
}

#[async_trait]
pub trait SourceControlHost: Send + Sync {
    /// The open dependency-update PR against `repo`/`branch`, if any.
    async fn get_open_pull_request(&self, repo: &str, branch: &str)
        -> Result<Option<PullRequest>>;

    /// Create the PR, or push new content onto the existing one.
    async fn create_or_update_pull_request(
        &self,
        repo: &str,
        branch: &str,
        content: &PullRequestContent,
    ) -> Result<PullRequest>;

    /// `Ok(false)` means the host declined to merge right now.
    async fn attempt_merge(&self, pr: &PullRequest) -> Result<bool>;

    async fn get_check_status(&self, pr: &PullRequest) -> Result<CheckState>;
}
