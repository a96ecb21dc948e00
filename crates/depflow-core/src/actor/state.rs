//! Durable per-actor pull-request state.

use crate::host::{DependencyUpdate, PullRequest};
use crate::policy::PolicyResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ActorId;

// ---------------------------------------------------------------------------
// ActorStatus
// ---------------------------------------------------------------------------

/// Where an actor's state machine currently stands.
///
/// Transitions:
/// `Idle → Evaluating → Updating → PolicyCheck → Idle | AwaitingPolicy`,
/// with any step able to fall to `Failed`. `Evaluating`, `Updating` and
/// `PolicyCheck` only persist while a lease is held; if one is found without a
/// live lease the actor crashed mid-run and `FlowStore::recover_stuck_actors`
/// moves it to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorStatus {
    Idle,
    Evaluating,
    Updating,
    PolicyCheck,
    AwaitingPolicy,
    Failed,
}

impl ActorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorStatus::Idle => "idle",
            ActorStatus::Evaluating => "evaluating",
            ActorStatus::Updating => "updating",
            ActorStatus::PolicyCheck => "policy_check",
            ActorStatus::AwaitingPolicy => "awaiting_policy",
            ActorStatus::Failed => "failed",
        }
    }

    /// Statuses that are only valid while a worker is mid-run.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            ActorStatus::Evaluating | ActorStatus::Updating | ActorStatus::PolicyCheck
        )
    }
}

impl fmt::Display for ActorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PrActorState
// ---------------------------------------------------------------------------

/// The open PR an actor is driving, and which build it currently carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedPullRequest {
    pub pull_request: PullRequest,
    pub build_id: u64,
    #[serde(default)]
    pub updates: Vec<DependencyUpdate>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrActorState {
    pub actor_id: String,
    pub status: ActorStatus,
    #[serde(default)]
    pub pull_request: Option<TrackedPullRequest>,
    #[serde(default)]
    pub policy_results: Vec<PolicyResult>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PrActorState {
    pub fn new(actor_id: &ActorId) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            status: ActorStatus::Idle,
            pull_request: None,
            policy_results: Vec::new(),
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn transition(&mut self, status: ActorStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        if status != ActorStatus::Failed {
            self.last_error = None;
        }
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.transition(ActorStatus::Failed);
        self.last_error = Some(message.into());
    }
}

/// What a finished work item does to the stored actor state.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Keep,
    Put(PrActorState),
    Clear,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn new_state_is_idle_without_pr() {
        let id = ActorId::new(Uuid::new_v4(), "main");
        let state = PrActorState::new(&id);
        assert_eq!(state.status, ActorStatus::Idle);
        assert!(state.pull_request.is_none());
        assert_eq!(state.actor_id, id.to_string());
    }

    #[test]
    fn leaving_failed_clears_last_error() {
        let id = ActorId::new(Uuid::new_v4(), "main");
        let mut state = PrActorState::new(&id);
        state.fail("host exploded");
        assert_eq!(state.status, ActorStatus::Failed);
        assert_eq!(state.last_error.as_deref(), Some("host exploded"));
        state.transition(ActorStatus::Evaluating);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn only_mid_run_statuses_are_in_flight() {
        assert!(ActorStatus::Updating.is_in_flight());
        assert!(!ActorStatus::AwaitingPolicy.is_in_flight());
        assert!(!ActorStatus::Failed.is_in_flight());
        assert!(!ActorStatus::Idle.is_in_flight());
    }
}
