//! The per-(subscription, target branch) pull-request actor.
//!
//! An actor is not a long-lived object: `PullRequestActor` is built for one
//! work item, reads its state from the store, drives the state machine while
//! the dispatcher holds the actor's lease, and writes the outcome back in a
//! single fenced transaction.

pub mod content;
pub mod state;

pub use state::{ActorStatus, PrActorState, StateChange, TrackedPullRequest};

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::history::{
    HistoryDraft, HistoryRecorder, ACTION_CHECK_PULL_REQUEST, ACTION_UPDATE_ASSETS,
};
use crate::host::{PullRequest, SourceControlHost};
use crate::model::{Build, Subscription};
use crate::policy::{self, EmptyPolicyOutcome, MergeDecision};
use crate::queue::{SubscriptionUpdate, WorkItem, WorkItemType};
use crate::store::{self, Advance, FlowStore, Lease};

// ---------------------------------------------------------------------------
// ActorId
// ---------------------------------------------------------------------------

/// Stable identity of one actor, encoded as `<subscription-id>:<target-branch>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActorId {
    pub subscription_id: Uuid,
    pub target_branch: String,
}

impl ActorId {
    pub fn new(subscription_id: Uuid, target_branch: impl Into<String>) -> Self {
        Self {
            subscription_id,
            target_branch: target_branch.into(),
        }
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subscription_id, self.target_branch)
    }
}

impl FromStr for ActorId {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || FlowError::InvalidActorId(s.to_string());
        let (id, branch) = s.split_once(':').ok_or_else(invalid)?;
        let subscription_id = Uuid::parse_str(id).map_err(|_| invalid())?;
        if branch.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(subscription_id, branch))
    }
}

impl TryFrom<String> for ActorId {
    type Error = FlowError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ActorId> for String {
    fn from(id: ActorId) -> Self {
        id.to_string()
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for transient host failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per host call, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActorSettings {
    pub retry: RetryPolicy,
    pub empty_policy_outcome: EmptyPolicyOutcome,
    /// Base URL retry links are minted against.
    pub public_url: String,
}

impl Default for ActorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            empty_policy_outcome: EmptyPolicyOutcome::default(),
            public_url: "http://localhost:3150".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Terminal result of processing one work item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActorOutcome {
    /// Nothing to do; also covers redelivery of an already applied item.
    NoOp { reason: String },
    Merged { build_id: u64, pull_request: PullRequest },
    AwaitingPolicy { build_id: u64, pull_request: PullRequest, summary: String },
    /// Update applied but policies failed; PR left open.
    PolicyRejected { build_id: u64, pull_request: PullRequest, summary: String },
    Failed { kind: String, message: String },
}

impl ActorOutcome {
    pub fn success(&self) -> bool {
        !matches!(self, ActorOutcome::Failed { .. })
    }
}

/// Terminal writes produced by a successful run.
struct Step {
    outcome: ActorOutcome,
    change: StateChange,
    advance: Option<Advance>,
    detail: String,
}

impl Step {
    fn no_op(change: StateChange, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            detail: reason.clone(),
            outcome: ActorOutcome::NoOp { reason },
            change,
            advance: None,
        }
    }
}

// ---------------------------------------------------------------------------
// PullRequestActor
// ---------------------------------------------------------------------------

pub struct PullRequestActor {
    id: ActorId,
    store: Arc<FlowStore>,
    host: Arc<dyn SourceControlHost>,
    settings: ActorSettings,
}

impl PullRequestActor {
    pub fn new(
        id: ActorId,
        store: Arc<FlowStore>,
        host: Arc<dyn SourceControlHost>,
        settings: ActorSettings,
    ) -> Self {
        Self {
            id,
            store,
            host,
            settings,
        }
    }

    pub fn id(&self) -> &ActorId {
        &self.id
    }

    /// Run `item` to completion under `lease`.
    ///
    /// Every failure inside the state machine becomes `ActorOutcome::Failed`
    /// with a history record carrying a retry URL. `Err` is returned only when
    /// the outcome could not be recorded at all, or the lease was lost.
    pub async fn process(
        &self,
        lease: &Lease,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> Result<ActorOutcome> {
        let actor_key = self.id.to_string();
        let subscription_id = self.id.subscription_id;
        let (stored, subscription) = self
            .with_store(move |store| {
                Ok((
                    store.get_pr_state(&actor_key)?,
                    store.find_subscription(subscription_id)?,
                ))
            })
            .await?;
        let mut state = stored.unwrap_or_else(|| PrActorState::new(&self.id));

        let action = match item.work_item_type {
            WorkItemType::SubscriptionUpdate => ACTION_UPDATE_ASSETS,
            WorkItemType::PullRequestCheck => ACTION_CHECK_PULL_REQUEST,
        };
        let draft = HistoryDraft {
            subscription_id: Some(self.id.subscription_id),
            repository: subscription
                .as_ref()
                .map(|s| s.target_repository.clone())
                .unwrap_or_else(|| "<deleted subscription>".to_string()),
            branch: self.id.target_branch.clone(),
            action,
        };

        let run = match item.work_item_type {
            WorkItemType::SubscriptionUpdate => {
                self.run_update(lease, item, subscription.as_ref(), &mut state, cancel)
                    .await
            }
            WorkItemType::PullRequestCheck => {
                self.run_check(lease, subscription.as_ref(), &mut state, cancel)
                    .await
            }
        };

        match run {
            Ok(Step {
                outcome,
                change,
                advance,
                detail,
            }) => {
                let record = draft.success(Some(detail));
                let fence = lease.clone();
                self.with_store(move |store| {
                    store.commit_outcome(&fence, change, advance, &record)
                })
                .await?;
                info!(actor = %self.id, ?outcome, "work item processed");
                Ok(outcome)
            }
            Err(e @ FlowError::LeaseLost { .. }) => Err(e),
            Err(e) => {
                let kind = e.kind().to_string();
                let message = e.to_string();
                warn!(actor = %self.id, kind = %kind, error = %message, "work item failed");
                state.fail(message.clone());
                let record = draft.failure(
                    &self.settings.public_url,
                    &kind,
                    message.clone(),
                    Some(item.clone()),
                );
                let fence = lease.clone();
                let failed = record.clone();
                let committed = self
                    .with_store(move |store| {
                        store.commit_outcome(&fence, StateChange::Put(state), None, &failed)
                    })
                    .await;
                match committed {
                    Ok(_) => {}
                    Err(e @ FlowError::LeaseLost { .. }) => return Err(e),
                    Err(commit_err) => {
                        error!(actor = %self.id, error = %commit_err, "failed to commit failure outcome");
                        self.with_store(move |store| store.record(&record)).await?;
                    }
                }
                Ok(ActorOutcome::Failed { kind, message })
            }
        }
    }

    async fn run_update(
        &self,
        lease: &Lease,
        item: &WorkItem,
        subscription: Option<&Subscription>,
        state: &mut PrActorState,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        let update: SubscriptionUpdate = item.payload_as()?;
        let Some(sub) = subscription else {
            return Ok(Step::no_op(StateChange::Clear, "subscription deleted"));
        };
        if !sub.enabled {
            return Ok(Step::no_op(StateChange::Keep, "subscription disabled"));
        }

        let last_applied_id = sub.last_applied_build_id;
        let (candidate, last_applied) = self
            .with_store(move |store| {
                let candidate = store.get_build(update.build_id)?;
                let last_applied = match last_applied_id {
                    Some(id) => Some(store.get_build(id)?),
                    None => None,
                };
                Ok((candidate, last_applied))
            })
            .await?;
        if let Some(last) = &last_applied {
            if candidate.id == last.id || candidate.produced_at <= last.produced_at {
                return Ok(Step::no_op(
                    StateChange::Keep,
                    format!(
                        "build {} already applied (last applied build {})",
                        candidate.id, last.id
                    ),
                ));
            }
        }

        self.require_installation(sub).await?;

        let resting = match state.status {
            s if s.is_in_flight() => ActorStatus::AwaitingPolicy,
            s => s,
        };
        state.transition(ActorStatus::Evaluating);
        self.save_state(lease, state).await?;
        let repo = sub.target_repository.as_str();
        let branch = sub.target_branch.as_str();
        let open = self
            .call_host(cancel, "get_open_pull_request", || {
                self.host.get_open_pull_request(repo, branch)
            })
            .await?;

        if open.is_none() && state.pull_request.take().is_some() {
            info!(actor = %self.id, "tracked pull request was closed outside the engine");
        }
        if let (Some(pr), Some(tracked)) = (&open, state.pull_request.clone()) {
            if tracked.build_id == candidate.id {
                return self
                    .policy_check(lease, sub, state, pr.clone(), candidate.id, cancel)
                    .await;
            }
            // An open PR never moves back to an older build.
            let carried = self.get_build(tracked.build_id).await?;
            if carried.produced_at >= candidate.produced_at {
                state.transition(resting);
                return Ok(Step::no_op(
                    StateChange::Put(state.clone()),
                    format!(
                        "pull request #{} already carries newer build {} (candidate build {})",
                        pr.number, carried.id, candidate.id
                    ),
                ));
            }
        }

        let content = content::pull_request_content(sub, last_applied.as_ref(), &candidate);
        if content.updates.is_empty() && open.is_none() {
            return Ok(Step {
                advance: Some(Advance {
                    subscription_id: sub.id,
                    build_id: candidate.id,
                }),
                ..Step::no_op(
                    StateChange::Clear,
                    format!("build {} changes no dependencies", candidate.id),
                )
            });
        }

        state.transition(ActorStatus::Updating);
        self.save_state(lease, state).await?;
        let pr = self
            .call_host(cancel, "create_or_update_pull_request", || {
                self.host.create_or_update_pull_request(repo, branch, &content)
            })
            .await?;
        state.pull_request = Some(TrackedPullRequest {
            pull_request: pr.clone(),
            build_id: candidate.id,
            updates: content.updates.clone(),
            updated_at: chrono::Utc::now(),
        });
        info!(actor = %self.id, build_id = candidate.id, number = pr.number, "pull request updated");

        self.policy_check(lease, sub, state, pr, candidate.id, cancel)
            .await
    }

    async fn run_check(
        &self,
        lease: &Lease,
        subscription: Option<&Subscription>,
        state: &mut PrActorState,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        let Some(sub) = subscription else {
            return Ok(Step::no_op(StateChange::Clear, "subscription deleted"));
        };
        let Some(tracked) = state.pull_request.clone() else {
            return Ok(Step::no_op(StateChange::Keep, "no pull request tracked"));
        };

        self.require_installation(sub).await?;

        state.transition(ActorStatus::Evaluating);
        self.save_state(lease, state).await?;
        let repo = sub.target_repository.as_str();
        let branch = sub.target_branch.as_str();
        let open = self
            .call_host(cancel, "get_open_pull_request", || {
                self.host.get_open_pull_request(repo, branch)
            })
            .await?;
        let Some(pr) = open else {
            return Ok(Step::no_op(
                StateChange::Clear,
                format!("pull request #{} no longer open", tracked.pull_request.number),
            ));
        };

        self.policy_check(lease, sub, state, pr, tracked.build_id, cancel)
            .await
    }

    async fn policy_check(
        &self,
        lease: &Lease,
        sub: &Subscription,
        state: &mut PrActorState,
        pr: PullRequest,
        build_id: u64,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        state.transition(ActorStatus::PolicyCheck);
        self.save_state(lease, state).await?;

        let checks = self
            .call_host(cancel, "get_check_status", || self.host.get_check_status(&pr))
            .await?;
        let evaluation = policy::evaluate(
            &sub.policy.merge_policies,
            &checks,
            self.settings.empty_policy_outcome,
        )?;
        state.policy_results = evaluation.results.clone();
        let summary = evaluation.summary();

        match evaluation.decision {
            MergeDecision::Approve => {
                let merged = self
                    .call_host(cancel, "attempt_merge", || self.host.attempt_merge(&pr))
                    .await?;
                if merged {
                    info!(actor = %self.id, build_id, number = pr.number, "pull request merged");
                    return Ok(Step {
                        detail: format!("merged pull request #{} with build {build_id}", pr.number),
                        outcome: ActorOutcome::Merged {
                            build_id,
                            pull_request: pr,
                        },
                        change: StateChange::Clear,
                        advance: Some(Advance {
                            subscription_id: sub.id,
                            build_id,
                        }),
                    });
                }
                let summary = "host declined to merge".to_string();
                state.transition(ActorStatus::AwaitingPolicy);
                Ok(Step {
                    detail: format!("pull request #{} awaiting merge: {summary}", pr.number),
                    outcome: ActorOutcome::AwaitingPolicy {
                        build_id,
                        pull_request: pr,
                        summary,
                    },
                    change: StateChange::Put(state.clone()),
                    advance: None,
                })
            }
            MergeDecision::Pending => {
                state.transition(ActorStatus::AwaitingPolicy);
                Ok(Step {
                    detail: format!("pull request #{} awaiting policy: {summary}", pr.number),
                    outcome: ActorOutcome::AwaitingPolicy {
                        build_id,
                        pull_request: pr,
                        summary,
                    },
                    change: StateChange::Put(state.clone()),
                    advance: None,
                })
            }
            MergeDecision::Reject => {
                state.transition(ActorStatus::Idle);
                Ok(Step {
                    detail: format!("policy rejected pull request #{}: {summary}", pr.number),
                    outcome: ActorOutcome::PolicyRejected {
                        build_id,
                        pull_request: pr,
                        summary,
                    },
                    change: StateChange::Put(state.clone()),
                    advance: None,
                })
            }
        }
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&FlowStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        store::blocking(move || f(&store)).await
    }

    async fn save_state(&self, lease: &Lease, state: &PrActorState) -> Result<()> {
        let (lease, state) = (lease.clone(), state.clone());
        self.with_store(move |store| store.save_pr_state(&lease, &state))
            .await
    }

    async fn get_build(&self, id: u64) -> Result<Build> {
        self.with_store(move |store| store.get_build(id)).await
    }

    async fn require_installation(&self, sub: &Subscription) -> Result<()> {
        let repository = sub.target_repository.clone();
        let installation = self
            .with_store(move |store| store.get_installation(&repository))
            .await?;
        match installation {
            Some(_) => Ok(()),
            None => Err(FlowError::HostRejected(format!(
                "no installation registered for repository '{}'",
                sub.target_repository
            ))),
        }
    }

    /// Run a host call, retrying transient failures with backoff and
    /// aborting as soon as `cancel` fires.
    async fn call_host<T, F, Fut>(&self, cancel: &CancellationToken, call: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FlowError::Cancelled),
                r = op() => r,
            };
            match result {
                Err(e) if e.is_transient() && attempt < self.settings.retry.max_attempts => {
                    let delay = self.settings.retry.delay_for(attempt);
                    warn!(actor = %self.id, call, attempt, ?delay, error = %e, "host call failed, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(FlowError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
