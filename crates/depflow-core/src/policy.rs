//! Merge policy evaluation.
//!
//! Pure and side-effect free: a list of configured policies plus the PR's
//! current check/approval state goes in, a `MergeDecision` comes out.
//!
//! Aggregation is a logical AND over "pass": any `Fail` rejects, otherwise
//! any `Pending` keeps the PR waiting, otherwise the PR is approved. The
//! order policies are listed in never changes the aggregate.

use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// MergePolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergePolicy {
    /// Every reported check (minus the ignored ones) must succeed.
    AllChecksSuccessful {
        #[serde(default)]
        ignore_checks: Vec<String>,
    },
    /// The named checks must be reported and succeed.
    RequireChecks { checks: Vec<String> },
    MinimumApprovals { count: u32 },
    NoRequestedChanges,
    NoMergeConflicts,
}

impl MergePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            MergePolicy::AllChecksSuccessful { .. } => "all_checks_successful",
            MergePolicy::RequireChecks { .. } => "require_checks",
            MergePolicy::MinimumApprovals { .. } => "minimum_approvals",
            MergePolicy::NoRequestedChanges => "no_requested_changes",
            MergePolicy::NoMergeConflicts => "no_merge_conflicts",
        }
    }

    /// Reject definitions that can never be satisfied meaningfully.
    pub fn validate(&self) -> Result<()> {
        match self {
            MergePolicy::RequireChecks { checks } if checks.is_empty() => Err(
                FlowError::PolicyEvaluation("require_checks lists no check names".into()),
            ),
            MergePolicy::RequireChecks { checks } if checks.iter().any(|c| c.trim().is_empty()) => {
                Err(FlowError::PolicyEvaluation(
                    "require_checks contains an empty check name".into(),
                ))
            }
            MergePolicy::MinimumApprovals { count: 0 } => Err(FlowError::PolicyEvaluation(
                "minimum_approvals must require at least one approval".into(),
            )),
            _ => Ok(()),
        }
    }

    pub fn evaluate(&self, state: &CheckState) -> PolicyVerdict {
        match self {
            MergePolicy::AllChecksSuccessful { ignore_checks } => {
                let relevant: Vec<&CheckRun> = state
                    .checks
                    .iter()
                    .filter(|c| !ignore_checks.contains(&c.name))
                    .collect();
                if relevant.is_empty() {
                    return PolicyVerdict::pending("no checks reported yet");
                }
                checks_verdict(relevant.into_iter())
            }
            MergePolicy::RequireChecks { checks } => {
                let mut found = Vec::with_capacity(checks.len());
                for name in checks {
                    match state.checks.iter().find(|c| &c.name == name) {
                        Some(run) => found.push(run),
                        None => {
                            return PolicyVerdict::pending(format!(
                                "required check '{name}' not reported yet"
                            ))
                        }
                    }
                }
                checks_verdict(found.into_iter())
            }
            MergePolicy::MinimumApprovals { count } => {
                if state.approvals >= *count {
                    PolicyVerdict::Pass
                } else {
                    PolicyVerdict::pending(format!(
                        "{} of {count} required approvals",
                        state.approvals
                    ))
                }
            }
            MergePolicy::NoRequestedChanges => {
                if state.changes_requested {
                    PolicyVerdict::fail("a reviewer requested changes")
                } else {
                    PolicyVerdict::Pass
                }
            }
            MergePolicy::NoMergeConflicts => match state.mergeable {
                Some(true) => PolicyVerdict::Pass,
                Some(false) => PolicyVerdict::fail("pull request has merge conflicts"),
                None => PolicyVerdict::pending("mergeability not computed yet"),
            },
        }
    }
}

/// Parses the `name[=arg,arg…]` form used on the command line, e.g.
/// `minimum_approvals=2` or `all_checks_successful=license/cla`.
impl std::str::FromStr for MergePolicy {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, arg) = match s.split_once('=') {
            Some((name, arg)) => (name.trim(), Some(arg.trim())),
            None => (s.trim(), None),
        };
        let list = |arg: Option<&str>| -> Vec<String> {
            arg.map(|a| {
                a.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
        };
        match name {
            "all_checks_successful" => Ok(MergePolicy::AllChecksSuccessful {
                ignore_checks: list(arg),
            }),
            "require_checks" => Ok(MergePolicy::RequireChecks { checks: list(arg) }),
            "minimum_approvals" => {
                let raw = arg.unwrap_or("1");
                let count = raw.parse().map_err(|_| {
                    FlowError::PolicyEvaluation(format!(
                        "minimum_approvals expects a number, got '{raw}'"
                    ))
                })?;
                Ok(MergePolicy::MinimumApprovals { count })
            }
            "no_requested_changes" => Ok(MergePolicy::NoRequestedChanges),
            "no_merge_conflicts" => Ok(MergePolicy::NoMergeConflicts),
            other => Err(FlowError::PolicyEvaluation(format!(
                "unknown merge policy '{other}'"
            ))),
        }
    }
}

fn checks_verdict<'a>(runs: impl Iterator<Item = &'a CheckRun>) -> PolicyVerdict {
    let mut pending = Vec::new();
    for run in runs {
        match run.status {
            CheckStatus::Failure => {
                return PolicyVerdict::fail(format!("check '{}' failed", run.name));
            }
            CheckStatus::Pending => pending.push(run.name.as_str()),
            CheckStatus::Success => {}
        }
    }
    if pending.is_empty() {
        PolicyVerdict::Pass
    } else {
        PolicyVerdict::pending(format!("waiting on checks: {}", pending.join(", ")))
    }
}

// ---------------------------------------------------------------------------
// CheckState (host-reported PR state)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pending,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: CheckStatus,
}

impl CheckRun {
    pub fn new(name: impl Into<String>, status: CheckStatus) -> Self {
        Self {
            name: name.into(),
            status,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckState {
    #[serde(default)]
    pub checks: Vec<CheckRun>,
    #[serde(default)]
    pub approvals: u32,
    #[serde(default)]
    pub changes_requested: bool,
    /// `None` while the host is still computing mergeability.
    #[serde(default)]
    pub mergeable: Option<bool>,
}

// ---------------------------------------------------------------------------
// Verdicts and decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "message", rename_all = "snake_case")]
pub enum PolicyVerdict {
    Pass,
    Pending(String),
    Fail(String),
}

impl PolicyVerdict {
    pub fn pending(msg: impl Into<String>) -> Self {
        PolicyVerdict::Pending(msg.into())
    }

    pub fn fail(msg: impl Into<String>) -> Self {
        PolicyVerdict::Fail(msg.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub policy: String,
    pub verdict: PolicyVerdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeDecision {
    Approve,
    Reject,
    Pending,
}

impl MergeDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeDecision::Approve => "approve",
            MergeDecision::Reject => "reject",
            MergeDecision::Pending => "pending",
        }
    }
}

/// What a subscription without merge policies resolves to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyPolicyOutcome {
    /// Auto-merge as soon as the update is applied.
    #[default]
    Approve,
    /// Leave the PR open for a human to merge.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub decision: MergeDecision,
    pub results: Vec<PolicyResult>,
}

impl Evaluation {
    /// Human-readable reason for a non-approving decision.
    pub fn summary(&self) -> String {
        let notes: Vec<String> = self
            .results
            .iter()
            .filter_map(|r| match &r.verdict {
                PolicyVerdict::Pass => None,
                PolicyVerdict::Pending(m) | PolicyVerdict::Fail(m) => {
                    Some(format!("{}: {m}", r.policy))
                }
            })
            .collect();
        if notes.is_empty() {
            self.decision.as_str().to_string()
        } else {
            format!("{} ({})", self.decision.as_str(), notes.join("; "))
        }
    }
}

/// Combine individual verdicts. An empty set approves.
pub fn aggregate<'a>(verdicts: impl IntoIterator<Item = &'a PolicyVerdict>) -> MergeDecision {
    let mut decision = MergeDecision::Approve;
    for verdict in verdicts {
        match verdict {
            PolicyVerdict::Fail(_) => return MergeDecision::Reject,
            PolicyVerdict::Pending(_) => decision = MergeDecision::Pending,
            PolicyVerdict::Pass => {}
        }
    }
    decision
}

/// Evaluate every configured policy against `state`.
///
/// Returns `PolicyEvaluation` if any definition is malformed; nothing is
/// evaluated in that case.
pub fn evaluate(
    policies: &[MergePolicy],
    state: &CheckState,
    when_empty: EmptyPolicyOutcome,
) -> Result<Evaluation> {
    if policies.is_empty() {
        let decision = match when_empty {
            EmptyPolicyOutcome::Approve => MergeDecision::Approve,
            EmptyPolicyOutcome::Pending => MergeDecision::Pending,
        };
        return Ok(Evaluation {
            decision,
            results: Vec::new(),
        });
    }

    for policy in policies {
        policy.validate()?;
    }

    let results: Vec<PolicyResult> = policies
        .iter()
        .map(|p| PolicyResult {
            policy: p.name().to_string(),
            verdict: p.evaluate(state),
        })
        .collect();
    let decision = aggregate(results.iter().map(|r| &r.verdict));
    Ok(Evaluation { decision, results })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
