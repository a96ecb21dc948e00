use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("not initialized: run 'depflow init'")]
    NotInitialized,

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("build not found: {0}")]
    BuildNotFound(u64),

    #[error("channel not found: {0}")]
    ChannelNotFound(u64),

    #[error("history item not found: {0}")]
    HistoryNotFound(String),

    #[error("invalid actor id '{0}': expected '<subscription-id>:<target-branch>'")]
    InvalidActorId(String),

    #[error("invalid update frequency: {0}")]
    InvalidFrequency(String),

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    /// Transient host failure; retried with backoff.
    #[error("source-control host unavailable: {0}")]
    HostUnavailable(String),

    /// Permission, conflict or missing installation; needs an operator.
    #[error("source-control host rejected the request: {0}")]
    HostRejected(String),

    #[error("merge policy evaluation failed: {0}")]
    PolicyEvaluation(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("lease for actor '{actor}' is held by '{owner}'")]
    LeaseHeld { actor: String, owner: String },

    /// A newer lease superseded this one; the write was fenced off.
    #[error("lease for actor '{actor}' was lost (token {token})")]
    LeaseLost { actor: String, token: u64 },

    #[error("stale or unknown receipt handle: {0}")]
    StaleReceipt(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Whether the actor should retry the failed call after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, FlowError::HostUnavailable(_))
    }

    /// Short kind label stored alongside failure history.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::HostUnavailable(_) => "host_unavailable",
            FlowError::HostRejected(_) => "host_rejected",
            FlowError::PolicyEvaluation(_) => "policy_evaluation",
            FlowError::Store(_) | FlowError::Io(_) | FlowError::Json(_) | FlowError::Yaml(_) => {
                "store"
            }
            FlowError::Cancelled => "cancelled",
            _ => "internal",
        }
    }
}

/// redb surfaces a separate error type per operation; all of them collapse
/// into `FlowError::Store`.
macro_rules! store_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for FlowError {
                fn from(e: $ty) -> Self {
                    FlowError::Store(e.to_string())
                }
            }
        )*
    };
}

store_error_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_host_unavailable_is_transient() {
        assert!(FlowError::HostUnavailable("503".into()).is_transient());
        assert!(!FlowError::HostRejected("403".into()).is_transient());
        assert!(!FlowError::Store("disk".into()).is_transient());
        assert!(!FlowError::Cancelled.is_transient());
    }

    #[test]
    fn invalid_actor_id_message_names_expected_shape() {
        let msg = FlowError::InvalidActorId("bogus".into()).to_string();
        assert!(msg.contains("bogus"));
        assert!(msg.contains("<subscription-id>:<target-branch>"));
    }
}
