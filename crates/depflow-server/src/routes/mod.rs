pub mod config;
pub mod history;
pub mod queue;
pub mod subscriptions;
pub mod triggers;

use crate::error::AppError;

/// Run a blocking store/queue operation off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))?
}

pub(crate) fn parse_uuid(raw: &str) -> Result<uuid::Uuid, AppError> {
    uuid::Uuid::parse_str(raw).map_err(|_| AppError::bad_request(format!("invalid id '{raw}'")))
}
