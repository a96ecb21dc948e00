use axum::extract::{Path, Query, State};
use axum::Json;
use depflow_core::history::{HistoryQuery, HistoryRecord, RepositoryHistoryItem};
use serde::Serialize;

use super::{blocking, parse_uuid};
use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 100;

/// GET /api/history: newest first, filtered by `repository`/`branch`.
pub async fn list_history(
    State(app): State<AppState>,
    Query(mut query): Query<HistoryQuery>,
) -> Result<Json<Vec<RepositoryHistoryItem>>, AppError> {
    query.limit.get_or_insert(DEFAULT_LIMIT);
    let items = blocking(move || {
        let records = app.store.list_history(&query)?;
        Ok(records.into_iter().map(|r| r.item).collect())
    })
    .await?;
    Ok(Json(items))
}

/// GET /api/history/{id}: the full record, including the work item a retry
/// would re-enqueue.
pub async fn get_history(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HistoryRecord>, AppError> {
    let id = parse_uuid(&id)?;
    let record = blocking(move || Ok(app.store.get_history(id)?)).await?;
    Ok(Json(record))
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub queue_id: u64,
    pub actor_id: String,
}

/// POST /api/history/{id}/retry: the target of `retryUrl`.
pub async fn retry_history(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RetryResponse>, AppError> {
    let id = parse_uuid(&id)?;
    let response = blocking(move || {
        let record = app.store.get_history(id)?;
        if record.item.success() {
            return Err(AppError::conflict(format!(
                "history item {id} succeeded; nothing to retry"
            )));
        }
        let Some(item) = record.work_item else {
            return Err(AppError::conflict(format!(
                "history item {id} has no work item to retry"
            )));
        };
        let actor_id = item.actor_id.clone();
        let queue_id = app.queue.enqueue(item)?;
        tracing::info!(history_id = %id, queue_id, actor = %actor_id, "retry enqueued");
        Ok(RetryResponse { queue_id, actor_id })
    })
    .await?;
    Ok(Json(response))
}
