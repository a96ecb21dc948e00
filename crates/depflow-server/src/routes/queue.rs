use axum::extract::State;
use axum::Json;
use depflow_core::queue::QueueStats;

use super::blocking;
use crate::error::AppError;
use crate::state::AppState;

/// GET /api/queue/stats
pub async fn get_stats(State(app): State<AppState>) -> Result<Json<QueueStats>, AppError> {
    let stats = blocking(move || Ok(app.queue.stats()?)).await?;
    Ok(Json(stats))
}
