use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use depflow_core::trigger::{DueUpdate, Trigger};
use depflow_core::types::UpdateFrequency;
use serde::{Deserialize, Serialize};

use super::blocking;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct NewBuildBody {
    pub build_id: u64,
    pub channel_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct SweepBody {
    pub frequency: String,
    /// Consider builds produced up to this instant; defaults to now.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub enqueued: usize,
    pub updates: Vec<DueUpdate>,
}

/// POST /api/triggers/build: a build was published to a channel.
pub async fn new_build(
    State(app): State<AppState>,
    Json(body): Json<NewBuildBody>,
) -> Result<Json<TriggerResponse>, AppError> {
    fire(
        app,
        Trigger::NewBuild {
            build_id: body.build_id,
            channel_id: body.channel_id,
        },
    )
    .await
}

/// POST /api/triggers/sweep: run one periodic sweep now.
pub async fn sweep(
    State(app): State<AppState>,
    Json(body): Json<SweepBody>,
) -> Result<Json<TriggerResponse>, AppError> {
    let frequency: UpdateFrequency = body.frequency.parse()?;
    fire(
        app,
        Trigger::Sweep {
            at: body.at.unwrap_or_else(Utc::now),
            frequency,
        },
    )
    .await
}

async fn fire(app: AppState, trigger: Trigger) -> Result<Json<TriggerResponse>, AppError> {
    let updates = blocking(move || Ok(app.engine.fire(&trigger, &app.queue)?)).await?;
    Ok(Json(TriggerResponse {
        enqueued: updates.len(),
        updates,
    }))
}
