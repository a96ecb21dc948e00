use axum::extract::{Path, State};
use axum::Json;
use depflow_core::actor::state::PrActorState;
use depflow_core::model::Subscription;
use depflow_core::queue::WorkItem;
use serde::Serialize;

use super::{blocking, parse_uuid};
use crate::error::AppError;
use crate::state::AppState;

/// GET /api/subscriptions
pub async fn list_subscriptions(
    State(app): State<AppState>,
) -> Result<Json<Vec<Subscription>>, AppError> {
    let subs = blocking(move || Ok(app.store.list_subscriptions()?)).await?;
    Ok(Json(subs))
}

/// GET /api/subscriptions/{id}
pub async fn get_subscription(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Subscription>, AppError> {
    let id = parse_uuid(&id)?;
    let sub = blocking(move || Ok(app.store.get_subscription(id)?)).await?;
    Ok(Json(sub))
}

#[derive(Debug, Serialize)]
pub struct ActorStateResponse {
    pub actor_id: String,
    /// `null` when the actor has never run or its state was cleared.
    pub state: Option<PrActorState>,
    pub lease_owner: Option<String>,
}

/// GET /api/subscriptions/{id}/state: the PR actor's persisted state.
pub async fn get_actor_state(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActorStateResponse>, AppError> {
    let id = parse_uuid(&id)?;
    let response = blocking(move || {
        let actor_id = app.store.get_subscription(id)?.actor_id().to_string();
        let state = app.store.get_pr_state(&actor_id)?;
        let lease_owner = app
            .store
            .current_lease(&actor_id)?
            .filter(|l| !l.is_expired(chrono::Utc::now()))
            .map(|l| l.owner);
        Ok(ActorStateResponse {
            actor_id,
            state,
            lease_owner,
        })
    })
    .await?;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub queue_id: u64,
    pub actor_id: String,
}

/// POST /api/subscriptions/{id}/check: re-run the merge policy check on the
/// actor's open pull request, e.g. after a CI status change.
pub async fn check_pull_request(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CheckResponse>, AppError> {
    let id = parse_uuid(&id)?;
    let response = blocking(move || {
        let actor = app.store.get_subscription(id)?.actor_id();
        let queue_id = app.queue.enqueue(WorkItem::pull_request_check(&actor))?;
        tracing::info!(queue_id, actor = %actor, "pull request check enqueued");
        Ok(CheckResponse {
            queue_id,
            actor_id: actor.to_string(),
        })
    })
    .await?;
    Ok(Json(response))
}
