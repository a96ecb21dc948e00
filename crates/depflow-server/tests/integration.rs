use std::sync::Arc;

use axum::http::StatusCode;
use chrono::Utc;
use depflow_core::config::EngineConfig;
use depflow_core::history::{HistoryDraft, HistoryRecorder, ACTION_UPDATE_ASSETS};
use depflow_core::model::{Asset, Build, Channel, Subscription, SubscriptionPolicy};
use depflow_core::paths;
use depflow_core::queue::{WorkItem, WorkQueue};
use depflow_core::store::FlowStore;
use depflow_core::types::UpdateFrequency;
use depflow_server::AppState;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Seeded {
    _dir: TempDir,
    state: AppState,
    sub: Subscription,
    build: Build,
    channel: Channel,
}

/// Initialise a root with one channel, one published build and one
/// every-build subscription.
fn seeded() -> Seeded {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    EngineConfig::default().save(root).unwrap();
    let store = Arc::new(FlowStore::open(&paths::flow_db_path(root)).unwrap());
    let queue = Arc::new(WorkQueue::open(&paths::queue_db_path(root)).unwrap());

    let channel = store.add_channel(Channel::new("channel", "class")).unwrap();
    let build = store
        .add_build(
            Build::new("source.repo", "source.branch", "build.number", "sha", Utc::now())
                .with_asset(Asset::shipping("source.asset", "1.0.1")),
        )
        .unwrap();
    store.assign_build_to_channel(build.id, channel.id).unwrap();
    let sub = store
        .add_subscription(Subscription::new(
            channel.id,
            "source.repo",
            "target.repo",
            "target.branch",
            SubscriptionPolicy::new(UpdateFrequency::EveryBuild),
        ))
        .unwrap();

    let state = AppState::new(root.to_path_buf(), EngineConfig::default(), store, queue);
    Seeded {
        _dir: dir,
        state,
        sub,
        build,
        channel,
    }
}

/// Send a GET request via `oneshot` and return (status, parsed JSON body).
async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Send a POST request with a JSON body via `oneshot` and return (status, parsed JSON body).
async fn post_json(
    app: axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn record_failure(s: &Seeded) -> uuid::Uuid {
    let item = WorkItem::subscription_update(&s.sub.actor_id(), s.build.id).unwrap();
    let record = HistoryDraft {
        subscription_id: Some(s.sub.id),
        repository: "target.repo".into(),
        branch: "target.branch".into(),
        action: ACTION_UPDATE_ASSETS,
    }
    .failure(
        "http://localhost:3150",
        "host_unavailable",
        "502 bad gateway",
        Some(item),
    );
    s.state.store.record(&record).unwrap();
    record.id
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_lists_camel_case_items_for_repository() {
    let s = seeded();
    record_failure(&s);
    let app = depflow_server::build_router(s.state.clone());

    let (status, json) = get(app.clone(), "/api/history?repository=target.repo&branch=target.branch").await;
    assert_eq!(status, StatusCode::OK);
    let items = json.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["repositoryName"], "target.repo");
    assert_eq!(items[0]["branchName"], "target.branch");
    assert_eq!(items[0]["success"], false);
    assert_eq!(items[0]["action"], ACTION_UPDATE_ASSETS);
    assert!(items[0]["retryUrl"].as_str().unwrap().ends_with("/retry"));

    let (_, json) = get(app, "/api/history?repository=other.repo").await;
    assert!(json.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn retry_reenqueues_failed_work_item() {
    let s = seeded();
    let id = record_failure(&s);
    let app = depflow_server::build_router(s.state.clone());

    let (status, json) = post_json(app, &format!("/api/history/{id}/retry"), serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["actor_id"], s.sub.actor_id().to_string());

    let pending = s.state.queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0], WorkItem::subscription_update(&s.sub.actor_id(), s.build.id).unwrap());
}

#[tokio::test]
async fn retry_of_successful_item_is_conflict() {
    let s = seeded();
    let record = HistoryDraft {
        subscription_id: Some(s.sub.id),
        repository: "target.repo".into(),
        branch: "target.branch".into(),
        action: ACTION_UPDATE_ASSETS,
    }
    .success(None);
    s.state.store.record(&record).unwrap();
    let app = depflow_server::build_router(s.state.clone());

    let (status, json) = post_json(
        app,
        &format!("/api/history/{}/retry", record.id),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json["error"].as_str().unwrap().contains("succeeded"));
    assert!(s.state.queue.pending().unwrap().is_empty());
}

#[tokio::test]
async fn retry_of_unknown_item_is_not_found() {
    let s = seeded();
    let app = depflow_server::build_router(s.state.clone());
    let (status, _) = post_json(
        app.clone(),
        &format!("/api/history/{}/retry", uuid::Uuid::new_v4()),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post_json(app, "/api/history/not-a-uuid/retry", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn new_build_trigger_enqueues_due_subscription() {
    let s = seeded();
    let app = depflow_server::build_router(s.state.clone());

    let (status, json) = post_json(
        app.clone(),
        "/api/triggers/build",
        serde_json::json!({ "build_id": s.build.id, "channel_id": s.channel.id }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["enqueued"], 1);
    assert_eq!(json["updates"][0]["build_id"], s.build.id);

    let (status, json) = get(app, "/api/queue/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ready"], 1);
    assert_eq!(json["total_enqueued"], 1);
}

#[tokio::test]
async fn new_build_trigger_for_unknown_build_is_not_found() {
    let s = seeded();
    let app = depflow_server::build_router(s.state.clone());
    let (status, json) = post_json(
        app,
        "/api/triggers/build",
        serde_json::json!({ "build_id": 999, "channel_id": s.channel.id }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn sweep_rejects_non_periodic_frequency() {
    let s = seeded();
    let app = depflow_server::build_router(s.state.clone());

    let (status, _) = post_json(
        app.clone(),
        "/api/triggers/sweep",
        serde_json::json!({ "frequency": "every_build" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        app.clone(),
        "/api/triggers/sweep",
        serde_json::json!({ "frequency": "hourly" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = post_json(
        app,
        "/api/triggers/sweep",
        serde_json::json!({ "frequency": "every_day" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["enqueued"], 0);
}

#[tokio::test]
async fn actor_state_is_null_before_first_run() {
    let s = seeded();
    let app = depflow_server::build_router(s.state.clone());

    let (status, json) = get(app.clone(), &format!("/api/subscriptions/{}/state", s.sub.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["actor_id"], s.sub.actor_id().to_string());
    assert!(json["state"].is_null());
    assert!(json["lease_owner"].is_null());

    let (status, _) = get(
        app,
        &format!("/api/subscriptions/{}/state", uuid::Uuid::new_v4()),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn check_enqueues_pull_request_check() {
    let s = seeded();
    let app = depflow_server::build_router(s.state.clone());
    let (status, _) = post_json(
        app,
        &format!("/api/subscriptions/{}/check", s.sub.id),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        s.state.queue.pending().unwrap(),
        vec![WorkItem::pull_request_check(&s.sub.actor_id())]
    );
}

#[tokio::test]
async fn subscriptions_and_config_are_listed() {
    let s = seeded();
    let app = depflow_server::build_router(s.state.clone());

    let (status, json) = get(app.clone(), "/api/subscriptions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json[0]["target_repository"], "target.repo");

    let (status, json) = get(app, "/api/config").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["config"]["workers"], 4);
    assert!(json["warnings"].is_array());
}
