pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // History
        .route("/api/history", get(routes::history::list_history))
        .route("/api/history/{id}", get(routes::history::get_history))
        .route(
            "/api/history/{id}/retry",
            post(routes::history::retry_history),
        )
        // Triggers
        .route("/api/triggers/build", post(routes::triggers::new_build))
        .route("/api/triggers/sweep", post(routes::triggers::sweep))
        // Subscriptions
        .route(
            "/api/subscriptions",
            get(routes::subscriptions::list_subscriptions),
        )
        .route(
            "/api/subscriptions/{id}",
            get(routes::subscriptions::get_subscription),
        )
        .route(
            "/api/subscriptions/{id}/state",
            get(routes::subscriptions::get_actor_state),
        )
        .route(
            "/api/subscriptions/{id}/check",
            post(routes::subscriptions::check_pull_request),
        )
        // Queue
        .route("/api/queue/stats", get(routes::queue::get_stats))
        // Config
        .route("/api/config", get(routes::config::get_config))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Serve the HTTP surface on `port` until `cancel` fires.
pub async fn serve(app_state: AppState, port: u16, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    serve_on(app_state, listener, cancel).await
}

/// Like `serve`, on a pre-bound listener so callers can bind port 0 and read
/// the actual port first.
pub async fn serve_on(
    app_state: AppState,
    listener: tokio::net::TcpListener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let port = listener.local_addr()?.port();
    let app = build_router(app_state);

    tracing::info!("depflow server listening on http://localhost:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
