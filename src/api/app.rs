use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::api::handlers;
use crate::api::state::AppState;

pub fn build_app(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/api/health", get(handlers::health))
        .route("/api/providers", get(handlers::providers))
        // Runs
        .route("/api/run/start", post(handlers::run_start))
        .route("/api/run/:id/stop", post(handlers::run_stop))
        .route("/api/run/:id/status", get(handlers::run_status))
        .route("/api/run/:id/stream", get(handlers::run_stream))
        // Opencode proxies
        .route(
            "/api/run/:id/:provider/opencode/health",
            get(handlers::opencode_health),
        )
        .route(
            "/api/run/:id/:provider/opencode/session",
            get(handlers::opencode_sessions),
        )
        .route(
            "/api/run/:id/:provider/opencode/session/:sid/message",
            get(handlers::opencode_messages),
        )
        // Sandboxes
        .route("/api/sandbox/create", post(handlers::sandbox_create))
        .route("/api/sandbox/:id/destroy", post(handlers::sandbox_destroy))
        .route("/api/sandbox/:id/ls", get(handlers::sandbox_ls))
        .route("/api/sandbox/:id/read", get(handlers::sandbox_read))
        .route("/api/sandbox/:id/run", post(handlers::sandbox_run))
        .route("/api/sandbox/:id/exec", post(handlers::sandbox_exec))
        // User data
        .route(
            "/api/user/keys",
            get(handlers::keys_list).post(handlers::keys_create),
        )
        .route("/api/user/keys/:id", delete(handlers::keys_delete))
        .route("/api/user/sandboxes", get(handlers::user_sandboxes))
        .route("/api/user/runs", get(handlers::user_runs))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
