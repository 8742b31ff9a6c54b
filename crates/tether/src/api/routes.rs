//! Route table.

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bus::events_ws_handler;
use crate::runner::runner_ws_handler;

use super::handlers;
use super::state::AppState;

/// Build the full application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Sessions
        .route("/api/sessions", post(handlers::create_session))
        .route("/api/sessions/{id}/terminate", post(handlers::terminate_session))
        .route("/api/sessions/{id}/heartbeat", post(handlers::session_heartbeat))
        .route("/api/sessions/{id}/hibernate", post(handlers::hibernate_session))
        .route("/api/sessions/{id}/messages", get(handlers::session_messages))
        .route("/api/sessions/{id}/answer", post(handlers::answer_question))
        .route("/api/sessions/{id}/revert", post(handlers::revert_session))
        .route("/api/sessions/{id}/diff", post(handlers::diff_session))
        .route("/api/session-message", post(handlers::session_message))
        .route("/api/notify-parent", post(handlers::notify_parent))
        .route("/api/spawn-child", post(handlers::spawn_child))
        .route("/api/child-sessions", get(handlers::child_sessions))
        .route("/api/session-status", get(handlers::session_status))
        .route("/api/forward-messages", post(handlers::forward_messages))
        // Notifications & mailbox
        .route("/api/notifications/emit", post(handlers::emit_notification))
        .route("/api/mailbox", get(handlers::read_mailbox))
        // Task board
        .route("/api/tasks", get(handlers::list_tasks).post(handlers::create_task))
        .route("/api/tasks/{id}", put(handlers::update_task))
        .route("/api/my-tasks", get(handlers::my_tasks))
        // Workflows & executions
        .route("/api/workflows", post(handlers::create_workflow))
        .route("/api/workflows/{id}", get(handlers::get_workflow))
        .route("/api/workflows/{id}/run", post(handlers::run_workflow))
        .route("/api/workflows/{id}/rollback", post(handlers::rollback_workflow))
        .route("/api/workflows/{id}/proposals", post(handlers::create_proposal))
        .route(
            "/api/workflows/{id}/proposals/{pid}/review",
            post(handlers::review_proposal),
        )
        .route(
            "/api/workflows/{id}/proposals/{pid}/apply",
            post(handlers::apply_proposal),
        )
        .route("/api/executions/{id}", get(handlers::get_execution))
        .route("/api/executions/{id}/steps", get(handlers::get_execution_steps))
        .route("/api/executions/{id}/approve", post(handlers::approve_execution))
        // Realtime
        .route("/api/events/ws", get(events_ws_handler))
        .route("/api/runner/ws/{session_id}", get(runner_ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
