//! Test utilities and common setup.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

use tether::api::{create_router, ApiSettings, AppState};
use tether::bus::EventBus;
use tether::db::Database;
use tether::mailbox::{MailboxRepository, MailboxService};
use tether::sandbox::{SandboxSupervisor, StubSandbox, SupervisorConfig};
use tether::session::{
    ActorTiming, SessionRegistry, SessionRepository, SessionService, SessionServiceConfig,
};
use tether::tasks::{TaskRepository, TaskService};
use tether::workflow::{SessionStepEffects, WorkflowEngine, WorkflowRepository, WorkflowService};

/// Build the full application against an in-memory database and a stub
/// sandbox backend (always healthy, no runner process).
pub async fn test_app() -> Router {
    let db = Database::in_memory().await.unwrap();
    let bus = Arc::new(EventBus::new());

    let supervisor = Arc::new(SandboxSupervisor::new(
        Arc::new(StubSandbox::new()),
        SupervisorConfig {
            start_timeout: Duration::from_millis(20),
            health_polls: 1,
            ..SupervisorConfig::default()
        },
    ));

    let session_repo = SessionRepository::new(db.pool().clone());
    let registry = SessionRegistry::with_timing(
        session_repo.clone(),
        bus.clone(),
        supervisor,
        ActorTiming {
            call_deadline: Duration::from_secs(2),
            heartbeat_interval: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_secs(30),
            terminate_grace: Duration::from_millis(10),
        },
    );
    let sessions = Arc::new(SessionService::new(
        session_repo.clone(),
        registry,
        SessionServiceConfig::default(),
    ));

    let mailbox = Arc::new(MailboxService::new(
        MailboxRepository::new(db.pool().clone()),
        sessions.clone(),
        bus.clone(),
    ));
    let tasks = Arc::new(TaskService::new(TaskRepository::new(db.pool().clone())));

    let workflow_repo = WorkflowRepository::new(db.pool().clone());
    let effects = Arc::new(SessionStepEffects::new(sessions.clone()));
    let engine = WorkflowEngine::new(workflow_repo.clone(), effects, bus.clone());
    let workflows = Arc::new(WorkflowService::new(workflow_repo, engine));

    let state = AppState::new(
        sessions,
        session_repo,
        mailbox,
        tasks,
        workflows,
        bus,
        ApiSettings { default_user: None },
    );
    create_router(state)
}

/// Issue a request as user `u1` and decode the JSON response.
pub async fn request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    request_as(app, method, uri, body, Some("u1")).await
}

pub async fn request_as(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    user: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(uri).method(method);
    if let Some(user) = user {
        builder = builder.header("x-tether-user", user);
    }

    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

pub async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    request(app, Method::POST, uri, Some(body)).await
}

pub async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    request(app, Method::GET, uri, None).await
}

pub async fn put(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    request(app, Method::PUT, uri, Some(body)).await
}
