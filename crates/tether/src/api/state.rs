//! Application state shared across handlers.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::mailbox::MailboxService;
use crate::session::{SessionRepository, SessionService};
use crate::tasks::TaskService;
use crate::workflow::WorkflowService;

/// API-layer knobs.
#[derive(Clone, Debug, Default)]
pub struct ApiSettings {
    /// Caller identity assumed when no `x-tether-user` header is present
    /// (single-user dev mode). `None` makes identity mandatory.
    pub default_user: Option<String>,
}

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionService>,
    /// Direct repository access for the runner link's token check.
    pub session_repo: SessionRepository,
    pub mailbox: Arc<MailboxService>,
    pub tasks: Arc<TaskService>,
    pub workflows: Arc<WorkflowService>,
    pub bus: Arc<EventBus>,
    pub settings: ApiSettings,
}

impl AppState {
    pub fn new(
        sessions: Arc<SessionService>,
        session_repo: SessionRepository,
        mailbox: Arc<MailboxService>,
        tasks: Arc<TaskService>,
        workflows: Arc<WorkflowService>,
        bus: Arc<EventBus>,
        settings: ApiSettings,
    ) -> Self {
        Self { sessions, session_repo, mailbox, tasks, workflows, bus, settings }
    }
}
