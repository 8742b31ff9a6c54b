//! Session domain: models, persistence, the per-session actor, and the
//! service that orchestrates lifecycle, hierarchy, and message forwarding.

mod actor;
mod models;
mod registry;
mod repository;
mod service;

pub use actor::{ActorHandle, ActorTiming, PromptRequest, SessionCommand};
pub use models::{
    can_transition, GitSourceType, Message, MessageRole, Session, SessionGitState, SessionPurpose,
    SessionStatus,
};
pub use registry::SessionRegistry;
pub use repository::SessionRepository;
pub use service::{
    set_orchestrator_handle, validate_workspace, CreateSessionParams, SessionService,
    SessionServiceConfig, SpawnChildParams, MAX_WORKSPACE_LEN,
};
