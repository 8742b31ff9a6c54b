//! Session service: creation, hierarchy, cross-session messaging.
//!
//! Sits above the repository and the actor registry. Ownership and
//! hierarchy rules are enforced here; everything that mutates a live
//! session goes through its actor.

use serde_json::json;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::ids::{new_id, now_ts};

use super::actor::PromptRequest;
use super::models::{
    GitSourceType, Session, SessionGitState, SessionPurpose, SessionStatus,
};
use super::registry::SessionRegistry;
use super::repository::SessionRepository;

/// Longest accepted workspace name; also applies to derived names.
pub const MAX_WORKSPACE_LEN: usize = 100;

#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    pub default_model: Option<String>,
    /// Forwarded-message page size when the caller does not pass one.
    pub forward_default_limit: i64,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self { default_model: None, forward_default_limit: 50 }
    }
}

/// Parameters for creating a top-level session.
#[derive(Debug, Clone)]
pub struct CreateSessionParams {
    pub user_id: String,
    /// Initial prompt driving the session.
    pub task: String,
    pub workspace: String,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub parent_id: Option<String>,
    pub model: Option<String>,
    pub purpose: SessionPurpose,
    pub source_type: GitSourceType,
}

/// Parameters for spawning a child session under a parent.
#[derive(Debug, Clone)]
pub struct SpawnChildParams {
    pub parent_id: String,
    pub task: String,
    pub workspace: String,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub source_type: GitSourceType,
    pub model: Option<String>,
}

#[derive(Clone)]
pub struct SessionService {
    repo: SessionRepository,
    registry: SessionRegistry,
    config: SessionServiceConfig,
}

impl SessionService {
    pub fn new(
        repo: SessionRepository,
        registry: SessionRegistry,
        config: SessionServiceConfig,
    ) -> Self {
        Self { repo, registry, config }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Fetch a session, enforcing ownership.
    pub async fn get_owned(&self, user_id: &str, session_id: &str) -> CoreResult<Session> {
        let session = self
            .repo
            .get(session_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("session {session_id}")))?;
        if session.user_id != user_id {
            return Err(CoreError::Forbidden(format!(
                "session {session_id} belongs to another user"
            )));
        }
        Ok(session)
    }

    /// Create a session, enqueue its initial task prompt, and kick off the
    /// sandbox start in the background.
    pub async fn create_session(&self, params: CreateSessionParams) -> CoreResult<Session> {
        validate_workspace(&params.workspace)?;
        if params.task.trim().is_empty() {
            return Err(CoreError::validation("task must not be empty"));
        }

        if let Some(parent_id) = &params.parent_id {
            let parent = self
                .repo
                .get(parent_id)
                .await?
                .ok_or_else(|| CoreError::not_found(format!("parent session {parent_id}")))?;
            if parent.user_id != params.user_id {
                return Err(CoreError::Forbidden(
                    "parent session belongs to another user".to_string(),
                ));
            }
        }

        let id = new_id("ses");

        // Generally-enforced cycle guard; trivially impossible for fresh ids.
        if let Some(parent_id) = &params.parent_id {
            if *parent_id == id || self.repo.ancestor_ids(parent_id).await?.contains(&id) {
                return Err(CoreError::conflict("session hierarchy would form a cycle"));
            }
        }

        let ts = now_ts();
        let session = Session {
            id: id.clone(),
            user_id: params.user_id,
            parent_id: params.parent_id,
            workspace: params.workspace,
            title: derive_title(&params.task),
            status: SessionStatus::Pending,
            purpose: params.purpose,
            model_pref: params.model.or_else(|| self.config.default_model.clone()),
            metadata: "{}".to_string(),
            error_message: None,
            created_at: ts.clone(),
            updated_at: ts,
        };

        let git = if params.repo_url.is_some() || params.branch.is_some() {
            Some(SessionGitState {
                session_id: id.clone(),
                source_type: params.source_type,
                repo_url: params.repo_url,
                branch: params.branch,
                git_ref: None,
            })
        } else {
            None
        };

        self.repo.create(&session, git.as_ref()).await?;
        info!(session_id = %id, purpose = %session.purpose, "session created");

        let handle = self.registry.handle(&id);
        handle.prompt(PromptRequest::chat(params.task)).await?;
        spawn_background_start(handle);

        Ok(session)
    }

    /// Spawn a child session inheriting the parent's user. Credentials stay
    /// referenced through the user, never copied onto the child.
    pub async fn spawn_child(
        &self,
        user_id: &str,
        params: SpawnChildParams,
    ) -> CoreResult<Session> {
        let parent = self.get_owned(user_id, &params.parent_id).await?;
        if parent.status.is_terminal() {
            return Err(CoreError::conflict("cannot spawn under a terminated session"));
        }

        self.create_session(CreateSessionParams {
            user_id: parent.user_id,
            task: params.task,
            workspace: params.workspace,
            repo_url: params.repo_url,
            branch: params.branch,
            parent_id: Some(parent.id),
            model: params.model,
            purpose: SessionPurpose::Child,
            source_type: params.source_type,
        })
        .await
    }

    /// Create a workflow-owned session: starts hibernated and is woken only
    /// when a step needs it.
    pub async fn create_workflow_session(
        &self,
        user_id: &str,
        workspace: String,
        title: String,
    ) -> CoreResult<Session> {
        validate_workspace(&workspace)?;

        let id = new_id("ses");
        let ts = now_ts();
        let session = Session {
            id: id.clone(),
            user_id: user_id.to_string(),
            parent_id: None,
            workspace,
            title,
            status: SessionStatus::Hibernated,
            purpose: SessionPurpose::Workflow,
            model_pref: self.config.default_model.clone(),
            metadata: "{}".to_string(),
            error_message: None,
            created_at: ts.clone(),
            updated_at: ts,
        };
        self.repo.create(&session, None).await?;
        Ok(session)
    }

    /// Deliver a user-role message to a session. Allowed when the caller owns
    /// the target, or the sending session is an ancestor of it.
    pub async fn session_message(
        &self,
        caller_user: &str,
        target_id: &str,
        content: &str,
        from_session: Option<&str>,
        interrupt: bool,
    ) -> CoreResult<String> {
        if content.trim().is_empty() {
            return Err(CoreError::validation("content must not be empty"));
        }

        let target = self
            .repo
            .get(target_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("session {target_id}")))?;

        if target.user_id != caller_user {
            let is_ancestor = match from_session {
                Some(from) => self
                    .repo
                    .ancestor_ids(target_id)
                    .await?
                    .iter()
                    .any(|a| a == from),
                None => false,
            };
            if !is_ancestor {
                return Err(CoreError::Forbidden(format!(
                    "session {target_id} belongs to another user"
                )));
            }
        }

        let handle = self.registry.handle(target_id);

        // A hibernated target is woken so the message can be served.
        if matches!(target.status, SessionStatus::Hibernated | SessionStatus::Pending) {
            spawn_background_start(handle.clone());
        }

        let request = match from_session {
            Some(from) => PromptRequest::from_session(content, from, interrupt),
            None => PromptRequest {
                interrupt,
                ..PromptRequest::chat(content)
            },
        };
        handle.prompt(request).await
    }

    /// Child-to-parent notification; thin wrapper over `session_message`.
    pub async fn notify_parent(
        &self,
        child_id: &str,
        content: &str,
        interrupt: bool,
    ) -> CoreResult<String> {
        let child = self
            .repo
            .get(child_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("session {child_id}")))?;
        let parent_id = child
            .parent_id
            .clone()
            .ok_or_else(|| CoreError::conflict(format!("session {child_id} has no parent")))?;

        self.session_message(&child.user_id, &parent_id, content, Some(child_id), interrupt)
            .await
    }

    /// Copy messages from `source_id` into `target_id` (defaults to the
    /// source's parent), preserving attribution. Returns `(count, source)`.
    pub async fn forward_messages(
        &self,
        user_id: &str,
        source_id: &str,
        target_id: Option<&str>,
        limit: Option<i64>,
        after: Option<String>,
    ) -> CoreResult<(usize, String)> {
        let source = self.get_owned(user_id, source_id).await?;

        let target_id = match target_id {
            Some(explicit) => explicit.to_string(),
            None => source.parent_id.clone().ok_or_else(|| {
                CoreError::validation(
                    "forward target missing and source session has no parent",
                )
            })?,
        };
        self.get_owned(user_id, &target_id).await?;

        let limit = limit
            .unwrap_or(self.config.forward_default_limit)
            .clamp(1, 500);

        let handle = self.registry.handle(&target_id);
        let count = handle.forward_from(source.id.clone(), limit, after).await?;
        Ok((count, source.id))
    }

    pub async fn terminate(&self, user_id: &str, session_id: &str) -> CoreResult<()> {
        self.get_owned(user_id, session_id).await?;
        self.registry.handle(session_id).terminate().await
    }

    /// Release the sandbox but keep all durable state; `start` wakes it.
    pub async fn hibernate(&self, user_id: &str, session_id: &str) -> CoreResult<()> {
        self.get_owned(user_id, session_id).await?;
        self.registry.handle(session_id).hibernate().await
    }

    pub async fn revert(
        &self,
        user_id: &str,
        session_id: &str,
        message_id: String,
    ) -> CoreResult<()> {
        self.get_owned(user_id, session_id).await?;
        self.registry.handle(session_id).revert(message_id).await
    }

    pub async fn request_diff(
        &self,
        user_id: &str,
        session_id: &str,
        request_id: String,
    ) -> CoreResult<()> {
        self.get_owned(user_id, session_id).await?;
        self.registry.handle(session_id).request_diff(request_id).await
    }

    pub async fn heartbeat(&self, user_id: &str, session_id: &str) -> CoreResult<()> {
        self.get_owned(user_id, session_id).await?;
        self.registry.handle(session_id).heartbeat().await
    }

    /// Live status from the actor, falling back to the persisted row.
    pub async fn status(&self, user_id: &str, session_id: &str) -> CoreResult<SessionStatus> {
        let session = self.get_owned(user_id, session_id).await?;
        match self.registry.handle(session_id).status().await {
            Ok(status) => Ok(status),
            Err(err) => {
                warn!(session_id, error = %err, "actor status probe failed, using row");
                Ok(session.status)
            }
        }
    }

    pub async fn children(&self, user_id: &str, parent_id: &str) -> CoreResult<Vec<Session>> {
        self.get_owned(user_id, parent_id).await?;
        Ok(self.repo.list_children(parent_id).await?)
    }

    pub async fn answer(
        &self,
        user_id: &str,
        session_id: &str,
        question_id: String,
        value: String,
    ) -> CoreResult<()> {
        self.get_owned(user_id, session_id).await?;
        self.registry.handle(session_id).answer(question_id, value).await
    }

    pub async fn messages(
        &self,
        user_id: &str,
        session_id: &str,
        limit: i64,
        after: Option<&str>,
    ) -> CoreResult<Vec<super::models::Message>> {
        self.get_owned(user_id, session_id).await?;
        Ok(self.repo.list_messages(session_id, limit.clamp(1, 500), after).await?)
    }

    pub fn repo(&self) -> &SessionRepository {
        &self.repo
    }

    /// Live workflow-owned session for a workspace, if any.
    pub async fn find_workflow_session(
        &self,
        user_id: &str,
        workspace: &str,
    ) -> CoreResult<Option<Session>> {
        Ok(self.repo.find_workflow_session(user_id, workspace).await?)
    }

    /// The assistant reply to a delivered prompt, once the runner has
    /// finalized it.
    pub async fn find_reply(&self, message_id: &str) -> CoreResult<Option<String>> {
        let reply = self.repo.get_message(&format!("{message_id}.r")).await?;
        Ok(reply.map(|m| m.content))
    }

    /// Resolve an orchestrator handle (stored in session metadata) to the
    /// owning user. Ambiguous or unknown handles are rejected.
    pub async fn resolve_handle(&self, handle: &str) -> CoreResult<String> {
        let sessions = sqlx_resolve_handle(&self.repo, handle).await?;
        let mut users: Vec<String> = sessions;
        users.sort();
        users.dedup();
        match users.len() {
            0 => Err(CoreError::UnknownRecipient(format!("no orchestrator with handle {handle}"))),
            1 => Ok(users.remove(0)),
            _ => Err(CoreError::UnknownRecipient(format!(
                "handle {handle} is ambiguous across users"
            ))),
        }
    }
}

async fn sqlx_resolve_handle(
    repo: &SessionRepository,
    handle: &str,
) -> CoreResult<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT user_id FROM sessions \
         WHERE purpose = 'orchestrator' AND status != 'terminated' \
           AND json_extract(metadata, '$.handle') = ?",
    )
    .bind(handle)
    .fetch_all(repo.pool())
    .await
    .map_err(CoreError::from)?;
    Ok(rows.into_iter().map(|(u,)| u).collect())
}

fn spawn_background_start(handle: super::actor::ActorHandle) {
    tokio::spawn(async move {
        if let Err(err) = handle.start().await {
            warn!(
                session_id = handle.session_id(),
                error = %err,
                "background session start failed"
            );
        }
    });
}

fn derive_title(task: &str) -> String {
    let line = task.lines().next().unwrap_or_default().trim();
    let mut title: String = line.chars().take(80).collect();
    if title.is_empty() {
        title = "untitled session".to_string();
    }
    title
}

/// Workspace names are path segments, never paths.
pub fn validate_workspace(workspace: &str) -> CoreResult<()> {
    if workspace.is_empty() {
        return Err(CoreError::validation("workspace must not be empty"));
    }
    if workspace.contains('/') {
        return Err(CoreError::validation("workspace must not contain '/'"));
    }
    if workspace.len() > MAX_WORKSPACE_LEN {
        return Err(CoreError::validation(format!(
            "workspace must be at most {MAX_WORKSPACE_LEN} characters"
        )));
    }
    Ok(())
}

/// Attach an orchestrator handle to a session's metadata.
pub async fn set_orchestrator_handle(
    repo: &SessionRepository,
    session_id: &str,
    handle: &str,
) -> CoreResult<()> {
    let session = repo
        .get(session_id)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("session {session_id}")))?;
    let mut metadata = session.metadata_value();
    if !metadata.is_object() {
        metadata = json!({});
    }
    metadata["handle"] = json!(handle);
    repo.update_metadata(session_id, &metadata.to_string()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::db::Database;
    use crate::sandbox::{SandboxSupervisor, StubSandbox, SupervisorConfig};
    use crate::session::actor::ActorTiming;
    use std::sync::Arc;
    use std::time::Duration;

    async fn service() -> (SessionService, SessionRepository) {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());
        let supervisor = Arc::new(SandboxSupervisor::new(
            Arc::new(StubSandbox::new()),
            SupervisorConfig {
                start_timeout: Duration::from_millis(20),
                health_polls: 1,
                ..SupervisorConfig::default()
            },
        ));
        let registry = SessionRegistry::with_timing(
            repo.clone(),
            Arc::new(EventBus::new()),
            supervisor,
            ActorTiming {
                call_deadline: Duration::from_secs(2),
                heartbeat_interval: Duration::from_millis(50),
                heartbeat_timeout: Duration::from_secs(10),
                terminate_grace: Duration::from_millis(5),
            },
        );
        (
            SessionService::new(repo.clone(), registry, SessionServiceConfig::default()),
            repo,
        )
    }

    fn create_params(user: &str, workspace: &str) -> CreateSessionParams {
        CreateSessionParams {
            user_id: user.to_string(),
            task: "build the service".to_string(),
            workspace: workspace.to_string(),
            repo_url: None,
            branch: None,
            parent_id: None,
            model: None,
            purpose: SessionPurpose::Interactive,
            source_type: GitSourceType::Manual,
        }
    }

    #[tokio::test]
    async fn workspace_with_slash_is_rejected() {
        let (service, _repo) = service().await;
        let err = service
            .create_session(create_params("u1", "svc/evil"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn spawn_child_inherits_user_and_links_parent() {
        let (service, repo) = service().await;
        let parent = service.create_session(create_params("u1", "svc")).await.unwrap();

        let child = service
            .spawn_child(
                "u1",
                SpawnChildParams {
                    parent_id: parent.id.clone(),
                    task: "subtask".to_string(),
                    workspace: "svc-child".to_string(),
                    repo_url: None,
                    branch: None,
                    source_type: GitSourceType::Manual,
                    model: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(child.user_id, "u1");
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(child.purpose, SessionPurpose::Child);

        let children = repo.list_children(&parent.id).await.unwrap();
        assert_eq!(children.len(), 1);
    }

    #[tokio::test]
    async fn spawn_child_refused_for_foreign_parent() {
        let (service, _repo) = service().await;
        let parent = service.create_session(create_params("u1", "svc")).await.unwrap();

        let err = service
            .spawn_child(
                "u2",
                SpawnChildParams {
                    parent_id: parent.id,
                    task: "subtask".to_string(),
                    workspace: "w".to_string(),
                    repo_url: None,
                    branch: None,
                    source_type: GitSourceType::Manual,
                    model: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn session_message_enforces_ownership() {
        let (service, _repo) = service().await;
        let target = service.create_session(create_params("u1", "svc")).await.unwrap();

        let err = service
            .session_message("u2", &target.id, "hi", None, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        service
            .session_message("u1", &target.id, "hi", None, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn notify_parent_requires_a_parent() {
        let (service, _repo) = service().await;
        let orphan = service.create_session(create_params("u1", "svc")).await.unwrap();

        let err = service.notify_parent(&orphan.id, "done", false).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        assert!(err.to_string().contains("no parent"));
    }

    #[tokio::test]
    async fn forward_defaults_to_parent_and_reports_count() {
        let (service, repo) = service().await;
        let parent = service.create_session(create_params("u1", "svc")).await.unwrap();
        let child = service
            .spawn_child(
                "u1",
                SpawnChildParams {
                    parent_id: parent.id.clone(),
                    task: "subtask".to_string(),
                    workspace: "sub".to_string(),
                    repo_url: None,
                    branch: None,
                    source_type: GitSourceType::Manual,
                    model: None,
                },
            )
            .await
            .unwrap();

        // The child emits messages (its initial task prompt is one already).
        for n in 0..2 {
            let msg = crate::session::models::Message {
                id: format!("msg_c{n}"),
                session_id: child.id.clone(),
                role: crate::session::models::MessageRole::Assistant,
                content: format!("update {n}"),
                channel_type: "chat".to_string(),
                channel_id: None,
                tool_call: None,
                forward_from: None,
                edit_of: None,
                created_at: now_ts(),
            };
            repo.insert_message(&msg).await.unwrap();
        }

        let (count, source) = service
            .forward_messages("u1", &child.id, None, Some(20), None)
            .await
            .unwrap();
        assert_eq!(source, child.id);
        assert_eq!(count, 3); // initial task prompt + 2 assistant updates

        let forwarded = repo.list_messages(&parent.id, 50, None).await.unwrap();
        let copies: Vec<_> = forwarded
            .iter()
            .filter(|m| m.forward_from.as_deref() == Some(child.id.as_str()))
            .collect();
        assert_eq!(copies.len(), 3);
    }

    #[tokio::test]
    async fn workflow_sessions_start_hibernated() {
        let (service, _repo) = service().await;
        let session = service
            .create_workflow_session("u1", "workflow-abc".to_string(), "wf".to_string())
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Hibernated);
        assert_eq!(session.purpose, SessionPurpose::Workflow);
    }

    #[tokio::test]
    async fn handle_resolution_requires_unique_owner() {
        let (service, repo) = service().await;

        let make_orch = |user: &str| {
            let mut params = create_params(user, "orch");
            params.purpose = SessionPurpose::Orchestrator;
            params
        };

        let a = service.create_session(make_orch("u1")).await.unwrap();
        set_orchestrator_handle(&repo, &a.id, "deploys").await.unwrap();

        assert_eq!(service.resolve_handle("deploys").await.unwrap(), "u1");
        assert_eq!(
            service.resolve_handle("nobody").await.unwrap_err().code(),
            "UNKNOWN_RECIPIENT"
        );

        let b = service.create_session(make_orch("u2")).await.unwrap();
        set_orchestrator_handle(&repo, &b.id, "deploys").await.unwrap();
        assert_eq!(
            service.resolve_handle("deploys").await.unwrap_err().code(),
            "UNKNOWN_RECIPIENT"
        );
    }
}
