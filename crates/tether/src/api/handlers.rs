//! Request handlers. Thin by design: decode, call into the core, encode.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::mailbox::{EmitParams, MailboxMessageType, Recipient};
use crate::session::{
    CreateSessionParams, GitSourceType, SessionPurpose, SpawnChildParams,
};
use crate::tasks::{CreateTaskParams, TaskFilters, TaskStatus, TaskUpdate};
use crate::workflow::{CreateProposalParams, ResumeParams, RunParams};

use super::auth::CurrentUser;
use super::error::{ApiError, ApiResult};
use super::state::AppState;

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    task: String,
    workspace: String,
    repo_url: Option<String>,
    branch: Option<String>,
    parent_id: Option<String>,
    model: Option<String>,
    purpose: Option<String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult<Json<Value>> {
    let purpose = match body.purpose.as_deref() {
        None | Some("interactive") => SessionPurpose::Interactive,
        Some("orchestrator") => SessionPurpose::Orchestrator,
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "purpose must be interactive or orchestrator, got '{other}'"
            )))
        }
    };

    let session = state
        .sessions
        .create_session(CreateSessionParams {
            user_id: user.id().to_string(),
            task: body.task,
            workspace: body.workspace,
            repo_url: body.repo_url,
            branch: body.branch,
            parent_id: body.parent_id,
            model: body.model,
            purpose,
            source_type: GitSourceType::Manual,
        })
        .await?;

    Ok(Json(json!({ "sessionId": session.id })))
}

pub async fn terminate_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.sessions.terminate(user.id(), &session_id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn session_heartbeat(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.sessions.heartbeat(user.id(), &session_id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn hibernate_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.sessions.hibernate(user.id(), &session_id).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessageBody {
    session_id: String,
    content: String,
    #[serde(default)]
    interrupt: bool,
    from_session_id: Option<String>,
}

pub async fn session_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<SessionMessageBody>,
) -> ApiResult<Json<Value>> {
    let message_id = state
        .sessions
        .session_message(
            user.id(),
            &body.session_id,
            &body.content,
            body.from_session_id.as_deref(),
            body.interrupt,
        )
        .await?;
    Ok(Json(json!({ "ok": true, "messageId": message_id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnChildBody {
    parent_id: String,
    task: String,
    workspace: String,
    repo_url: Option<String>,
    branch: Option<String>,
    source_type: Option<String>,
    model: Option<String>,
}

pub async fn spawn_child(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<SpawnChildBody>,
) -> ApiResult<Json<Value>> {
    let source_type = match body.source_type.as_deref() {
        None => GitSourceType::Manual,
        Some(raw) => raw
            .parse::<GitSourceType>()
            .map_err(ApiError::bad_request)?,
    };

    let child = state
        .sessions
        .spawn_child(
            user.id(),
            SpawnChildParams {
                parent_id: body.parent_id,
                task: body.task,
                workspace: body.workspace,
                repo_url: body.repo_url,
                branch: body.branch,
                source_type,
                model: body.model,
            },
        )
        .await?;

    Ok(Json(json!({ "sessionId": child.id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdQuery {
    session_id: String,
}

pub async fn child_sessions(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<SessionIdQuery>,
) -> ApiResult<Json<Value>> {
    let children = state.sessions.children(user.id(), &query.session_id).await?;
    Ok(Json(json!({ "children": children })))
}

pub async fn session_status(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<SessionIdQuery>,
) -> ApiResult<Json<Value>> {
    let status = state.sessions.status(user.id(), &query.session_id).await?;
    Ok(Json(json!({ "sessionStatus": status })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardMessagesBody {
    /// Source session to copy from.
    session_id: String,
    /// Defaults to the source's parent.
    target_session_id: Option<String>,
    limit: Option<i64>,
    after: Option<String>,
}

pub async fn forward_messages(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<ForwardMessagesBody>,
) -> ApiResult<Json<Value>> {
    let (count, source_session_id) = state
        .sessions
        .forward_messages(
            user.id(),
            &body.session_id,
            body.target_session_id.as_deref(),
            body.limit,
            body.after,
        )
        .await?;
    Ok(Json(json!({ "count": count, "sourceSessionId": source_session_id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    limit: Option<i64>,
    after: Option<String>,
}

pub async fn session_messages(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<Value>> {
    let messages = state
        .sessions
        .messages(
            user.id(),
            &session_id,
            query.limit.unwrap_or(100),
            query.after.as_deref(),
        )
        .await?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerBody {
    question_id: String,
    answer: String,
}

pub async fn answer_question(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    Json(body): Json<AnswerBody>,
) -> ApiResult<Json<Value>> {
    state
        .sessions
        .answer(user.id(), &session_id, body.question_id, body.answer)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertBody {
    message_id: String,
}

pub async fn revert_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    Json(body): Json<RevertBody>,
) -> ApiResult<Json<Value>> {
    state.sessions.revert(user.id(), &session_id, body.message_id).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffBody {
    request_id: Option<String>,
}

pub async fn diff_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    Json(body): Json<DiffBody>,
) -> ApiResult<Json<Value>> {
    let request_id = body
        .request_id
        .unwrap_or_else(|| crate::ids::new_id("req"));
    state
        .sessions
        .request_diff(user.id(), &session_id, request_id.clone())
        .await?;
    Ok(Json(json!({ "ok": true, "requestId": request_id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyParentBody {
    session_id: String,
    content: String,
    #[serde(default)]
    interrupt: bool,
}

pub async fn notify_parent(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<NotifyParentBody>,
) -> ApiResult<Json<Value>> {
    // The child must belong to the caller; the parent check lives in the
    // service.
    state.sessions.get_owned(user.id(), &body.session_id).await?;
    let message_id = state
        .sessions
        .notify_parent(&body.session_id, &body.content, body.interrupt)
        .await?;
    Ok(Json(json!({ "ok": true, "messageId": message_id })))
}

// ---------------------------------------------------------------------------
// Notifications & mailbox
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EmitNotificationBody {
    to_session_id: Option<String>,
    to_user_id: Option<String>,
    to_handle: Option<String>,
    content: String,
    message_type: Option<String>,
    from_session_id: Option<String>,
    context_session_id: Option<String>,
    context_task_id: Option<String>,
    reply_to_id: Option<String>,
}

pub async fn emit_notification(
    State(state): State<AppState>,
    _user: CurrentUser,
    Json(body): Json<EmitNotificationBody>,
) -> ApiResult<Json<Value>> {
    let message_type = match body.message_type.as_deref() {
        None => None,
        Some(raw) => Some(
            raw.parse::<MailboxMessageType>()
                .map_err(ApiError::bad_request)?,
        ),
    };

    let entry = state
        .mailbox
        .emit(EmitParams {
            to_session_id: body.to_session_id,
            to_user_id: body.to_user_id,
            to_handle: body.to_handle,
            message_type,
            content: body.content,
            from_session_id: body.from_session_id,
            context_session_id: body.context_session_id,
            context_task_id: body.context_task_id,
            reply_to_id: body.reply_to_id,
        })
        .await?;

    Ok(Json(json!({ "ok": true, "id": entry.id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxQuery {
    limit: Option<i64>,
    after: Option<String>,
    /// Read a session-addressed queue instead of the caller's user queue.
    session_id: Option<String>,
}

pub async fn read_mailbox(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<MailboxQuery>,
) -> ApiResult<Json<Value>> {
    let recipient = match query.session_id {
        Some(session_id) => {
            // Session queues are readable only by the session's owner.
            state.sessions.get_owned(user.id(), &session_id).await?;
            Recipient::Session(session_id)
        }
        None => Recipient::User(user.id().to_string()),
    };

    let messages = state.mailbox.fetch(recipient, query.limit, query.after).await?;
    Ok(Json(json!({ "messages": messages })))
}

// ---------------------------------------------------------------------------
// Task board
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskBody {
    orchestrator_session_id: String,
    title: String,
    description: Option<String>,
    assignee_session_id: Option<String>,
    parent_task_id: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
}

pub async fn create_task(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<CreateTaskBody>,
) -> ApiResult<Json<Value>> {
    state
        .sessions
        .get_owned(user.id(), &body.orchestrator_session_id)
        .await?;

    let task = state
        .tasks
        .create(CreateTaskParams {
            orchestrator_session_id: body.orchestrator_session_id,
            title: body.title,
            description: body.description,
            assignee_session_id: body.assignee_session_id,
            parent_task_id: body.parent_task_id,
            depends_on: body.depends_on,
        })
        .await?;

    Ok(Json(json!({ "task": task })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TasksQuery {
    status: Option<String>,
    limit: Option<i64>,
    orchestrator_session_id: Option<String>,
}

fn parse_status(raw: Option<&str>) -> ApiResult<Option<TaskStatus>> {
    match raw {
        None => Ok(None),
        Some(raw) => raw
            .parse::<TaskStatus>()
            .map(Some)
            .map_err(ApiError::bad_request),
    }
}

pub async fn list_tasks(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<TasksQuery>,
) -> ApiResult<Json<Value>> {
    let tasks = state
        .tasks
        .list(TaskFilters {
            orchestrator_session_id: query.orchestrator_session_id,
            status: parse_status(query.status.as_deref())?,
            limit: query.limit,
        })
        .await?;
    Ok(Json(json!({ "tasks": tasks })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MyTasksQuery {
    session_id: String,
    status: Option<String>,
}

pub async fn my_tasks(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<MyTasksQuery>,
) -> ApiResult<Json<Value>> {
    let tasks = state
        .tasks
        .list_for_session(&query.session_id, parse_status(query.status.as_deref())?)
        .await?;
    Ok(Json(json!({ "tasks": tasks })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskBody {
    status: Option<String>,
    result: Option<String>,
    description: Option<String>,
    title: Option<String>,
    session_id: Option<String>,
}

pub async fn update_task(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(task_id): Path<String>,
    Json(body): Json<UpdateTaskBody>,
) -> ApiResult<Json<Value>> {
    let task = state
        .tasks
        .update(
            &task_id,
            TaskUpdate {
                status: parse_status(body.status.as_deref())?,
                result: body.result,
                description: body.description,
                title: body.title,
                session_id: body.session_id,
            },
        )
        .await?;
    Ok(Json(json!({ "task": task })))
}

// ---------------------------------------------------------------------------
// Workflows & executions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowBody {
    slug: String,
    name: String,
    description: Option<String>,
    definition: Value,
}

pub async fn create_workflow(
    State(state): State<AppState>,
    _user: CurrentUser,
    Json(body): Json<CreateWorkflowBody>,
) -> ApiResult<Json<Value>> {
    let workflow = state
        .workflows
        .create_workflow(
            &body.slug,
            &body.name,
            body.description.as_deref(),
            &body.definition,
        )
        .await?;
    Ok(Json(json!({ "workflow": workflow })))
}

pub async fn get_workflow(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let workflow = state.workflows.get_workflow(&workflow_id).await?;
    Ok(Json(json!({ "workflow": workflow })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunWorkflowBody {
    workflow_hash: String,
    variables: Option<Value>,
    execution_id: Option<String>,
    trigger: Option<String>,
}

pub async fn run_workflow(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(workflow_id): Path<String>,
    Json(body): Json<RunWorkflowBody>,
) -> ApiResult<Json<Value>> {
    let report = state
        .workflows
        .run(RunParams {
            workflow: workflow_id,
            workflow_hash: body.workflow_hash,
            variables: body.variables.unwrap_or_else(|| json!({})),
            trigger: body.trigger.unwrap_or_else(|| "manual".to_string()),
            execution_id: body.execution_id,
            user_id: user.id().to_string(),
        })
        .await?;

    Ok(Json(json!({
        "executionId": report.execution_id,
        "status": report.status,
        "resumeToken": report.resume_token,
        "error": report.error,
    })))
}

pub async fn get_execution(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let execution = state.workflows.get_execution(&execution_id).await?;
    Ok(Json(json!({ "execution": execution })))
}

#[derive(Debug, Deserialize)]
pub struct StepsQuery {
    limit: Option<i64>,
}

pub async fn get_execution_steps(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(execution_id): Path<String>,
    Query(query): Query<StepsQuery>,
) -> ApiResult<Json<Value>> {
    let steps = state.workflows.execution_steps(&execution_id, query.limit).await?;
    Ok(Json(json!({ "steps": steps })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveBody {
    approve: bool,
    resume_token: String,
    reason: Option<String>,
    /// Hash the caller intends to resume against; defaults to the
    /// execution's own hash (still checked against the workflow's current).
    workflow_hash: Option<String>,
    variables: Option<Value>,
}

pub async fn approve_execution(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(execution_id): Path<String>,
    Json(body): Json<ApproveBody>,
) -> ApiResult<Json<Value>> {
    let workflow_hash = match body.workflow_hash {
        Some(hash) => hash,
        None => {
            state
                .workflows
                .get_execution(&execution_id)
                .await?
                .workflow_hash
        }
    };

    let report = state
        .workflows
        .resume(ResumeParams {
            execution_id,
            workflow_hash,
            resume_token: body.resume_token,
            approve: body.approve,
            reason: body.reason,
            variables: body.variables,
            user_id: user.id().to_string(),
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "status": report.status,
        "resumeToken": report.resume_token,
    })))
}

// ---------------------------------------------------------------------------
// Proposals
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProposalBody {
    base_workflow_hash: String,
    proposal: Value,
    diff_text: Option<String>,
    expires_at: Option<String>,
    execution_id: Option<String>,
    proposed_by_session_id: Option<String>,
}

pub async fn create_proposal(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(workflow_id): Path<String>,
    Json(body): Json<CreateProposalBody>,
) -> ApiResult<Json<Value>> {
    let workflow = state.workflows.get_workflow(&workflow_id).await?;
    let proposal = state
        .workflows
        .proposals()
        .create(CreateProposalParams {
            workflow_id: workflow.id,
            base_hash: body.base_workflow_hash,
            proposal: body.proposal,
            diff_text: body.diff_text,
            expires_at: body.expires_at,
            execution_id: body.execution_id,
            proposed_by_session_id: body.proposed_by_session_id,
        })
        .await?;
    Ok(Json(json!({ "proposal": proposal })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewProposalBody {
    approve: bool,
    notes: Option<String>,
}

pub async fn review_proposal(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path((_workflow_id, proposal_id)): Path<(String, String)>,
    Json(body): Json<ReviewProposalBody>,
) -> ApiResult<Json<Value>> {
    let proposal = state
        .workflows
        .proposals()
        .review(&proposal_id, body.approve, body.notes.as_deref())
        .await?;
    Ok(Json(json!({ "proposal": proposal })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyProposalBody {
    review_notes: Option<String>,
    version: Option<i64>,
}

pub async fn apply_proposal(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path((_workflow_id, proposal_id)): Path<(String, String)>,
    Json(body): Json<ApplyProposalBody>,
) -> ApiResult<Json<Value>> {
    let (hash, version) = state
        .workflows
        .proposals()
        .apply(&proposal_id, body.review_notes.as_deref(), body.version)
        .await?;
    Ok(Json(json!({ "ok": true, "newWorkflowHash": hash, "version": version })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackBody {
    target_workflow_hash: String,
    version: Option<i64>,
    notes: Option<String>,
}

pub async fn rollback_workflow(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(workflow_id): Path<String>,
    Json(body): Json<RollbackBody>,
) -> ApiResult<Json<Value>> {
    let workflow = state.workflows.get_workflow(&workflow_id).await?;
    let (hash, version) = state
        .workflows
        .proposals()
        .rollback(
            &workflow.id,
            &body.target_workflow_hash,
            body.version,
            body.notes.as_deref(),
        )
        .await?;
    Ok(Json(json!({ "ok": true, "workflowHash": hash, "version": version })))
}
