//! Workflow execution engine.
//!
//! Executions are driven by a trace: a step whose latest attempt succeeded
//! is skipped on re-entry, so resuming after an approval gate (or a process
//! restart) is a re-walk of the tree against durable state rather than an
//! in-memory cursor. All side effects go through the `StepEffects` seam.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bus::{BusEvent, EventBus};
use crate::error::{CoreError, CoreResult};
use crate::ids::resume_token;

use super::definition::{parse_steps, workflow_workspace, Step};
use super::models::{ExecutionStatus, StepStatus, StepTrace, Workflow};
use super::repository::WorkflowRepository;

/// Execution context handed to step effects.
#[derive(Debug, Clone)]
pub struct EffectContext {
    pub workflow_id: String,
    pub execution_id: String,
    pub user_id: String,
    /// Deterministic workspace of the workflow-owned session.
    pub workspace: String,
}

/// Side-effect seam: how steps touch the outside world.
#[async_trait]
pub trait StepEffects: Send + Sync {
    /// Invoke a named tool in the execution's managed session.
    async fn invoke_tool(
        &self,
        ctx: &EffectContext,
        tool: &str,
        args: &Value,
    ) -> anyhow::Result<Value>;

    /// Deliver a prompt to the managed session, optionally awaiting the
    /// agent's reply.
    async fn send_agent_message(
        &self,
        ctx: &EffectContext,
        content: &str,
        await_response: bool,
        timeout_ms: u64,
    ) -> anyhow::Result<Option<String>>;
}

/// Final state of one `run`/`resume` call.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub resume_token: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunParams {
    /// Workflow id or slug.
    pub workflow: String,
    /// The hash the caller intends to execute against.
    pub workflow_hash: String,
    pub variables: Value,
    pub trigger: String,
    /// Caller-supplied id makes the run idempotent.
    pub execution_id: Option<String>,
    pub user_id: String,
}

#[derive(Debug, Clone)]
pub struct ResumeParams {
    pub execution_id: String,
    pub workflow_hash: String,
    pub resume_token: String,
    pub approve: bool,
    pub reason: Option<String>,
    pub variables: Option<Value>,
    pub user_id: String,
}

enum Flow {
    Continue,
    Suspended { token: String },
    Failed { error: String },
    Cancelled,
}

struct DriveCtx {
    workflow: Workflow,
    execution_id: String,
    user_id: String,
    variables: Value,
    latest: std::collections::HashMap<String, StepTrace>,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    repo: WorkflowRepository,
    effects: Arc<dyn StepEffects>,
    bus: Arc<EventBus>,
    /// Single-writer discipline per execution id: concurrent run/resume
    /// calls against the same execution serialize here.
    drive_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl WorkflowEngine {
    pub fn new(
        repo: WorkflowRepository,
        effects: Arc<dyn StepEffects>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self { repo, effects, bus, drive_locks: Arc::new(DashMap::new()) }
    }

    pub fn repo(&self) -> &WorkflowRepository {
        &self.repo
    }

    /// Start (or idempotently re-enter) an execution. The hash check happens
    /// before any trace row is written.
    pub async fn run(&self, params: RunParams) -> CoreResult<ExecutionReport> {
        let workflow = self
            .repo
            .get_workflow(&params.workflow)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("workflow {}", params.workflow)))?;

        if workflow.current_hash != params.workflow_hash {
            return Err(CoreError::HashMismatch { current_hash: workflow.current_hash });
        }

        let execution = self
            .repo
            .create_execution(
                params.execution_id,
                &workflow.id,
                &workflow.current_hash,
                &params.trigger,
                &params.variables,
                None,
            )
            .await?;

        match execution.status {
            status if status.is_terminal() => {
                return Ok(ExecutionReport {
                    execution_id: execution.id,
                    status,
                    resume_token: None,
                    error: execution.error,
                })
            }
            ExecutionStatus::NeedsApproval => {
                return Ok(ExecutionReport {
                    execution_id: execution.id.clone(),
                    status: ExecutionStatus::NeedsApproval,
                    resume_token: execution.resume_token,
                    error: None,
                })
            }
            _ => {}
        }

        self.repo
            .set_execution_status(&execution.id, ExecutionStatus::Running, None)
            .await?;
        self.publish(&params.user_id, "started", &execution.id, json!({}));

        self.drive(workflow, execution.id, params.user_id).await
    }

    /// Resume a suspended execution with a decision.
    pub async fn resume(&self, params: ResumeParams) -> CoreResult<ExecutionReport> {
        let execution = self
            .repo
            .get_execution(&params.execution_id)
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("execution {}", params.execution_id))
            })?;

        let workflow = self
            .repo
            .get_workflow(&execution.workflow_id)
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("workflow {}", execution.workflow_id))
            })?;

        if workflow.current_hash != params.workflow_hash
            || execution.workflow_hash != workflow.current_hash
        {
            return Err(CoreError::HashMismatch { current_hash: workflow.current_hash });
        }

        let gate = self
            .repo
            .resolve_gate(
                &params.execution_id,
                &params.resume_token,
                params.approve,
                params.reason.as_deref(),
            )
            .await?;

        if !params.approve {
            self.cancel_children(&params.execution_id, &params.user_id).await?;
            self.publish(
                &params.user_id,
                "cancelled",
                &params.execution_id,
                json!({ "stepId": gate.step_id, "reason": params.reason }),
            );
            return Ok(ExecutionReport {
                execution_id: params.execution_id,
                status: ExecutionStatus::Cancelled,
                resume_token: None,
                error: params.reason,
            });
        }

        if let Some(extra) = params.variables {
            let mut merged = execution.variables_value();
            if !merged.is_object() {
                merged = json!({});
            }
            if let (Some(target), Some(source)) = (merged.as_object_mut(), extra.as_object()) {
                for (key, value) in source {
                    target.insert(key.clone(), value.clone());
                }
            }
            self.repo.set_execution_variables(&params.execution_id, &merged).await?;
        }

        self.publish(
            &params.user_id,
            "resumed",
            &params.execution_id,
            json!({ "stepId": gate.step_id }),
        );

        self.drive(workflow, params.execution_id, params.user_id).await
    }

    /// Cooperative cancellation; children cancel with the parent.
    pub async fn cancel(&self, execution_id: &str, user_id: &str) -> CoreResult<()> {
        let execution = self
            .repo
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("execution {execution_id}")))?;
        if execution.status.is_terminal() {
            return Ok(());
        }
        self.repo
            .set_execution_status(execution_id, ExecutionStatus::Cancelled, Some("cancelled"))
            .await?;
        self.publish(user_id, "cancelled", execution_id, json!({}));
        self.cancel_children(execution_id, user_id).await
    }

    async fn cancel_children(&self, execution_id: &str, user_id: &str) -> CoreResult<()> {
        let children = self.repo.list_child_executions(execution_id).await?;
        for child in children {
            if !child.status.is_terminal() {
                Box::pin(self.cancel(&child.id, user_id)).await?;
            }
        }
        Ok(())
    }

    async fn drive(
        &self,
        workflow: Workflow,
        execution_id: String,
        user_id: String,
    ) -> CoreResult<ExecutionReport> {
        let lock = self
            .drive_locks
            .entry(execution_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let execution = self
            .repo
            .get_execution(&execution_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("execution {execution_id}")))?;

        let version = self
            .repo
            .get_version(&workflow.id, &execution.workflow_hash)
            .await?
            .ok_or_else(|| {
                CoreError::internal(format!(
                    "hash {} missing from workflow {} history",
                    execution.workflow_hash, workflow.id
                ))
            })?;
        let definition: Value = serde_json::from_str(&version.definition)
            .map_err(|err| CoreError::internal(format!("stored definition unreadable: {err}")))?;

        // Unknown step types survive validation; they are refused here, when
        // the engine actually has to interpret them.
        let steps = match parse_steps(&definition) {
            Ok(steps) => steps,
            Err(err) => {
                let detail = err.to_string();
                self.repo
                    .set_execution_status(&execution_id, ExecutionStatus::Failed, Some(&detail))
                    .await?;
                self.publish(&user_id, "failed", &execution_id, json!({ "error": detail }));
                return Ok(ExecutionReport {
                    execution_id,
                    status: ExecutionStatus::Failed,
                    resume_token: None,
                    error: Some(detail),
                });
            }
        };

        let mut variables = execution.variables_value();
        if !variables.is_object() {
            variables = json!({});
        }

        let mut ctx = DriveCtx {
            workflow,
            execution_id: execution_id.clone(),
            user_id: user_id.clone(),
            variables,
            latest: self.repo.latest_traces(&execution_id).await?,
        };

        let flow = self.run_steps(&mut ctx, &steps).await?;

        let report = match flow {
            Flow::Continue => {
                self.repo
                    .set_execution_status(&execution_id, ExecutionStatus::Succeeded, None)
                    .await?;
                self.publish(&user_id, "succeeded", &execution_id, json!({}));
                ExecutionReport {
                    execution_id,
                    status: ExecutionStatus::Succeeded,
                    resume_token: None,
                    error: None,
                }
            }
            Flow::Suspended { token } => ExecutionReport {
                execution_id,
                status: ExecutionStatus::NeedsApproval,
                resume_token: Some(token),
                error: None,
            },
            Flow::Failed { error } => {
                self.repo
                    .set_execution_status(&execution_id, ExecutionStatus::Failed, Some(&error))
                    .await?;
                self.publish(&user_id, "failed", &execution_id, json!({ "error": error }));
                self.cancel_children(&execution_id, &user_id).await?;
                ExecutionReport {
                    execution_id,
                    status: ExecutionStatus::Failed,
                    resume_token: None,
                    error: Some(error),
                }
            }
            Flow::Cancelled => ExecutionReport {
                execution_id,
                status: ExecutionStatus::Cancelled,
                resume_token: None,
                error: None,
            },
        };
        Ok(report)
    }

    fn run_steps<'a>(
        &'a self,
        ctx: &'a mut DriveCtx,
        steps: &'a [Step],
    ) -> BoxFuture<'a, CoreResult<Flow>> {
        async move {
            for step in steps {
                // Cooperative cancellation check between steps.
                let current = self
                    .repo
                    .get_execution(&ctx.execution_id)
                    .await?
                    .ok_or_else(|| CoreError::internal("execution row vanished mid-drive"))?;
                if current.status == ExecutionStatus::Cancelled {
                    return Ok(Flow::Cancelled);
                }

                match self.run_step(ctx, step).await? {
                    Flow::Continue => continue,
                    other => return Ok(other),
                }
            }
            Ok(Flow::Continue)
        }
        .boxed()
    }

    async fn run_step(&self, ctx: &mut DriveCtx, step: &Step) -> CoreResult<Flow> {
        let step_id = step.id().to_string();
        let prior = ctx.latest.get(&step_id).cloned();
        let prior_attempt = prior.as_ref().map(|t| t.attempt).unwrap_or(0);

        // Trace-driven skip: a finished step never re-runs. Sub steps also
        // verify their child actually finished before skipping.
        if let Some(prior) = &prior {
            match prior.status {
                StepStatus::Succeeded | StepStatus::Skipped => {
                    if let Step::Sub { .. } = step {
                        if !self.sub_child_finished(ctx, &step_id).await? {
                            return self.run_sub(ctx, step, prior_attempt).await;
                        }
                    }
                    return Ok(Flow::Continue);
                }
                StepStatus::Failed => {
                    // A failed leaf only reappears through an explicit retry
                    // policy, handled below with a fresh attempt number.
                }
                _ => {}
            }
        }

        match step {
            Step::Tool { id, tool, args, retry, tolerate_failure } => {
                let max_attempts = retry.as_ref().map(|r| r.attempts.max(1)).unwrap_or(1) as i64;
                let backoff = retry.as_ref().map(|r| r.backoff_ms).unwrap_or(0);
                let mut attempt = prior_attempt;

                loop {
                    attempt += 1;
                    let trace = self
                        .repo
                        .append_trace(&ctx.execution_id, id, attempt, StepStatus::Running, None)
                        .await?;

                    let effect_ctx = self.effect_context(ctx);
                    match self.effects.invoke_tool(&effect_ctx, tool, args).await {
                        Ok(result) => {
                            self.repo
                                .finish_trace(&trace.id, StepStatus::Succeeded, None)
                                .await?;
                            self.record_step_result(ctx, id, result).await?;
                            self.remember_trace(ctx, trace, StepStatus::Succeeded);
                            return Ok(Flow::Continue);
                        }
                        Err(err) => {
                            let detail = format!("{err:#}");
                            warn!(
                                execution_id = %ctx.execution_id,
                                step_id = %id,
                                attempt,
                                error = %detail,
                                "tool step failed"
                            );
                            self.repo
                                .finish_trace(&trace.id, StepStatus::Failed, Some(&detail))
                                .await?;
                            self.remember_trace(ctx, trace, StepStatus::Failed);

                            if attempt - prior_attempt < max_attempts {
                                if backoff > 0 {
                                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                                }
                                continue;
                            }
                            if *tolerate_failure {
                                return Ok(Flow::Continue);
                            }
                            return Ok(Flow::Failed {
                                error: format!("step {id} failed: {detail}"),
                            });
                        }
                    }
                }
            }

            Step::AgentMessage { id, content, await_response, await_timeout_ms } => {
                let trace = self
                    .repo
                    .append_trace(
                        &ctx.execution_id,
                        id,
                        prior_attempt + 1,
                        StepStatus::Running,
                        None,
                    )
                    .await?;

                let effect_ctx = self.effect_context(ctx);
                let interpolated = interpolate(content, &ctx.variables);
                match self
                    .effects
                    .send_agent_message(
                        &effect_ctx,
                        &interpolated,
                        *await_response,
                        *await_timeout_ms,
                    )
                    .await
                {
                    Ok(response) => {
                        self.repo.finish_trace(&trace.id, StepStatus::Succeeded, None).await?;
                        if let Some(response) = response {
                            self.record_step_result(ctx, id, json!(response)).await?;
                        }
                        self.remember_trace(ctx, trace, StepStatus::Succeeded);
                        Ok(Flow::Continue)
                    }
                    Err(err) => {
                        let detail = format!("{err:#}");
                        self.repo
                            .finish_trace(&trace.id, StepStatus::Failed, Some(&detail))
                            .await?;
                        self.remember_trace(ctx, trace, StepStatus::Failed);
                        Ok(Flow::Failed { error: format!("step {id} failed: {detail}") })
                    }
                }
            }

            Step::Approval { id, prompt } => {
                let token = resume_token();
                self.repo
                    .suspend_for_approval(&ctx.execution_id, id, prior_attempt + 1, &token)
                    .await?;
                self.publish(
                    &ctx.user_id,
                    "awaiting_approval",
                    &ctx.execution_id,
                    json!({ "stepId": id, "prompt": prompt }),
                );
                info!(
                    execution_id = %ctx.execution_id,
                    step_id = %id,
                    "execution suspended at approval gate"
                );
                Ok(Flow::Suspended { token })
            }

            Step::Branch { predicate, then_steps, else_steps, .. } => {
                let chosen = if predicate.evaluate(&ctx.variables) {
                    then_steps
                } else {
                    else_steps
                };
                self.run_steps(ctx, chosen).await
            }

            Step::Sequence { steps, .. } => self.run_steps(ctx, steps).await,

            Step::Sub { .. } => self.run_sub(ctx, step, prior_attempt).await,

            Step::Sleep { id, seconds } => {
                let trace = self
                    .repo
                    .append_trace(
                        &ctx.execution_id,
                        id,
                        prior_attempt + 1,
                        StepStatus::Running,
                        None,
                    )
                    .await?;
                tokio::time::sleep(Duration::from_secs(*seconds)).await;
                self.repo.finish_trace(&trace.id, StepStatus::Succeeded, None).await?;
                self.remember_trace(ctx, trace, StepStatus::Succeeded);
                Ok(Flow::Continue)
            }
        }
    }

    async fn run_sub(
        &self,
        ctx: &mut DriveCtx,
        step: &Step,
        prior_attempt: i64,
    ) -> CoreResult<Flow> {
        let Step::Sub { id, workflow, variables, tolerate_failure } = step else {
            return Err(CoreError::internal("run_sub called on a non-sub step"));
        };

        let child_workflow = self
            .repo
            .get_workflow(workflow)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("sub workflow {workflow}")))?;

        // Deterministic child id: re-driving the parent re-enters the same
        // child execution instead of spawning a twin.
        let child_id = format!("{}.sub.{id}", ctx.execution_id);

        // A child suspended at its own gate is resumed by the parent's
        // approval; the stored child token authorizes it.
        if let Some(child) = self.repo.get_execution(&child_id).await? {
            if child.status == ExecutionStatus::NeedsApproval {
                if let Some(token) = child.resume_token {
                    self.repo.resolve_gate(&child_id, &token, true, None).await?;
                }
            }
        }

        let merged_vars = match variables {
            Some(extra) => {
                let mut merged = ctx.variables.clone();
                if let (Some(target), Some(source)) =
                    (merged.as_object_mut(), extra.as_object())
                {
                    for (key, value) in source {
                        target.insert(key.clone(), value.clone());
                    }
                }
                merged
            }
            None => ctx.variables.clone(),
        };

        // Register parentage on first entry so cancellation can find it.
        self.repo
            .create_execution(
                Some(child_id.clone()),
                &child_workflow.id,
                &child_workflow.current_hash,
                &format!("sub:{}", ctx.execution_id),
                &merged_vars,
                Some(&ctx.execution_id),
            )
            .await?;

        let report = Box::pin(self.run(RunParams {
            workflow: child_workflow.slug.clone(),
            workflow_hash: child_workflow.current_hash.clone(),
            variables: merged_vars,
            trigger: format!("sub:{}", ctx.execution_id),
            execution_id: Some(child_id.clone()),
            user_id: ctx.user_id.clone(),
        }))
        .await?;

        match report.status {
            ExecutionStatus::Succeeded => {
                let trace = self
                    .repo
                    .append_trace(
                        &ctx.execution_id,
                        id,
                        prior_attempt + 1,
                        StepStatus::Succeeded,
                        None,
                    )
                    .await?;
                self.remember_trace(ctx, trace, StepStatus::Succeeded);
                Ok(Flow::Continue)
            }
            ExecutionStatus::NeedsApproval => {
                // The parent suspends with its own token; approval flows down
                // to the child on resume.
                let token = resume_token();
                self.repo
                    .suspend_for_approval(&ctx.execution_id, id, prior_attempt + 1, &token)
                    .await?;
                self.publish(
                    &ctx.user_id,
                    "awaiting_approval",
                    &ctx.execution_id,
                    json!({ "stepId": id, "childExecutionId": child_id }),
                );
                Ok(Flow::Suspended { token })
            }
            status => {
                let detail = report
                    .error
                    .unwrap_or_else(|| format!("sub execution ended {status}"));
                let trace = self
                    .repo
                    .append_trace(
                        &ctx.execution_id,
                        id,
                        prior_attempt + 1,
                        StepStatus::Failed,
                        Some(&detail),
                    )
                    .await?;
                self.remember_trace(ctx, trace, StepStatus::Failed);
                if *tolerate_failure {
                    Ok(Flow::Continue)
                } else {
                    Ok(Flow::Failed { error: format!("step {id} failed: {detail}") })
                }
            }
        }
    }

    async fn sub_child_finished(&self, ctx: &DriveCtx, step_id: &str) -> CoreResult<bool> {
        let child_id = format!("{}.sub.{step_id}", ctx.execution_id);
        match self.repo.get_execution(&child_id).await? {
            Some(child) => Ok(child.status.is_terminal()),
            None => Ok(true),
        }
    }

    /// Step results land in the variable scope under `<step_id>_result` so
    /// later branches can see them.
    async fn record_step_result(
        &self,
        ctx: &mut DriveCtx,
        step_id: &str,
        result: Value,
    ) -> CoreResult<()> {
        if let Some(object) = ctx.variables.as_object_mut() {
            object.insert(format!("{step_id}_result"), result);
        }
        self.repo
            .set_execution_variables(&ctx.execution_id, &ctx.variables)
            .await
    }

    fn remember_trace(&self, ctx: &mut DriveCtx, mut trace: StepTrace, status: StepStatus) {
        trace.status = status;
        ctx.latest.insert(trace.step_id.clone(), trace);
    }

    fn effect_context(&self, ctx: &DriveCtx) -> EffectContext {
        EffectContext {
            workflow_id: ctx.workflow.id.clone(),
            execution_id: ctx.execution_id.clone(),
            user_id: ctx.user_id.clone(),
            workspace: workflow_workspace(&ctx.workflow.id, &ctx.execution_id),
        }
    }

    fn publish(&self, user_id: &str, kind: &str, execution_id: &str, payload: Value) {
        self.bus.publish(user_id, BusEvent::workflow(kind, execution_id, payload));
    }
}

/// Replace `{{var}}` references with values from the scope. Unknown
/// references are left intact.
fn interpolate(template: &str, variables: &Value) -> String {
    let mut out = template.to_string();
    if let Some(object) = variables.as_object() {
        for (key, value) in object {
            let needle = format!("{{{{{key}}}}}");
            if out.contains(&needle) {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out = out.replace(&needle, &rendered);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::db::Database;
    use crate::workflow::validate::validate_definition;
    use std::sync::Mutex;

    /// Records effect calls; tools named `fail_*` error out.
    #[derive(Default)]
    struct RecordingEffects {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingEffects {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StepEffects for RecordingEffects {
        async fn invoke_tool(
            &self,
            _ctx: &EffectContext,
            tool: &str,
            _args: &Value,
        ) -> anyhow::Result<Value> {
            self.calls.lock().unwrap().push(format!("tool:{tool}"));
            if tool.starts_with("fail_") {
                anyhow::bail!("tool {tool} exploded");
            }
            Ok(json!({ "ok": true }))
        }

        async fn send_agent_message(
            &self,
            _ctx: &EffectContext,
            content: &str,
            await_response: bool,
            _timeout_ms: u64,
        ) -> anyhow::Result<Option<String>> {
            self.calls.lock().unwrap().push(format!("msg:{content}"));
            Ok(await_response.then(|| "ack".to_string()))
        }
    }

    async fn engine_with(
        definition: Value,
    ) -> (WorkflowEngine, Arc<RecordingEffects>, Workflow) {
        let db = Database::in_memory().await.unwrap();
        let repo = WorkflowRepository::new(db.pool().clone());
        let effects = Arc::new(RecordingEffects::default());
        let engine =
            WorkflowEngine::new(repo.clone(), effects.clone(), Arc::new(EventBus::new()));

        validate_definition(&definition).unwrap();
        let workflow = repo
            .create_workflow("ship", "Ship it", None, &definition)
            .await
            .unwrap();
        (engine, effects, workflow)
    }

    fn ship_definition() -> Value {
        json!({
            "steps": [
                {"id": "lint", "type": "tool", "tool": "npm_lint"},
                {"id": "approve", "type": "approval", "prompt": "Ship?"},
                {"id": "deploy", "type": "tool", "tool": "deploy"}
            ]
        })
    }

    #[tokio::test]
    async fn approval_gate_happy_path() {
        let (engine, effects, workflow) = engine_with(ship_definition()).await;

        let report = engine
            .run(RunParams {
                workflow: "ship".into(),
                workflow_hash: workflow.current_hash.clone(),
                variables: json!({}),
                trigger: "manual".into(),
                execution_id: Some("ex_1".into()),
                user_id: "u1".into(),
            })
            .await
            .unwrap();

        assert_eq!(report.status, ExecutionStatus::NeedsApproval);
        let token = report.resume_token.clone().unwrap();
        assert!(token.starts_with("wrf_rt_"));
        assert_eq!(effects.calls(), vec!["tool:npm_lint"]);

        let steps = engine.repo().list_steps("ex_1", 100).await.unwrap();
        let statuses: Vec<(String, StepStatus)> =
            steps.iter().map(|t| (t.step_id.clone(), t.status)).collect();
        assert!(statuses.contains(&("lint".to_string(), StepStatus::Succeeded)));
        assert!(statuses.contains(&("approve".to_string(), StepStatus::Awaiting)));

        let resumed = engine
            .resume(ResumeParams {
                execution_id: "ex_1".into(),
                workflow_hash: workflow.current_hash.clone(),
                resume_token: token,
                approve: true,
                reason: None,
                variables: None,
                user_id: "u1".into(),
            })
            .await
            .unwrap();

        assert_eq!(resumed.status, ExecutionStatus::Succeeded);
        assert_eq!(effects.calls(), vec!["tool:npm_lint", "tool:deploy"]);

        let steps = engine.repo().list_steps("ex_1", 100).await.unwrap();
        assert!(steps
            .iter()
            .any(|t| t.step_id == "deploy" && t.status == StepStatus::Succeeded));
        // Lint ran exactly once across run + resume.
        assert_eq!(steps.iter().filter(|t| t.step_id == "lint").count(), 1);
    }

    #[tokio::test]
    async fn hash_mismatch_writes_no_traces() {
        let (engine, effects, _workflow) = engine_with(ship_definition()).await;

        let err = engine
            .run(RunParams {
                workflow: "ship".into(),
                workflow_hash: "sha256:deadbeef".into(),
                variables: json!({}),
                trigger: "manual".into(),
                execution_id: Some("ex_mismatch".into()),
                user_id: "u1".into(),
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), "HASH_MISMATCH");
        assert!(err.to_string().contains("Workflow hash mismatch"));
        assert!(effects.calls().is_empty());
        assert!(engine.repo().get_execution("ex_mismatch").await.unwrap().is_none());
        assert!(engine.repo().list_steps("ex_mismatch", 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_resume_token_is_rejected() {
        let (engine, _effects, workflow) = engine_with(ship_definition()).await;

        let report = engine
            .run(RunParams {
                workflow: "ship".into(),
                workflow_hash: workflow.current_hash.clone(),
                variables: json!({}),
                trigger: "manual".into(),
                execution_id: Some("ex_tok".into()),
                user_id: "u1".into(),
            })
            .await
            .unwrap();
        assert_eq!(report.status, ExecutionStatus::NeedsApproval);

        let err = engine
            .resume(ResumeParams {
                execution_id: "ex_tok".into(),
                workflow_hash: workflow.current_hash.clone(),
                resume_token: "wrf_rt_bogus".into(),
                approve: true,
                reason: None,
                variables: None,
                user_id: "u1".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TOKEN");

        // Still suspended with the original token.
        let execution = engine.repo().get_execution("ex_tok").await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::NeedsApproval);
        assert!(execution.resume_token.is_some());
    }

    #[tokio::test]
    async fn deny_cancels_the_execution() {
        let (engine, effects, workflow) = engine_with(ship_definition()).await;

        let report = engine
            .run(RunParams {
                workflow: "ship".into(),
                workflow_hash: workflow.current_hash.clone(),
                variables: json!({}),
                trigger: "manual".into(),
                execution_id: Some("ex_deny".into()),
                user_id: "u1".into(),
            })
            .await
            .unwrap();

        let resumed = engine
            .resume(ResumeParams {
                execution_id: "ex_deny".into(),
                workflow_hash: workflow.current_hash.clone(),
                resume_token: report.resume_token.unwrap(),
                approve: false,
                reason: Some("not today".into()),
                variables: None,
                user_id: "u1".into(),
            })
            .await
            .unwrap();

        assert_eq!(resumed.status, ExecutionStatus::Cancelled);
        // Deploy never ran.
        assert_eq!(effects.calls(), vec!["tool:npm_lint"]);

        let execution = engine.repo().get_execution("ex_deny").await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert!(execution.resume_token.is_none());
        assert_eq!(execution.error.as_deref(), Some("not today"));
    }

    #[tokio::test]
    async fn retries_reuse_step_id_and_then_fail() {
        let definition = json!({
            "steps": [
                {
                    "id": "flaky",
                    "type": "tool",
                    "tool": "fail_build",
                    "retry": {"attempts": 3, "backoff_ms": 1}
                }
            ]
        });
        let (engine, effects, workflow) = engine_with(definition).await;

        let report = engine
            .run(RunParams {
                workflow: "ship".into(),
                workflow_hash: workflow.current_hash,
                variables: json!({}),
                trigger: "manual".into(),
                execution_id: Some("ex_retry".into()),
                user_id: "u1".into(),
            })
            .await
            .unwrap();

        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(effects.calls().len(), 3);

        let steps = engine.repo().list_steps("ex_retry", 100).await.unwrap();
        let attempts: Vec<i64> = steps
            .iter()
            .filter(|t| t.step_id == "flaky")
            .map(|t| t.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert!(steps.iter().all(|t| t.step_id == "flaky"));
    }

    #[tokio::test]
    async fn branch_follows_the_variable_scope() {
        let definition = json!({
            "steps": [
                {
                    "id": "gate",
                    "type": "branch",
                    "if": {"var": "env", "op": "eq", "value": "prod"},
                    "then": [{"id": "careful", "type": "tool", "tool": "canary"}],
                    "else": [{"id": "fast", "type": "tool", "tool": "direct"}]
                }
            ]
        });
        let (engine, effects, workflow) = engine_with(definition).await;

        engine
            .run(RunParams {
                workflow: "ship".into(),
                workflow_hash: workflow.current_hash,
                variables: json!({"env": "prod"}),
                trigger: "manual".into(),
                execution_id: None,
                user_id: "u1".into(),
            })
            .await
            .unwrap();

        assert_eq!(effects.calls(), vec!["tool:canary"]);
    }

    #[tokio::test]
    async fn tolerated_failure_continues_the_sequence() {
        let definition = json!({
            "steps": [
                {"id": "best_effort", "type": "tool", "tool": "fail_fmt", "tolerate_failure": true},
                {"id": "next", "type": "tool", "tool": "build"}
            ]
        });
        let (engine, effects, workflow) = engine_with(definition).await;

        let report = engine
            .run(RunParams {
                workflow: "ship".into(),
                workflow_hash: workflow.current_hash,
                variables: json!({}),
                trigger: "manual".into(),
                execution_id: None,
                user_id: "u1".into(),
            })
            .await
            .unwrap();

        assert_eq!(report.status, ExecutionStatus::Succeeded);
        assert_eq!(effects.calls(), vec!["tool:fail_fmt", "tool:build"]);
    }

    #[tokio::test]
    async fn unknown_step_type_fails_at_runtime() {
        // Unknown types pass validation but the engine refuses them.
        let definition = json!({
            "steps": [{"id": "x", "type": "quantum_deploy"}]
        });
        let (engine, _effects, workflow) = engine_with(definition).await;

        let report = engine
            .run(RunParams {
                workflow: "ship".into(),
                workflow_hash: workflow.current_hash,
                variables: json!({}),
                trigger: "manual".into(),
                execution_id: Some("ex_unknown".into()),
                user_id: "u1".into(),
            })
            .await
            .unwrap();

        assert_eq!(report.status, ExecutionStatus::Failed);
        assert!(report.error.unwrap().contains("no interpreter"));
    }

    #[tokio::test]
    async fn agent_message_response_lands_in_variables() {
        let definition = json!({
            "steps": [
                {
                    "id": "ask",
                    "type": "agent_message",
                    "content": "status of {{service}}?",
                    "await": true,
                    "await_timeout_ms": 5000
                }
            ]
        });
        let (engine, effects, workflow) = engine_with(definition).await;

        let report = engine
            .run(RunParams {
                workflow: "ship".into(),
                workflow_hash: workflow.current_hash,
                variables: json!({"service": "billing"}),
                trigger: "manual".into(),
                execution_id: Some("ex_msg".into()),
                user_id: "u1".into(),
            })
            .await
            .unwrap();

        assert_eq!(report.status, ExecutionStatus::Succeeded);
        assert_eq!(effects.calls(), vec!["msg:status of billing?"]);

        let execution = engine.repo().get_execution("ex_msg").await.unwrap().unwrap();
        assert_eq!(execution.variables_value()["ask_result"], json!("ack"));
    }
}
