//! Workflow domain: versioned hash-identified definitions, the execution
//! engine, and the proposal pipeline.

mod canonical;
mod definition;
mod effects;
mod engine;
mod models;
mod proposals;
mod repository;
mod validate;

use serde_json::Value;

use crate::error::{CoreError, CoreResult};

pub use canonical::{canonical_string, canonicalize_text, workflow_hash};
pub use definition::{
    parse_steps, workflow_workspace, CompareOp, Predicate, RetryPolicy, Step, SLEEP_MAX_SECS,
    SLEEP_MIN_SECS,
};
pub use effects::SessionStepEffects;
pub use engine::{
    EffectContext, ExecutionReport, ResumeParams, RunParams, StepEffects, WorkflowEngine,
};
pub use models::{
    ExecutionStatus, ProposalStatus, StepStatus, StepTrace, Workflow, WorkflowExecution,
    WorkflowProposal, WorkflowVersion,
};
pub use proposals::{CreateProposalParams, ProposalService};
pub use repository::WorkflowRepository;
pub use validate::{validate_definition, MIN_AWAIT_TIMEOUT_MS};

/// Hard cap on the step-trace page size; larger requests are a 400.
pub const MAX_STEP_PAGE: i64 = 500;

/// Facade over definitions, executions, and proposals, as consumed by the
/// HTTP layer and the workflow CLI.
#[derive(Clone)]
pub struct WorkflowService {
    repo: WorkflowRepository,
    engine: WorkflowEngine,
    proposals: ProposalService,
}

impl WorkflowService {
    pub fn new(repo: WorkflowRepository, engine: WorkflowEngine) -> Self {
        let proposals = ProposalService::new(repo.clone());
        Self { repo, engine, proposals }
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn proposals(&self) -> &ProposalService {
        &self.proposals
    }

    pub async fn create_workflow(
        &self,
        slug: &str,
        name: &str,
        description: Option<&str>,
        definition: &Value,
    ) -> CoreResult<Workflow> {
        validate_definition(definition)?;
        self.repo.create_workflow(slug, name, description, definition).await
    }

    pub async fn get_workflow(&self, id_or_slug: &str) -> CoreResult<Workflow> {
        self.repo
            .get_workflow(id_or_slug)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("workflow {id_or_slug}")))
    }

    pub async fn run(&self, params: RunParams) -> CoreResult<ExecutionReport> {
        self.engine.run(params).await
    }

    pub async fn resume(&self, params: ResumeParams) -> CoreResult<ExecutionReport> {
        self.engine.resume(params).await
    }

    pub async fn get_execution(&self, id: &str) -> CoreResult<WorkflowExecution> {
        self.repo
            .get_execution(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("execution {id}")))
    }

    /// Step trace page in display (trace) order. Limits above
    /// [`MAX_STEP_PAGE`] are rejected rather than clamped.
    pub async fn execution_steps(
        &self,
        execution_id: &str,
        limit: Option<i64>,
    ) -> CoreResult<Vec<StepTrace>> {
        let limit = limit.unwrap_or(MAX_STEP_PAGE);
        if limit < 1 || limit > MAX_STEP_PAGE {
            return Err(CoreError::validation(format!(
                "limit must be between 1 and {MAX_STEP_PAGE}"
            )));
        }
        self.get_execution(execution_id).await?;
        self.repo.list_steps(execution_id, limit).await
    }
}
