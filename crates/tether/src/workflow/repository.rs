//! Workflow persistence: definitions, executions, traces, proposals.
//!
//! Every multi-row transition (gate suspension, resume, apply, rollback)
//! runs in a single transaction; the hash checks happen inside those
//! transactions so definition changes are linearizable.

use anyhow::Context;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::error::{CoreError, CoreResult};
use crate::ids::{new_id, now_ts};

use super::canonical::{canonical_string, workflow_hash};
use super::models::{
    ExecutionStatus, ProposalStatus, StepStatus, StepTrace, Workflow, WorkflowExecution,
    WorkflowProposal, WorkflowVersion,
};

const WORKFLOW_COLUMNS: &str =
    "id, slug, name, description, current_hash, current_version, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, workflow_id, workflow_hash, status, \"trigger\", variables, \
     resume_token, requires_approval, parent_execution_id, error, created_at, completed_at";

const TRACE_COLUMNS: &str =
    "id, execution_id, step_id, attempt, status, error, started_at, completed_at, created_at";

const PROPOSAL_COLUMNS: &str = "id, workflow_id, base_hash, proposed_by_session_id, \
     execution_id, proposal, diff_text, status, review_notes, expires_at, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct WorkflowRepository {
    pool: SqlitePool,
}

impl WorkflowRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Workflows and versions
    // ------------------------------------------------------------------

    /// Create a workflow with its version-1 definition in one transaction.
    /// The definition must already be structurally valid.
    pub async fn create_workflow(
        &self,
        slug: &str,
        name: &str,
        description: Option<&str>,
        definition: &Value,
    ) -> CoreResult<Workflow> {
        let hash = workflow_hash(definition);
        let canonical = canonical_string(definition);
        let ts = now_ts();
        let workflow = Workflow {
            id: new_id("wf"),
            slug: slug.to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            current_hash: hash.clone(),
            current_version: 1,
            created_at: ts.clone(),
            updated_at: ts.clone(),
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning workflow create")
            .map_err(CoreError::Internal)?;

        let taken: Option<(String,)> =
            sqlx::query_as("SELECT id FROM workflows WHERE slug = ?")
                .bind(slug)
                .fetch_optional(&mut *tx)
                .await?;
        if taken.is_some() {
            return Err(CoreError::conflict(format!("workflow slug '{slug}' already exists")));
        }

        sqlx::query(
            "INSERT INTO workflows (id, slug, name, description, current_hash, \
             current_version, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&workflow.id)
        .bind(&workflow.slug)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(&workflow.current_hash)
        .bind(workflow.current_version)
        .bind(&workflow.created_at)
        .bind(&workflow.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO workflow_versions (workflow_id, hash, definition, version, notes, \
             created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&workflow.id)
        .bind(&hash)
        .bind(&canonical)
        .bind(1i64)
        .bind(Option::<String>::None)
        .bind(&ts)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .context("committing workflow create")
            .map_err(CoreError::Internal)?;
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id_or_slug: &str) -> CoreResult<Option<Workflow>> {
        let workflow = sqlx::query_as::<_, Workflow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ? OR slug = ?"
        ))
        .bind(id_or_slug)
        .bind(id_or_slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(workflow)
    }

    pub async fn get_version(
        &self,
        workflow_id: &str,
        hash: &str,
    ) -> CoreResult<Option<WorkflowVersion>> {
        let version = sqlx::query_as::<_, WorkflowVersion>(
            "SELECT workflow_id, hash, definition, version, notes, created_at \
             FROM workflow_versions WHERE workflow_id = ? AND hash = ?",
        )
        .bind(workflow_id)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(version)
    }

    // ------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------

    /// Insert a queued execution. Caller-supplied ids make the create
    /// idempotent: an existing row is returned unchanged.
    pub async fn create_execution(
        &self,
        id: Option<String>,
        workflow_id: &str,
        workflow_hash: &str,
        trigger: &str,
        variables: &Value,
        parent_execution_id: Option<&str>,
    ) -> CoreResult<WorkflowExecution> {
        let id = id.unwrap_or_else(|| new_id("wfx"));

        if let Some(existing) = self.get_execution(&id).await? {
            return Ok(existing);
        }

        let execution = WorkflowExecution {
            id,
            workflow_id: workflow_id.to_string(),
            workflow_hash: workflow_hash.to_string(),
            status: ExecutionStatus::Queued,
            trigger: trigger.to_string(),
            variables: canonical_string(variables),
            resume_token: None,
            requires_approval: 0,
            parent_execution_id: parent_execution_id.map(str::to_string),
            error: None,
            created_at: now_ts(),
            completed_at: None,
        };

        sqlx::query(
            "INSERT INTO workflow_executions (id, workflow_id, workflow_hash, status, \
             \"trigger\", variables, resume_token, requires_approval, parent_execution_id, \
             error, created_at, completed_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&execution.id)
        .bind(&execution.workflow_id)
        .bind(&execution.workflow_hash)
        .bind(execution.status.to_string())
        .bind(&execution.trigger)
        .bind(&execution.variables)
        .bind(&execution.resume_token)
        .bind(execution.requires_approval)
        .bind(&execution.parent_execution_id)
        .bind(&execution.error)
        .bind(&execution.created_at)
        .bind(&execution.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(execution)
    }

    pub async fn get_execution(&self, id: &str) -> CoreResult<Option<WorkflowExecution>> {
        let execution = sqlx::query_as::<_, WorkflowExecution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(execution)
    }

    /// Status change clearing any resume token; terminal statuses stamp
    /// `completed_at`.
    pub async fn set_execution_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> CoreResult<()> {
        let completed_at = if status.is_terminal() { Some(now_ts()) } else { None };
        sqlx::query(
            "UPDATE workflow_executions SET status = ?, error = ?, resume_token = NULL, \
             completed_at = ? WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(error)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_execution_variables(&self, id: &str, variables: &Value) -> CoreResult<()> {
        sqlx::query("UPDATE workflow_executions SET variables = ? WHERE id = ?")
            .bind(canonical_string(variables))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_child_executions(
        &self,
        parent_execution_id: &str,
    ) -> CoreResult<Vec<WorkflowExecution>> {
        let children = sqlx::query_as::<_, WorkflowExecution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE parent_execution_id = ? ORDER BY created_at, id"
        ))
        .bind(parent_execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(children)
    }

    // ------------------------------------------------------------------
    // Step traces
    // ------------------------------------------------------------------

    pub async fn append_trace(
        &self,
        execution_id: &str,
        step_id: &str,
        attempt: i64,
        status: StepStatus,
        error: Option<&str>,
    ) -> CoreResult<StepTrace> {
        let ts = now_ts();
        let trace = StepTrace {
            id: new_id("st"),
            execution_id: execution_id.to_string(),
            step_id: step_id.to_string(),
            attempt,
            status,
            error: error.map(str::to_string),
            started_at: Some(ts.clone()),
            completed_at: match status {
                StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped => {
                    Some(ts.clone())
                }
                _ => None,
            },
            created_at: ts,
        };

        sqlx::query(
            "INSERT INTO step_traces (id, execution_id, step_id, attempt, status, error, \
             started_at, completed_at, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&trace.id)
        .bind(&trace.execution_id)
        .bind(&trace.step_id)
        .bind(trace.attempt)
        .bind(trace.status.to_string())
        .bind(&trace.error)
        .bind(&trace.started_at)
        .bind(&trace.completed_at)
        .bind(&trace.created_at)
        .execute(&self.pool)
        .await?;

        Ok(trace)
    }

    pub async fn finish_trace(
        &self,
        trace_id: &str,
        status: StepStatus,
        error: Option<&str>,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE step_traces SET status = ?, error = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(error)
        .bind(now_ts())
        .bind(trace_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Latest attempt per step id, for trace-driven resume.
    pub async fn latest_traces(
        &self,
        execution_id: &str,
    ) -> CoreResult<std::collections::HashMap<String, StepTrace>> {
        let traces = sqlx::query_as::<_, StepTrace>(&format!(
            "SELECT {TRACE_COLUMNS} FROM step_traces WHERE execution_id = ? \
             ORDER BY created_at, id"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        let mut latest = std::collections::HashMap::new();
        for trace in traces {
            latest.insert(trace.step_id.clone(), trace);
        }
        Ok(latest)
    }

    pub async fn list_steps(
        &self,
        execution_id: &str,
        limit: i64,
    ) -> CoreResult<Vec<StepTrace>> {
        let traces = sqlx::query_as::<_, StepTrace>(&format!(
            "SELECT {TRACE_COLUMNS} FROM step_traces WHERE execution_id = ? \
             ORDER BY created_at, id LIMIT ?"
        ))
        .bind(execution_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(traces)
    }

    /// Suspend an execution at an approval gate: awaiting trace row, resume
    /// token, and `needs_approval` status in one transaction.
    pub async fn suspend_for_approval(
        &self,
        execution_id: &str,
        step_id: &str,
        attempt: i64,
        token: &str,
    ) -> CoreResult<StepTrace> {
        let ts = now_ts();
        let trace = StepTrace {
            id: new_id("st"),
            execution_id: execution_id.to_string(),
            step_id: step_id.to_string(),
            attempt,
            status: StepStatus::Awaiting,
            error: None,
            started_at: Some(ts.clone()),
            completed_at: None,
            created_at: ts,
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning gate suspension")
            .map_err(CoreError::Internal)?;

        sqlx::query(
            "INSERT INTO step_traces (id, execution_id, step_id, attempt, status, error, \
             started_at, completed_at, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&trace.id)
        .bind(&trace.execution_id)
        .bind(&trace.step_id)
        .bind(trace.attempt)
        .bind(trace.status.to_string())
        .bind(&trace.error)
        .bind(&trace.started_at)
        .bind(&trace.completed_at)
        .bind(&trace.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE workflow_executions SET status = 'needs_approval', resume_token = ?, \
             requires_approval = 1 WHERE id = ?",
        )
        .bind(token)
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .context("committing gate suspension")
            .map_err(CoreError::Internal)?;
        Ok(trace)
    }

    /// Resolve an approval gate. Token validation and rotation happen inside
    /// the transaction; a mismatched token changes nothing.
    pub async fn resolve_gate(
        &self,
        execution_id: &str,
        presented_token: &str,
        approve: bool,
        reason: Option<&str>,
    ) -> CoreResult<StepTrace> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning gate resolve")
            .map_err(CoreError::Internal)?;

        let execution = sqlx::query_as::<_, WorkflowExecution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = ?"
        ))
        .bind(execution_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("execution {execution_id}")))?;

        if execution.status != ExecutionStatus::NeedsApproval {
            return Err(CoreError::conflict(format!(
                "execution {execution_id} is {} and has no open gate",
                execution.status
            )));
        }

        match &execution.resume_token {
            Some(stored) if stored == presented_token => {}
            _ => return Err(CoreError::InvalidToken),
        }

        let awaiting = sqlx::query_as::<_, StepTrace>(&format!(
            "SELECT {TRACE_COLUMNS} FROM step_traces \
             WHERE execution_id = ? AND status = 'awaiting' ORDER BY created_at DESC, id DESC"
        ))
        .bind(execution_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            CoreError::internal(format!("execution {execution_id} has no awaiting trace"))
        })?;

        let ts = now_ts();
        if approve {
            sqlx::query(
                "UPDATE step_traces SET status = 'succeeded', completed_at = ? WHERE id = ?",
            )
            .bind(&ts)
            .bind(&awaiting.id)
            .execute(&mut *tx)
            .await?;

            // Token rotates: the old one is dead the moment this commits. A
            // later gate mints a fresh one.
            sqlx::query(
                "UPDATE workflow_executions SET status = 'running', resume_token = NULL \
                 WHERE id = ?",
            )
            .bind(execution_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE step_traces SET status = 'failed', error = ?, completed_at = ? \
                 WHERE id = ?",
            )
            .bind(reason.unwrap_or("denied"))
            .bind(&ts)
            .bind(&awaiting.id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE workflow_executions SET status = 'cancelled', resume_token = NULL, \
                 error = ?, completed_at = ? WHERE id = ?",
            )
            .bind(reason.unwrap_or("approval denied"))
            .bind(&ts)
            .bind(execution_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit()
            .await
            .context("committing gate resolve")
            .map_err(CoreError::Internal)?;
        Ok(awaiting)
    }

    // ------------------------------------------------------------------
    // Proposals
    // ------------------------------------------------------------------

    pub async fn insert_proposal(&self, proposal: &WorkflowProposal) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO workflow_proposals (id, workflow_id, base_hash, \
             proposed_by_session_id, execution_id, proposal, diff_text, status, \
             review_notes, expires_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&proposal.id)
        .bind(&proposal.workflow_id)
        .bind(&proposal.base_hash)
        .bind(&proposal.proposed_by_session_id)
        .bind(&proposal.execution_id)
        .bind(&proposal.proposal)
        .bind(&proposal.diff_text)
        .bind(proposal.status.to_string())
        .bind(&proposal.review_notes)
        .bind(&proposal.expires_at)
        .bind(&proposal.created_at)
        .bind(&proposal.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_proposal(&self, id: &str) -> CoreResult<Option<WorkflowProposal>> {
        let proposal = sqlx::query_as::<_, WorkflowProposal>(&format!(
            "SELECT {PROPOSAL_COLUMNS} FROM workflow_proposals WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(proposal)
    }

    pub async fn set_proposal_status(
        &self,
        id: &str,
        status: ProposalStatus,
        review_notes: Option<&str>,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE workflow_proposals SET status = ?, \
             review_notes = COALESCE(?, review_notes), updated_at = ? WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(review_notes)
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Transactional apply: re-reads `current_hash` and refuses to swap when
    /// the workflow moved past the proposal's base.
    pub async fn apply_swap(
        &self,
        proposal_id: &str,
        version_override: Option<i64>,
        review_notes: Option<&str>,
    ) -> CoreResult<(String, i64)> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning proposal apply")
            .map_err(CoreError::Internal)?;

        let proposal = sqlx::query_as::<_, WorkflowProposal>(&format!(
            "SELECT {PROPOSAL_COLUMNS} FROM workflow_proposals WHERE id = ?"
        ))
        .bind(proposal_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("proposal {proposal_id}")))?;

        if proposal.status != ProposalStatus::Approved {
            return Err(CoreError::conflict(format!(
                "proposal {proposal_id} is {}, not approved",
                proposal.status
            )));
        }

        let workflow = sqlx::query_as::<_, Workflow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?"
        ))
        .bind(&proposal.workflow_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("workflow {}", proposal.workflow_id)))?;

        if workflow.current_hash != proposal.base_hash {
            return Err(CoreError::StaleBase { current_hash: workflow.current_hash });
        }

        let definition: Value = serde_json::from_str(&proposal.proposal)
            .context("stored proposal is not valid JSON")
            .map_err(CoreError::Internal)?;
        let new_hash = workflow_hash(&definition);
        let version = version_override.unwrap_or(workflow.current_version + 1);
        let ts = now_ts();

        // The hash may already exist in history (a proposal restoring an
        // older definition); the version row is immutable either way.
        sqlx::query(
            "INSERT OR IGNORE INTO workflow_versions (workflow_id, hash, definition, \
             version, notes, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&workflow.id)
        .bind(&new_hash)
        .bind(canonical_string(&definition))
        .bind(version)
        .bind(review_notes)
        .bind(&ts)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE workflows SET current_hash = ?, current_version = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&new_hash)
        .bind(version)
        .bind(&ts)
        .bind(&workflow.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE workflow_proposals SET status = 'applied', \
             review_notes = COALESCE(?, review_notes), updated_at = ? WHERE id = ?",
        )
        .bind(review_notes)
        .bind(&ts)
        .bind(proposal_id)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .context("committing proposal apply")
            .map_err(CoreError::Internal)?;
        Ok((new_hash, version))
    }

    /// Transactional rollback to a hash that must already exist in the
    /// workflow's version history.
    pub async fn rollback_swap(
        &self,
        workflow_id: &str,
        target_hash: &str,
        version_override: Option<i64>,
    ) -> CoreResult<(String, i64)> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning rollback")
            .map_err(CoreError::Internal)?;

        let workflow = sqlx::query_as::<_, Workflow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?"
        ))
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("workflow {workflow_id}")))?;

        let target: Option<(i64,)> = sqlx::query_as(
            "SELECT version FROM workflow_versions WHERE workflow_id = ? AND hash = ?",
        )
        .bind(workflow_id)
        .bind(target_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((target_version,)) = target else {
            return Err(CoreError::validation(format!(
                "hash {target_hash} is not in workflow {workflow_id}'s history"
            )));
        };

        let version = version_override.unwrap_or(target_version);
        sqlx::query(
            "UPDATE workflows SET current_hash = ?, current_version = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(target_hash)
        .bind(version)
        .bind(now_ts())
        .bind(&workflow.id)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .context("committing rollback")
            .map_err(CoreError::Internal)?;
        Ok((target_hash.to_string(), version))
    }

    /// Background sweep: expire stale draft/approved proposals.
    pub async fn expire_stale_proposals(&self) -> CoreResult<u64> {
        let result = sqlx::query(
            "UPDATE workflow_proposals SET status = 'expired', updated_at = ? \
             WHERE expires_at IS NOT NULL AND expires_at < ? \
               AND status IN ('draft', 'approved')",
        )
        .bind(now_ts())
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
