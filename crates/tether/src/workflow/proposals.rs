//! Proposal pipeline: the only mutation path for workflow definitions after
//! creation. Staleness is checked twice: advisory at create, binding inside
//! the apply transaction.

use serde_json::Value;
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::ids::{new_id, now_ts};

use super::canonical::canonical_string;
use super::models::{ProposalStatus, WorkflowProposal};
use super::repository::WorkflowRepository;
use super::validate::validate_definition;

#[derive(Debug, Clone)]
pub struct CreateProposalParams {
    pub workflow_id: String,
    pub base_hash: String,
    pub proposal: Value,
    pub diff_text: Option<String>,
    pub expires_at: Option<String>,
    pub execution_id: Option<String>,
    pub proposed_by_session_id: Option<String>,
}

#[derive(Clone)]
pub struct ProposalService {
    repo: WorkflowRepository,
}

impl ProposalService {
    pub fn new(repo: WorkflowRepository) -> Self {
        Self { repo }
    }

    /// Create a draft. The proposed definition must be structurally valid
    /// and the base hash current *right now*; the workflow may still advance
    /// before apply, which is where staleness becomes binding.
    pub async fn create(&self, params: CreateProposalParams) -> CoreResult<WorkflowProposal> {
        validate_definition(&params.proposal)?;

        let workflow = self
            .repo
            .get_workflow(&params.workflow_id)
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("workflow {}", params.workflow_id))
            })?;

        if workflow.current_hash != params.base_hash {
            return Err(CoreError::StaleBase { current_hash: workflow.current_hash });
        }

        let ts = now_ts();
        let proposal = WorkflowProposal {
            id: new_id("wfp"),
            workflow_id: workflow.id,
            base_hash: params.base_hash,
            proposed_by_session_id: params.proposed_by_session_id,
            execution_id: params.execution_id,
            proposal: canonical_string(&params.proposal),
            diff_text: params.diff_text,
            status: ProposalStatus::Draft,
            review_notes: None,
            expires_at: params.expires_at,
            created_at: ts.clone(),
            updated_at: ts,
        };

        self.repo.insert_proposal(&proposal).await?;
        info!(proposal_id = %proposal.id, workflow_id = %proposal.workflow_id, "proposal drafted");
        Ok(proposal)
    }

    /// Review a draft. Approval records intent only; the workflow is not
    /// mutated until apply.
    pub async fn review(
        &self,
        proposal_id: &str,
        approve: bool,
        notes: Option<&str>,
    ) -> CoreResult<WorkflowProposal> {
        let proposal = self
            .repo
            .get_proposal(proposal_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("proposal {proposal_id}")))?;

        if proposal.status != ProposalStatus::Draft {
            return Err(CoreError::conflict(format!(
                "proposal {proposal_id} is {}, not draft",
                proposal.status
            )));
        }

        let next = if approve { ProposalStatus::Approved } else { ProposalStatus::Rejected };
        self.repo.set_proposal_status(proposal_id, next, notes).await?;

        self.repo
            .get_proposal(proposal_id)
            .await?
            .ok_or_else(|| CoreError::internal("reviewed proposal vanished"))
    }

    /// Transactional apply; fails with `STALE_BASE` when the workflow moved
    /// past the proposal's base hash.
    pub async fn apply(
        &self,
        proposal_id: &str,
        review_notes: Option<&str>,
        version: Option<i64>,
    ) -> CoreResult<(String, i64)> {
        let (hash, version) = self.repo.apply_swap(proposal_id, version, review_notes).await?;
        info!(proposal_id, new_hash = %hash, version, "proposal applied");
        Ok((hash, version))
    }

    /// Roll the workflow back to a hash already in its history.
    pub async fn rollback(
        &self,
        workflow_id: &str,
        target_hash: &str,
        version: Option<i64>,
        _notes: Option<&str>,
    ) -> CoreResult<(String, i64)> {
        let swap = self.repo.rollback_swap(workflow_id, target_hash, version).await?;
        info!(workflow_id, target_hash, "workflow rolled back");
        Ok(swap)
    }

    /// Background sweep for `expires_at` in the past.
    pub async fn sweep_expired(&self) -> CoreResult<u64> {
        let expired = self.repo.expire_stale_proposals().await?;
        if expired > 0 {
            info!(expired, "expired stale proposals");
        }
        Ok(expired)
    }
}
