//! Workflow data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    NeedsApproval,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Queued => write!(f, "queued"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::NeedsApproval => write!(f, "needs_approval"),
            ExecutionStatus::Succeeded => write!(f, "succeeded"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ExecutionStatus::Queued),
            "running" => Ok(ExecutionStatus::Running),
            "needs_approval" => Ok(ExecutionStatus::NeedsApproval),
            "succeeded" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            _ => Err(format!("unknown execution status: {}", s)),
        }
    }
}

impl TryFrom<String> for ExecutionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Awaiting,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::Awaiting => write!(f, "awaiting"),
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "succeeded" => Ok(StepStatus::Succeeded),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            "awaiting" => Ok(StepStatus::Awaiting),
            _ => Err(format!("unknown step status: {}", s)),
        }
    }
}

impl TryFrom<String> for StepStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Draft,
    Approved,
    Rejected,
    Applied,
    Expired,
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProposalStatus::Draft => write!(f, "draft"),
            ProposalStatus::Approved => write!(f, "approved"),
            ProposalStatus::Rejected => write!(f, "rejected"),
            ProposalStatus::Applied => write!(f, "applied"),
            ProposalStatus::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for ProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(ProposalStatus::Draft),
            "approved" => Ok(ProposalStatus::Approved),
            "rejected" => Ok(ProposalStatus::Rejected),
            "applied" => Ok(ProposalStatus::Applied),
            "expired" => Ok(ProposalStatus::Expired),
            _ => Err(format!("unknown proposal status: {}", s)),
        }
    }
}

impl TryFrom<String> for ProposalStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A versioned, hash-identified declarative program.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workflow {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub current_hash: String,
    pub current_version: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Immutable definition snapshot addressed by hash.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowVersion {
    pub workflow_id: String,
    pub hash: String,
    /// Canonical JSON.
    pub definition: String,
    pub version: i64,
    pub notes: Option<String>,
    pub created_at: String,
}

/// One run of a workflow at a specific hash.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub workflow_hash: String,
    #[sqlx(try_from = "String")]
    pub status: ExecutionStatus,
    pub trigger: String,
    /// Canonical JSON variable scope.
    pub variables: String,
    pub resume_token: Option<String>,
    pub requires_approval: i64,
    pub parent_execution_id: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl WorkflowExecution {
    pub fn variables_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.variables).unwrap_or(serde_json::Value::Null)
    }
}

/// One attempt of one step; display order is trace order.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepTrace {
    pub id: String,
    pub execution_id: String,
    pub step_id: String,
    pub attempt: i64,
    #[sqlx(try_from = "String")]
    pub status: StepStatus,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
}

/// Candidate replacement for a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowProposal {
    pub id: String,
    pub workflow_id: String,
    pub base_hash: String,
    pub proposed_by_session_id: Option<String>,
    pub execution_id: Option<String>,
    /// Canonical JSON of the proposed definition.
    pub proposal: String,
    pub diff_text: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: ProposalStatus,
    pub review_notes: Option<String>,
    pub expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}
