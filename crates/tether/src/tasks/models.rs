//! Task board data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Allowed task status transitions. `blocked -> pending` is the dependency
/// cascade; `failed -> pending` re-queues a failed task.
pub fn task_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, InProgress)
            | (Pending, Completed)
            | (Pending, Failed)
            | (Pending, Blocked)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Blocked)
            | (Blocked, Pending)
            | (Blocked, Failed)
            | (Failed, Pending)
    )
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Blocked => write!(f, "blocked"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "blocked" => Ok(TaskStatus::Blocked),
            _ => Err(format!("unknown task status: {}", s)),
        }
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// One work item on the board.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    pub orchestrator_session_id: String,
    /// Assignee session, if delegated.
    pub session_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: TaskStatus,
    /// Free-form handoff text written on completion.
    pub result: Option<String>,
    pub parent_task_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_is_terminal() {
        assert!(!task_transition_allowed(TaskStatus::Completed, TaskStatus::Pending));
        assert!(!task_transition_allowed(TaskStatus::Completed, TaskStatus::InProgress));
    }

    #[test]
    fn cascade_transition_is_allowed() {
        assert!(task_transition_allowed(TaskStatus::Blocked, TaskStatus::Pending));
    }

    #[test]
    fn status_round_trips() {
        let parsed: TaskStatus = "in_progress".parse().unwrap();
        assert_eq!(parsed, TaskStatus::InProgress);
        assert_eq!(parsed.to_string(), "in_progress");
    }
}
