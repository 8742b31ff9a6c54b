//! Session data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, no sandbox yet.
    Pending,
    /// Sandbox is being provisioned.
    Starting,
    /// Runner attached, agent working.
    Running,
    /// Runner attached, agent waiting for input.
    Idle,
    /// Sandbox released; durable state kept.
    Hibernated,
    /// Torn down for good. Absorbing.
    Terminated,
    /// Sandbox or runner link failed.
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Terminated)
    }

    /// Runner link is expected in these states.
    pub fn is_linked(self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::Idle)
    }
}

/// Allowed session status transitions. `Terminated` is absorbing.
pub fn can_transition(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    matches!(
        (from, to),
        (Pending, Starting)
            // Teardown stays legal before the sandbox ever came up;
            // refusing it would leak the provisioned handle.
            | (Pending, Terminated)
            | (Starting, Running)
            | (Starting, Error)
            | (Starting, Terminated)
            | (Running, Idle)
            | (Idle, Running)
            | (Running, Error)
            | (Running, Hibernated)
            | (Running, Terminated)
            | (Idle, Error)
            | (Idle, Hibernated)
            | (Idle, Terminated)
            | (Hibernated, Starting)
            | (Hibernated, Terminated)
            // Runner reconnect after heartbeat loss restores the link.
            | (Error, Running)
            | (Error, Terminated)
    )
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Hibernated => write!(f, "hibernated"),
            SessionStatus::Terminated => write!(f, "terminated"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "starting" => Ok(SessionStatus::Starting),
            "running" => Ok(SessionStatus::Running),
            "idle" => Ok(SessionStatus::Idle),
            "hibernated" => Ok(SessionStatus::Hibernated),
            "terminated" => Ok(SessionStatus::Terminated),
            "error" => Ok(SessionStatus::Error),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Why the session exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPurpose {
    Interactive,
    Orchestrator,
    Workflow,
    Child,
}

impl std::fmt::Display for SessionPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPurpose::Interactive => write!(f, "interactive"),
            SessionPurpose::Orchestrator => write!(f, "orchestrator"),
            SessionPurpose::Workflow => write!(f, "workflow"),
            SessionPurpose::Child => write!(f, "child"),
        }
    }
}

impl std::str::FromStr for SessionPurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interactive" => Ok(SessionPurpose::Interactive),
            "orchestrator" => Ok(SessionPurpose::Orchestrator),
            "workflow" => Ok(SessionPurpose::Workflow),
            "child" => Ok(SessionPurpose::Child),
            _ => Err(format!("unknown session purpose: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionPurpose {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A conversation with a sandboxed agent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub parent_id: Option<String>,
    pub workspace: String,
    pub title: String,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    #[sqlx(try_from = "String")]
    pub purpose: SessionPurpose,
    pub model_pref: Option<String>,
    /// Canonicalized JSON blob (sandbox handle, callback token, orchestrator
    /// handle, ...).
    pub metadata: String,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Session {
    pub fn metadata_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.metadata).unwrap_or(serde_json::Value::Null)
    }
}

/// Where a session's working tree comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitSourceType {
    Pr,
    Issue,
    Branch,
    Manual,
}

impl std::fmt::Display for GitSourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitSourceType::Pr => write!(f, "pr"),
            GitSourceType::Issue => write!(f, "issue"),
            GitSourceType::Branch => write!(f, "branch"),
            GitSourceType::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for GitSourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pr" => Ok(GitSourceType::Pr),
            "issue" => Ok(GitSourceType::Issue),
            "branch" => Ok(GitSourceType::Branch),
            "manual" => Ok(GitSourceType::Manual),
            _ => Err(format!("unknown git source type: {}", s)),
        }
    }
}

impl TryFrom<String> for GitSourceType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Git provenance, 1:1 with a session. Mutable only before the first
/// successful starting -> running transition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionGitState {
    pub session_id: String,
    #[sqlx(try_from = "String")]
    pub source_type: GitSourceType,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub git_ref: Option<String>,
}

/// Author role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            "tool" => Ok(MessageRole::Tool),
            _ => Err(format!("unknown message role: {}", s)),
        }
    }
}

impl TryFrom<String> for MessageRole {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// One immutable chat log entry. Edits produce a new message with `edit_of`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    #[sqlx(try_from = "String")]
    pub role: MessageRole,
    pub content: String,
    pub channel_type: String,
    pub channel_id: Option<String>,
    pub tool_call: Option<String>,
    /// Source session id when this row is a forwarded copy.
    pub forward_from: Option<String>,
    pub edit_of: Option<String>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_is_absorbing() {
        use SessionStatus::*;
        for to in [Pending, Starting, Running, Idle, Hibernated, Terminated, Error] {
            assert!(!can_transition(Terminated, to), "terminated -> {to}");
        }
    }

    #[test]
    fn lifecycle_happy_path() {
        use SessionStatus::*;
        assert!(can_transition(Pending, Starting));
        assert!(can_transition(Starting, Running));
        assert!(can_transition(Running, Idle));
        assert!(can_transition(Idle, Running));
        assert!(can_transition(Idle, Hibernated));
        assert!(can_transition(Hibernated, Starting));
        assert!(can_transition(Error, Terminated));
        assert!(can_transition(Error, Running));
    }

    #[test]
    fn teardown_is_reachable_from_every_live_state() {
        use SessionStatus::*;
        for from in [Pending, Starting, Running, Idle, Hibernated, Error] {
            assert!(can_transition(from, Terminated), "{from} -> terminated");
        }
    }

    #[test]
    fn illegal_jumps_rejected() {
        use SessionStatus::*;
        assert!(!can_transition(Pending, Running));
        assert!(!can_transition(Hibernated, Running));
        assert!(!can_transition(Error, Running));
        assert!(!can_transition(Idle, Starting));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::Hibernated,
            SessionStatus::Error,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("warming-up".parse::<SessionStatus>().is_err());
    }
}
