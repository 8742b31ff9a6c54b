//! Agent activity states reported by runners.

use serde::{Deserialize, Serialize};

/// What the agent inside the sandbox is currently doing.
///
/// `Idle` is the only state in which the control plane forwards the next
/// queued prompt; everything else counts as busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Thinking,
    Responding,
    ToolCalling,
}

impl AgentStatus {
    pub fn is_busy(self) -> bool {
        !matches!(self, AgentStatus::Idle)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Thinking => write!(f, "thinking"),
            AgentStatus::Responding => write!(f, "responding"),
            AgentStatus::ToolCalling => write!(f, "tool_calling"),
        }
    }
}
