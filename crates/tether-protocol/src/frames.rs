//! Frame types for the runner WebSocket protocol.
//!
//! The control plane is the server; runners connect out from their sandbox
//! and reconnect with backoff. Every frame carries a correlation id
//! (`message_id`, `question_id`, `call_id`, `request_id`) so both sides can
//! pair requests with replies across reconnects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentStatus;

/// Frames sent from the control plane to the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Deliver a user prompt. Runners must treat an already-seen
    /// `message_id` as an idempotent no-op.
    Prompt {
        message_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// Resolve a pending question raised by the runner.
    Answer {
        question_id: String,
        answer: String,
    },

    /// Stop the agent gracefully (session is terminating).
    Stop,

    /// Abort the in-flight turn. The runner acknowledges with `aborted`.
    Abort,

    /// Revert workspace state back past the given message.
    Revert { message_id: String },

    /// Request a workspace diff.
    Diff { request_id: String },

    /// Keepalive. Runners reply with `pong`.
    Ping,
}

/// Execution state of a tool call reported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

/// A model the runner can execute prompts with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

/// Frames sent from the runner to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerFrame {
    /// Incremental assistant output. Deltas accumulate per `message_id`
    /// until a `result` frame finalizes (and replaces) them.
    Stream {
        message_id: String,
        content: String,
    },

    /// Authoritative final content for a message. Wins over any partial
    /// stream accumulation when the two disagree.
    Result {
        message_id: String,
        content: String,
    },

    /// Tool call lifecycle update.
    Tool {
        call_id: String,
        tool_name: String,
        status: ToolStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    /// The agent needs a human decision to continue.
    Question {
        question_id: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        options: Option<Vec<String>>,
    },

    /// Screenshot captured inside the sandbox (base64 payload).
    Screenshot {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },

    /// The turn identified by `message_id` failed.
    Error {
        message_id: String,
        error: String,
    },

    /// The current turn finished.
    Complete,

    /// Agent activity report; drives the session's running/idle flip.
    AgentStatus {
        status: AgentStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    /// The agent wants a pull request opened for its branch.
    CreatePr {
        branch: String,
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        base: Option<String>,
    },

    /// Models available inside this sandbox.
    Models { models: Vec<ModelInfo> },

    /// Acknowledgement of an `abort` control frame.
    Aborted,

    /// Acknowledgement of a `revert`, listing the messages rolled back.
    Reverted { message_ids: Vec<String> },

    /// Reply to a `diff` request.
    Diff {
        request_id: String,
        data: String,
    },

    /// Keepalive reply.
    Pong,
}

/// Decode a runner frame, tolerating unknown frame types.
///
/// Returns `Ok(None)` when the payload is a well-formed frame of a type this
/// build does not know — callers log a warning and move on, per the forward
/// compatibility rule. Malformed payloads are a hard error.
pub fn decode_runner_frame(text: &str) -> Result<Option<RunnerFrame>, serde_json::Error> {
    decode_tolerant(text)
}

/// Decode a control frame with the same unknown-type tolerance. Used by the
/// in-process local runner and by runner-side tests.
pub fn decode_control_frame(text: &str) -> Result<Option<ControlFrame>, serde_json::Error> {
    decode_tolerant(text)
}

fn decode_tolerant<T: serde::de::DeserializeOwned>(
    text: &str,
) -> Result<Option<T>, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let has_type_tag = value
        .as_object()
        .map(|obj| obj.get("type").is_some_and(Value::is_string))
        .unwrap_or(false);

    match serde_json::from_value::<T>(value) {
        Ok(frame) => Ok(Some(frame)),
        // A tagged object that fails to match any variant is an unknown
        // frame type, not a protocol violation.
        Err(_) if has_type_tag => Ok(None),
        Err(err) => Err(err),
    }
}
