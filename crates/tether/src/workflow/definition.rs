//! Runtime step model parsed from a stored definition.
//!
//! Validation accepts unknown step types; the interpreter does not. Parsing
//! here is the bridge: a step that parses becomes executable, anything else
//! fails the execution when reached.

use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// Sleep steps clamp to this range, in seconds.
pub const SLEEP_MIN_SECS: u64 = 1;
pub const SLEEP_MAX_SECS: u64 = 300;

/// Retry policy for tool steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

/// Branch predicate, deterministic and side-effect-free over the execution's
/// variable scope.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Bare string: truthiness of that variable.
    Truthy(String),
    /// `{var, op, value?}` comparison.
    Compare { var: String, op: CompareOp, value: Option<Value> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Exists,
    NotExists,
    Contains,
}

impl Predicate {
    pub fn parse(raw: &Value) -> CoreResult<Self> {
        match raw {
            Value::String(var) if !var.is_empty() => Ok(Predicate::Truthy(var.clone())),
            Value::Object(obj) => {
                let var = obj
                    .get("var")
                    .and_then(Value::as_str)
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| {
                        CoreError::validation("branch predicate requires a 'var' name")
                    })?;
                let op = match obj.get("op").and_then(Value::as_str) {
                    Some("eq") | None => CompareOp::Eq,
                    Some("ne") => CompareOp::Ne,
                    Some("exists") => CompareOp::Exists,
                    Some("not_exists") => CompareOp::NotExists,
                    Some("contains") => CompareOp::Contains,
                    Some(other) => {
                        return Err(CoreError::validation(format!(
                            "unknown branch predicate op '{other}'"
                        )))
                    }
                };
                Ok(Predicate::Compare {
                    var: var.to_string(),
                    op,
                    value: obj.get("value").cloned(),
                })
            }
            _ => Err(CoreError::validation(
                "branch predicate must be a variable name or {var, op, value}",
            )),
        }
    }

    /// Evaluate against the variable scope.
    pub fn evaluate(&self, variables: &Value) -> bool {
        match self {
            Predicate::Truthy(var) => is_truthy(variables.get(var)),
            Predicate::Compare { var, op, value } => {
                let actual = variables.get(var);
                match op {
                    CompareOp::Exists => actual.is_some(),
                    CompareOp::NotExists => actual.is_none(),
                    CompareOp::Eq => actual == value.as_ref(),
                    CompareOp::Ne => actual != value.as_ref(),
                    CompareOp::Contains => match (actual, value) {
                        (Some(Value::String(hay)), Some(Value::String(needle))) => {
                            hay.contains(needle.as_str())
                        }
                        (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                        _ => false,
                    },
                }
            }
        }
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(_)) => true,
    }
}

/// One executable step.
#[derive(Debug, Clone)]
pub enum Step {
    Tool {
        id: String,
        tool: String,
        args: Value,
        retry: Option<RetryPolicy>,
        tolerate_failure: bool,
    },
    AgentMessage {
        id: String,
        content: String,
        await_response: bool,
        await_timeout_ms: u64,
    },
    Approval {
        id: String,
        prompt: Option<String>,
    },
    Branch {
        id: String,
        predicate: Predicate,
        then_steps: Vec<Step>,
        else_steps: Vec<Step>,
    },
    Sequence {
        id: String,
        steps: Vec<Step>,
    },
    Sub {
        id: String,
        workflow: String,
        variables: Option<Value>,
        tolerate_failure: bool,
    },
    Sleep {
        id: String,
        seconds: u64,
    },
}

impl Step {
    pub fn id(&self) -> &str {
        match self {
            Step::Tool { id, .. }
            | Step::AgentMessage { id, .. }
            | Step::Approval { id, .. }
            | Step::Branch { id, .. }
            | Step::Sequence { id, .. }
            | Step::Sub { id, .. }
            | Step::Sleep { id, .. } => id,
        }
    }
}

/// Parse the root `steps` array of a definition.
pub fn parse_steps(definition: &Value) -> CoreResult<Vec<Step>> {
    let steps = definition
        .get("steps")
        .and_then(Value::as_array)
        .ok_or_else(|| CoreError::validation("definition requires a 'steps' array"))?;
    steps
        .iter()
        .enumerate()
        .map(|(index, raw)| parse_step(raw, &format!("steps[{index}]")))
        .collect()
}

fn parse_step(raw: &Value, path: &str) -> CoreResult<Step> {
    let obj = raw
        .as_object()
        .ok_or_else(|| CoreError::validation(format!("{path}: step must be an object")))?;

    let step_type = obj
        .get("type")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CoreError::validation(format!("{path}: step requires a 'type'")))?;

    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| path.to_string());

    match step_type {
        "tool" => {
            let tool = obj
                .get("tool")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    CoreError::validation(format!("{path}: tool step requires a 'tool' name"))
                })?;
            let retry = match obj.get("retry") {
                None => None,
                Some(retry) => Some(RetryPolicy {
                    attempts: retry.get("attempts").and_then(Value::as_u64).unwrap_or(1) as u32,
                    backoff_ms: retry.get("backoff_ms").and_then(Value::as_u64).unwrap_or(0),
                }),
            };
            Ok(Step::Tool {
                id,
                tool: tool.to_string(),
                args: obj.get("args").cloned().unwrap_or(Value::Null),
                retry,
                tolerate_failure: tolerate_failure(obj),
            })
        }

        "agent_message" => {
            let content = ["content", "message", "goal"]
                .iter()
                .find_map(|key| obj.get(*key).and_then(Value::as_str))
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    CoreError::validation(format!(
                        "{path}: agent_message requires content/message/goal"
                    ))
                })?;
            let await_response = obj.get("await").and_then(Value::as_bool).unwrap_or(false)
                || obj.get("await_response").and_then(Value::as_bool).unwrap_or(false);
            Ok(Step::AgentMessage {
                id,
                content: content.to_string(),
                await_response,
                await_timeout_ms: obj
                    .get("await_timeout_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(30_000),
            })
        }

        "approval" => Ok(Step::Approval {
            id,
            prompt: obj.get("prompt").and_then(Value::as_str).map(str::to_string),
        }),

        "branch" => {
            let raw_predicate = obj
                .get("if")
                .ok_or_else(|| CoreError::validation(format!("{path}: branch requires 'if'")))?;
            Ok(Step::Branch {
                predicate: Predicate::parse(raw_predicate)?,
                then_steps: parse_nested(obj.get("then"), &format!("{path}.then"))?,
                else_steps: parse_nested(obj.get("else"), &format!("{path}.else"))?,
                id,
            })
        }

        "sequence" => Ok(Step::Sequence {
            steps: parse_nested(obj.get("steps"), &format!("{path}.steps"))?,
            id,
        }),

        "sub" => {
            let workflow = obj
                .get("workflow")
                .and_then(Value::as_str)
                .filter(|w| !w.is_empty())
                .ok_or_else(|| {
                    CoreError::validation(format!("{path}: sub step requires a 'workflow' slug"))
                })?;
            Ok(Step::Sub {
                id,
                workflow: workflow.to_string(),
                variables: obj.get("variables").cloned(),
                tolerate_failure: tolerate_failure(obj),
            })
        }

        "sleep" => {
            let seconds = obj
                .get("seconds")
                .and_then(Value::as_u64)
                .unwrap_or(SLEEP_MIN_SECS)
                .clamp(SLEEP_MIN_SECS, SLEEP_MAX_SECS);
            Ok(Step::Sleep { id, seconds })
        }

        other => Err(CoreError::validation(format!(
            "{path}: no interpreter for step type '{other}'"
        ))),
    }
}

fn tolerate_failure(obj: &serde_json::Map<String, Value>) -> bool {
    obj.get("tolerate_failure").and_then(Value::as_bool).unwrap_or(false)
}

fn parse_nested(raw: Option<&Value>, path: &str) -> CoreResult<Vec<Step>> {
    match raw {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(index, item)| parse_step(item, &format!("{path}[{index}]")))
            .collect(),
        Some(_) => Err(CoreError::validation(format!("{path}: must be an array of steps"))),
    }
}

/// Deterministic workspace name for a workflow-owned session: ids truncated
/// to 16 chars, sanitized to `[A-Za-z0-9_-]`, clamped to 100 chars.
pub fn workflow_workspace(workflow_id: &str, execution_id: &str) -> String {
    let name = format!(
        "workflow-{}-{}",
        truncate(workflow_id, 16),
        truncate(execution_id, 16)
    );
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect();
    sanitized.chars().take(100).collect()
}

fn truncate(s: &str, max: usize) -> &str {
    &s[..s.len().min(max)]
}
