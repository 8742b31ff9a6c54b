//! Structural validation of workflow definitions.
//!
//! Validation is deliberately shallow about step semantics: unknown step
//! types pass (forward compatibility) and are only refused when an execution
//! actually reaches them. Shape problems are hard errors before any hash is
//! computed.

use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// Minimum await timeout for `agent_message` steps.
pub const MIN_AWAIT_TIMEOUT_MS: u64 = 1000;

/// Validate a definition; errors list every problem found.
pub fn validate_definition(definition: &Value) -> CoreResult<()> {
    let mut problems = Vec::new();

    let Some(root) = definition.as_object() else {
        return Err(CoreError::validation("definition must be a JSON object"));
    };

    match root.get("steps") {
        None => problems.push("definition requires a 'steps' array".to_string()),
        Some(Value::Array(steps)) if steps.is_empty() => {
            problems.push("'steps' must not be empty".to_string())
        }
        Some(Value::Array(steps)) => {
            for (index, step) in steps.iter().enumerate() {
                validate_step(step, &format!("steps[{index}]"), &mut problems);
            }
        }
        Some(_) => problems.push("'steps' must be an array".to_string()),
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(CoreError::Validation(problems.join("; ")))
    }
}

fn validate_step(step: &Value, path: &str, problems: &mut Vec<String>) {
    let Some(obj) = step.as_object() else {
        problems.push(format!("{path}: step must be an object"));
        return;
    };

    let step_type = match obj.get("type").and_then(Value::as_str) {
        Some(t) if !t.is_empty() => t,
        _ => {
            problems.push(format!("{path}: step requires a non-empty string 'type'"));
            return;
        }
    };

    for key in ["then", "else", "steps"] {
        if let Some(nested) = obj.get(key) {
            match nested {
                Value::Array(children) => {
                    for (index, child) in children.iter().enumerate() {
                        validate_step(child, &format!("{path}.{key}[{index}]"), problems);
                    }
                }
                _ => problems.push(format!("{path}.{key}: must be an array of steps")),
            }
        }
    }

    if step_type == "agent_message" {
        let has_content = ["content", "message", "goal"]
            .iter()
            .any(|key| obj.get(*key).and_then(Value::as_str).is_some_and(|s| !s.is_empty()));
        if !has_content {
            problems.push(format!(
                "{path}: agent_message requires one of 'content', 'message', 'goal'"
            ));
        }

        let awaits = obj.get("await").and_then(Value::as_bool).unwrap_or(false)
            || obj.get("await_response").and_then(Value::as_bool).unwrap_or(false);
        if awaits {
            match obj.get("await_timeout_ms").and_then(Value::as_u64) {
                Some(timeout) if timeout >= MIN_AWAIT_TIMEOUT_MS => {}
                Some(_) => problems.push(format!(
                    "{path}: await_timeout_ms must be at least {MIN_AWAIT_TIMEOUT_MS}"
                )),
                None => problems.push(format!(
                    "{path}: awaiting agent_message requires await_timeout_ms"
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_steps_rejected() {
        let err = validate_definition(&json!({"steps": []})).unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn missing_type_rejected() {
        let err = validate_definition(&json!({"steps": [{"id": "x"}]})).unwrap_err();
        assert!(err.to_string().contains("non-empty string 'type'"));
    }

    #[test]
    fn unknown_step_types_pass_validation() {
        validate_definition(&json!({
            "steps": [{"id": "x", "type": "quantum_deploy", "qubits": 3}]
        }))
        .unwrap();
    }

    #[test]
    fn nested_branches_are_walked() {
        let err = validate_definition(&json!({
            "steps": [{
                "type": "branch",
                "if": "flag",
                "then": [{"id": "bad"}],
                "else": "not-an-array"
            }]
        }))
        .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("steps[0].then[0]"));
        assert!(text.contains("steps[0].else"));
    }

    #[test]
    fn agent_message_needs_content() {
        let err = validate_definition(&json!({
            "steps": [{"type": "agent_message"}]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("agent_message requires one of"));
    }

    #[test]
    fn awaiting_agent_message_needs_sane_timeout() {
        let err = validate_definition(&json!({
            "steps": [{
                "type": "agent_message",
                "content": "status?",
                "await": true,
                "await_timeout_ms": 100
            }]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("await_timeout_ms must be at least 1000"));

        validate_definition(&json!({
            "steps": [{
                "type": "agent_message",
                "content": "status?",
                "await": true,
                "await_timeout_ms": 5000
            }]
        }))
        .unwrap();
    }

    #[test]
    fn full_approval_workflow_validates() {
        validate_definition(&json!({
            "name": "ship",
            "steps": [
                {"id": "lint", "type": "tool", "tool": "npm_lint"},
                {"id": "approve", "type": "approval", "prompt": "Ship?"},
                {"id": "deploy", "type": "tool", "tool": "deploy"}
            ]
        }))
        .unwrap();
    }
}
