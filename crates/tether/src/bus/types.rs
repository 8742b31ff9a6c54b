//! Event bus payload types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::now_ts;

/// One event on the bus. Delivery is at-most-once per connection; clients
/// recover gaps by re-reading persistent state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Dotted event kind, e.g. `session.running` or
    /// `workflow.awaiting_approval`.
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: String,
    /// Entity the event is about (session id, execution id, ...).
    pub subject: String,
    pub payload: Value,
}

impl BusEvent {
    pub fn new(kind: impl Into<String>, subject: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            timestamp: now_ts(),
            subject: subject.into(),
            payload,
        }
    }

    pub fn session(status: &str, session_id: &str, payload: Value) -> Self {
        Self::new(format!("session.{status}"), session_id, payload)
    }

    pub fn workflow(kind: &str, execution_id: &str, payload: Value) -> Self {
        Self::new(format!("workflow.{kind}"), execution_id, payload)
    }
}

/// Per-connection subscription filters. Empty means "everything for my user".
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilters {
    /// Restrict to these subjects (session/execution ids).
    pub subjects: Option<Vec<String>>,
    /// Restrict to kinds with one of these prefixes (e.g. `session.`).
    pub kind_prefixes: Option<Vec<String>>,
}

impl SubscriptionFilters {
    pub fn matches(&self, event: &BusEvent) -> bool {
        if let Some(subjects) = &self.subjects {
            if !subjects.iter().any(|s| s == &event.subject) {
                return false;
            }
        }
        if let Some(prefixes) = &self.kind_prefixes {
            if !prefixes.iter().any(|p| event.kind.starts_with(p.as_str())) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_filters_match_everything() {
        let filters = SubscriptionFilters::default();
        assert!(filters.matches(&BusEvent::session("running", "ses_1", json!({}))));
    }

    #[test]
    fn subject_filter() {
        let filters = SubscriptionFilters {
            subjects: Some(vec!["ses_1".to_string()]),
            kind_prefixes: None,
        };
        assert!(filters.matches(&BusEvent::session("idle", "ses_1", json!({}))));
        assert!(!filters.matches(&BusEvent::session("idle", "ses_2", json!({}))));
    }

    #[test]
    fn kind_prefix_filter() {
        let filters = SubscriptionFilters {
            subjects: None,
            kind_prefixes: Some(vec!["workflow.".to_string()]),
        };
        assert!(filters.matches(&BusEvent::workflow("awaiting_approval", "wfx_1", json!({}))));
        assert!(!filters.matches(&BusEvent::session("running", "ses_1", json!({}))));
    }
}
