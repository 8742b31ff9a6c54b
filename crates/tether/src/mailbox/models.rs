//! Mailbox data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Kind of mailbox entry. Notifications and approvals share storage and may
/// thread via `reply_to_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailboxMessageType {
    Notification,
    Question,
    Escalation,
    Approval,
}

impl std::fmt::Display for MailboxMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailboxMessageType::Notification => write!(f, "notification"),
            MailboxMessageType::Question => write!(f, "question"),
            MailboxMessageType::Escalation => write!(f, "escalation"),
            MailboxMessageType::Approval => write!(f, "approval"),
        }
    }
}

impl std::str::FromStr for MailboxMessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notification" => Ok(MailboxMessageType::Notification),
            "question" => Ok(MailboxMessageType::Question),
            "escalation" => Ok(MailboxMessageType::Escalation),
            "approval" => Ok(MailboxMessageType::Approval),
            _ => Err(format!("unknown mailbox message type: {}", s)),
        }
    }
}

impl TryFrom<String> for MailboxMessageType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Delivery address, resolved at write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Session(String),
    User(String),
}

/// One durable mailbox row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MailboxEntry {
    pub id: String,
    pub to_session_id: Option<String>,
    pub to_user_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub message_type: MailboxMessageType,
    pub content: String,
    pub from_session_id: Option<String>,
    pub context_session_id: Option<String>,
    pub context_task_id: Option<String>,
    pub reply_to_id: Option<String>,
    pub read_at: Option<String>,
    pub created_at: String,
}
