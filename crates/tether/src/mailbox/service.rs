//! Mailbox service: recipient resolution and durable emit/fetch.

use std::sync::Arc;

use crate::bus::{BusEvent, EventBus};
use crate::error::{CoreError, CoreResult};
use crate::ids::{new_id, now_ts};
use crate::session::SessionService;

use super::models::{MailboxEntry, MailboxMessageType, Recipient};
use super::repository::MailboxRepository;

/// Parameters for emitting one mailbox entry. Exactly one of
/// `to_session_id`, `to_user_id`, `to_handle` must be set.
#[derive(Debug, Clone, Default)]
pub struct EmitParams {
    pub to_session_id: Option<String>,
    pub to_user_id: Option<String>,
    pub to_handle: Option<String>,
    pub message_type: Option<MailboxMessageType>,
    pub content: String,
    pub from_session_id: Option<String>,
    pub context_session_id: Option<String>,
    pub context_task_id: Option<String>,
    pub reply_to_id: Option<String>,
}

#[derive(Clone)]
pub struct MailboxService {
    repo: MailboxRepository,
    sessions: Arc<SessionService>,
    bus: Arc<EventBus>,
}

impl MailboxService {
    pub fn new(
        repo: MailboxRepository,
        sessions: Arc<SessionService>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self { repo, sessions, bus }
    }

    /// Durably emit a notification. Handles resolve to a user id at write
    /// time; unknown or ambiguous handles fail with `UNKNOWN_RECIPIENT`.
    pub async fn emit(&self, params: EmitParams) -> CoreResult<MailboxEntry> {
        if params.content.trim().is_empty() {
            return Err(CoreError::validation("content must not be empty"));
        }

        let recipients_given = [
            params.to_session_id.is_some(),
            params.to_user_id.is_some(),
            params.to_handle.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if recipients_given != 1 {
            return Err(CoreError::validation(
                "exactly one of to_session_id, to_user_id, to_handle is required",
            ));
        }

        let (to_session_id, to_user_id) = if let Some(session_id) = params.to_session_id {
            (Some(session_id), None)
        } else if let Some(user_id) = params.to_user_id {
            (None, Some(user_id))
        } else if let Some(handle) = params.to_handle {
            let user_id = self.sessions.resolve_handle(&handle).await?;
            (None, Some(user_id))
        } else {
            unreachable!("recipient presence checked above")
        };

        let entry = MailboxEntry {
            id: new_id("mbx"),
            to_session_id,
            to_user_id,
            message_type: params.message_type.unwrap_or(MailboxMessageType::Notification),
            content: params.content,
            from_session_id: params.from_session_id,
            context_session_id: params.context_session_id,
            context_task_id: params.context_task_id,
            reply_to_id: params.reply_to_id,
            read_at: None,
            created_at: now_ts(),
        };

        self.repo.insert(&entry).await?;

        if let Some(user_id) = &entry.to_user_id {
            self.bus.publish(
                user_id,
                BusEvent::new(
                    format!("mailbox.{}", entry.message_type),
                    &entry.id,
                    serde_json::json!({ "entryId": entry.id }),
                ),
            );
        }

        Ok(entry)
    }

    /// Read a recipient's unread queue, atomically marking it read.
    pub async fn fetch(
        &self,
        recipient: Recipient,
        limit: Option<i64>,
        after: Option<String>,
    ) -> CoreResult<Vec<MailboxEntry>> {
        let limit = limit.unwrap_or(50).clamp(1, 200);
        Ok(self
            .repo
            .fetch_and_mark_read(&recipient, limit, after.as_deref())
            .await?)
    }

    pub async fn unread_count(&self, recipient: Recipient) -> CoreResult<i64> {
        Ok(self.repo.unread_count(&recipient).await?)
    }
}
