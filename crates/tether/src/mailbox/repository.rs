//! Mailbox persistence.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::ids::now_ts;

use super::models::{MailboxEntry, Recipient};

const MAILBOX_COLUMNS: &str = "id, to_session_id, to_user_id, message_type, content, \
     from_session_id, context_session_id, context_task_id, reply_to_id, read_at, created_at";

#[derive(Debug, Clone)]
pub struct MailboxRepository {
    pool: SqlitePool,
}

impl MailboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, entry: &MailboxEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mailbox (
                id, to_session_id, to_user_id, message_type, content,
                from_session_id, context_session_id, context_task_id,
                reply_to_id, read_at, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.to_session_id)
        .bind(&entry.to_user_id)
        .bind(entry.message_type.to_string())
        .bind(&entry.content)
        .bind(&entry.from_session_id)
        .bind(&entry.context_session_id)
        .bind(&entry.context_task_id)
        .bind(&entry.reply_to_id)
        .bind(&entry.read_at)
        .bind(&entry.created_at)
        .execute(&self.pool)
        .await
        .context("inserting mailbox entry")?;

        Ok(())
    }

    /// Fetch unread entries for a recipient and mark them read in the same
    /// transaction. Already-read entries are never returned, so repeating
    /// the call is a no-op.
    pub async fn fetch_and_mark_read(
        &self,
        recipient: &Recipient,
        limit: i64,
        after: Option<&str>,
    ) -> Result<Vec<MailboxEntry>> {
        let (column, value) = match recipient {
            Recipient::Session(id) => ("to_session_id", id.as_str()),
            Recipient::User(id) => ("to_user_id", id.as_str()),
        };

        let mut tx = self.pool.begin().await.context("beginning mailbox read")?;

        let entries = match after {
            Some(after) => {
                sqlx::query_as::<_, MailboxEntry>(&format!(
                    "SELECT {MAILBOX_COLUMNS} FROM mailbox \
                     WHERE {column} = ? AND read_at IS NULL AND created_at > ? \
                     ORDER BY created_at, id LIMIT ?"
                ))
                .bind(value)
                .bind(after)
                .bind(limit)
                .fetch_all(&mut *tx)
                .await
            }
            None => {
                sqlx::query_as::<_, MailboxEntry>(&format!(
                    "SELECT {MAILBOX_COLUMNS} FROM mailbox \
                     WHERE {column} = ? AND read_at IS NULL \
                     ORDER BY created_at, id LIMIT ?"
                ))
                .bind(value)
                .bind(limit)
                .fetch_all(&mut *tx)
                .await
            }
        }
        .context("fetching mailbox entries")?;

        let read_at = now_ts();
        for entry in &entries {
            sqlx::query("UPDATE mailbox SET read_at = ? WHERE id = ? AND read_at IS NULL")
                .bind(&read_at)
                .bind(&entry.id)
                .execute(&mut *tx)
                .await
                .context("marking mailbox entry read")?;
        }

        tx.commit().await.context("committing mailbox read")?;

        let mut entries = entries;
        for entry in &mut entries {
            entry.read_at = Some(read_at.clone());
        }
        Ok(entries)
    }

    /// Unread count for badges; read-only.
    pub async fn unread_count(&self, recipient: &Recipient) -> Result<i64> {
        let (column, value) = match recipient {
            Recipient::Session(id) => ("to_session_id", id.as_str()),
            Recipient::User(id) => ("to_user_id", id.as_str()),
        };

        let (count,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM mailbox WHERE {column} = ? AND read_at IS NULL"
        ))
        .bind(value)
        .fetch_one(&self.pool)
        .await
        .context("counting unread mailbox entries")?;

        Ok(count)
    }

    pub async fn get(&self, id: &str) -> Result<Option<MailboxEntry>> {
        let entry = sqlx::query_as::<_, MailboxEntry>(&format!(
            "SELECT {MAILBOX_COLUMNS} FROM mailbox WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching mailbox entry")?;

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::ids::new_id;
    use crate::mailbox::models::MailboxMessageType;

    fn entry_to_user(user: &str, content: &str) -> MailboxEntry {
        MailboxEntry {
            id: new_id("mbx"),
            to_session_id: None,
            to_user_id: Some(user.to_string()),
            message_type: MailboxMessageType::Notification,
            content: content.to_string(),
            from_session_id: None,
            context_session_id: None,
            context_task_id: None,
            reply_to_id: None,
            read_at: None,
            created_at: now_ts(),
        }
    }

    #[tokio::test]
    async fn reads_mark_entries_and_are_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let repo = MailboxRepository::new(db.pool().clone());

        repo.insert(&entry_to_user("u1", "first")).await.unwrap();
        repo.insert(&entry_to_user("u1", "second")).await.unwrap();

        let recipient = Recipient::User("u1".to_string());
        assert_eq!(repo.unread_count(&recipient).await.unwrap(), 2);

        let batch = repo.fetch_and_mark_read(&recipient, 10, None).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|e| e.read_at.is_some()));

        // Second read returns nothing; marking again changed nothing.
        let again = repo.fetch_and_mark_read(&recipient, 10, None).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(repo.unread_count(&recipient).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn limit_and_cursor_page_the_queue() {
        let db = Database::in_memory().await.unwrap();
        let repo = MailboxRepository::new(db.pool().clone());

        for n in 0..3 {
            repo.insert(&entry_to_user("u1", &format!("n{n}"))).await.unwrap();
        }

        let recipient = Recipient::User("u1".to_string());
        let first = repo.fetch_and_mark_read(&recipient, 2, None).await.unwrap();
        assert_eq!(first.len(), 2);

        let rest = repo.fetch_and_mark_read(&recipient, 10, None).await.unwrap();
        assert_eq!(rest.len(), 1);
    }
}
