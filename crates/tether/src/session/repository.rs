//! Session and message persistence.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::ids::now_ts;

use super::models::{Message, Session, SessionGitState, SessionStatus};

const SESSION_COLUMNS: &str = "id, user_id, parent_id, workspace, title, status, purpose, \
     model_pref, metadata, error_message, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, session_id, role, content, channel_type, channel_id, \
     tool_call, forward_from, edit_of, created_at";

/// Repository for sessions, git state, and the per-session message log.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a session and its optional git state in one transaction.
    pub async fn create(&self, session: &Session, git: Option<&SessionGitState>) -> Result<()> {
        let mut tx = self.pool.begin().await.context("beginning transaction")?;

        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, user_id, parent_id, workspace, title, status, purpose,
                model_pref, metadata, error_message, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.parent_id)
        .bind(&session.workspace)
        .bind(&session.title)
        .bind(session.status.to_string())
        .bind(session.purpose.to_string())
        .bind(&session.model_pref)
        .bind(&session.metadata)
        .bind(&session.error_message)
        .bind(&session.created_at)
        .bind(&session.updated_at)
        .execute(&mut *tx)
        .await
        .context("creating session")?;

        if let Some(git) = git {
            sqlx::query(
                r#"
                INSERT INTO session_git_state (session_id, source_type, repo_url, branch, git_ref)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&git.session_id)
            .bind(git.source_type.to_string())
            .bind(&git.repo_url)
            .bind(&git.branch)
            .bind(&git.git_ref)
            .execute(&mut *tx)
            .await
            .context("creating session git state")?;
        }

        tx.commit().await.context("committing session create")?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;

        Ok(session)
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ? ORDER BY created_at, id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("listing sessions by user")?;

        Ok(sessions)
    }

    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE parent_id = ? ORDER BY created_at, id"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .context("listing child sessions")?;

        Ok(sessions)
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: SessionStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET status = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(error_message)
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("updating session status")?;

        Ok(())
    }

    pub async fn update_metadata(&self, id: &str, metadata: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET metadata = ?, updated_at = ? WHERE id = ?")
            .bind(metadata)
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session metadata")?;

        Ok(())
    }

    pub async fn get_git_state(&self, session_id: &str) -> Result<Option<SessionGitState>> {
        let git = sqlx::query_as::<_, SessionGitState>(
            "SELECT session_id, source_type, repo_url, branch, git_ref \
             FROM session_git_state WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session git state")?;

        Ok(git)
    }

    /// Walk `parent_id` links up to the root. Bounded to guard against
    /// corrupted data forming a loop.
    pub async fn ancestor_ids(&self, session_id: &str) -> Result<Vec<String>> {
        const MAX_DEPTH: usize = 64;

        let mut ancestors = Vec::new();
        let mut cursor = session_id.to_string();

        for _ in 0..MAX_DEPTH {
            let parent: Option<(Option<String>,)> =
                sqlx::query_as("SELECT parent_id FROM sessions WHERE id = ?")
                    .bind(&cursor)
                    .fetch_optional(&self.pool)
                    .await
                    .context("walking session ancestry")?;

            match parent.and_then(|(p,)| p) {
                Some(parent_id) => {
                    if ancestors.contains(&parent_id) || parent_id == session_id {
                        anyhow::bail!("session ancestry contains a cycle at {parent_id}");
                    }
                    ancestors.push(parent_id.clone());
                    cursor = parent_id;
                }
                None => return Ok(ancestors),
            }
        }

        anyhow::bail!("session ancestry deeper than {MAX_DEPTH}")
    }

    /// Append a message. Duplicate ids are no-ops; returns whether a row was
    /// actually written.
    pub async fn insert_message(&self, message: &Message) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages (
                id, session_id, role, content, channel_type, channel_id,
                tool_call, forward_from, edit_of, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.role.to_string())
        .bind(&message.content)
        .bind(&message.channel_type)
        .bind(&message.channel_id)
        .bind(&message.tool_call)
        .bind(&message.forward_from)
        .bind(&message.edit_of)
        .bind(&message.created_at)
        .execute(&self.pool)
        .await
        .context("inserting message")?;

        Ok(result.rows_affected() > 0)
    }

    /// Live workflow-owned session for a workspace, if one exists.
    pub async fn find_workflow_session(
        &self,
        user_id: &str,
        workspace: &str,
    ) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE user_id = ? AND workspace = ? AND purpose = 'workflow' \
               AND status != 'terminated' \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(user_id)
        .bind(workspace)
        .fetch_optional(&self.pool)
        .await
        .context("finding workflow session")?;

        Ok(session)
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching message")?;

        Ok(message)
    }

    /// Messages for a session in `(created_at, id)` order, optionally after a
    /// timestamp cursor.
    pub async fn list_messages(
        &self,
        session_id: &str,
        limit: i64,
        after: Option<&str>,
    ) -> Result<Vec<Message>> {
        let messages = match after {
            Some(after) => {
                sqlx::query_as::<_, Message>(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE session_id = ? AND created_at > ? \
                     ORDER BY created_at, id LIMIT ?"
                ))
                .bind(session_id)
                .bind(after)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, Message>(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE session_id = ? ORDER BY created_at, id LIMIT ?"
                ))
                .bind(session_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("listing messages")?;

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::ids::new_id;
    use crate::session::models::{MessageRole, SessionPurpose};

    fn sample_session(id: &str, user: &str, parent: Option<&str>) -> Session {
        let ts = now_ts();
        Session {
            id: id.to_string(),
            user_id: user.to_string(),
            parent_id: parent.map(str::to_string),
            workspace: "svc".to_string(),
            title: "test session".to_string(),
            status: SessionStatus::Pending,
            purpose: SessionPurpose::Interactive,
            model_pref: None,
            metadata: "{}".to_string(),
            error_message: None,
            created_at: ts.clone(),
            updated_at: ts,
        }
    }

    #[tokio::test]
    async fn create_and_fetch_session() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());

        let session = sample_session("ses_a", "u1", None);
        repo.create(&session, None).await.unwrap();

        let fetched = repo.get("ses_a").await.unwrap().unwrap();
        assert_eq!(fetched.user_id, "u1");
        assert_eq!(fetched.status, SessionStatus::Pending);
    }

    #[tokio::test]
    async fn ancestry_walk() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());

        repo.create(&sample_session("ses_root", "u1", None), None)
            .await
            .unwrap();
        repo.create(&sample_session("ses_mid", "u1", Some("ses_root")), None)
            .await
            .unwrap();
        repo.create(&sample_session("ses_leaf", "u1", Some("ses_mid")), None)
            .await
            .unwrap();

        let ancestors = repo.ancestor_ids("ses_leaf").await.unwrap();
        assert_eq!(ancestors, vec!["ses_mid".to_string(), "ses_root".to_string()]);
        assert!(repo.ancestor_ids("ses_root").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_message_id_is_a_noop() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());
        repo.create(&sample_session("ses_m", "u1", None), None)
            .await
            .unwrap();

        let msg = Message {
            id: new_id("msg"),
            session_id: "ses_m".to_string(),
            role: MessageRole::User,
            content: "hello".to_string(),
            channel_type: "chat".to_string(),
            channel_id: None,
            tool_call: None,
            forward_from: None,
            edit_of: None,
            created_at: now_ts(),
        };

        assert!(repo.insert_message(&msg).await.unwrap());
        assert!(!repo.insert_message(&msg).await.unwrap());

        let messages = repo.list_messages("ses_m", 10, None).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn message_order_is_created_at_then_id() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());
        repo.create(&sample_session("ses_o", "u1", None), None)
            .await
            .unwrap();

        let ts = now_ts();
        for id in ["msg_b", "msg_a", "msg_c"] {
            let msg = Message {
                id: id.to_string(),
                session_id: "ses_o".to_string(),
                role: MessageRole::User,
                content: id.to_string(),
                channel_type: "chat".to_string(),
                channel_id: None,
                tool_call: None,
                forward_from: None,
                edit_of: None,
                created_at: ts.clone(),
            };
            repo.insert_message(&msg).await.unwrap();
        }

        let ids: Vec<String> = repo
            .list_messages("ses_o", 10, None)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["msg_a", "msg_b", "msg_c"]);
    }
}
