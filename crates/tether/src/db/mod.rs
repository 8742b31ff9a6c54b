//! SQLite-backed store: pool setup, migrations, restart recovery.
//!
//! All durable state (sessions, message logs, the task board, workflows and
//! their traces) lives in one SQLite file in WAL mode. Actors, the workflow
//! engine, and HTTP handlers share the pool; per-entity serialization comes
//! from actor identity, so the store only needs to keep readers unblocked
//! while single writes commit.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::ids::now_ts;
use crate::settings::DatabaseConfig;

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the store described by the settings and bring the
    /// schema up to date.
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory: {}", parent.display()))?;
        }

        let url = format!("sqlite://{}?mode=rwc", config.path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .context("parsing database URL")?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .context("connecting to database")?;

        Self::from_pool(pool).await
    }

    /// In-memory store for tests. Pinned to one connection: every new
    /// SQLite memory connection would be a fresh empty database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory database URL")?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("connecting to in-memory database")?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running database migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Boot-time sweep. Sessions that were provisioning or linked to a
    /// runner when the previous process died have no actor and no socket
    /// anymore; park them in `error` so a reconnecting runner (or the user)
    /// recovers them explicitly instead of the rows claiming liveness the
    /// process cannot back. Returns the number of sessions swept.
    pub async fn recover_interrupted_sessions(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sessions SET status = 'error', \
             error_message = 'control plane restarted while the session was live', \
             updated_at = ? \
             WHERE status IN ('starting', 'running', 'idle')",
        )
        .bind(now_ts())
        .execute(&self.pool)
        .await
        .context("sweeping interrupted sessions")?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{
        Session, SessionPurpose, SessionRepository, SessionStatus,
    };

    fn session_with_status(id: &str, status: SessionStatus) -> Session {
        let ts = now_ts();
        Session {
            id: id.to_string(),
            user_id: "u1".to_string(),
            parent_id: None,
            workspace: "svc".to_string(),
            title: "t".to_string(),
            status,
            purpose: SessionPurpose::Interactive,
            model_pref: None,
            metadata: "{}".to_string(),
            error_message: None,
            created_at: ts.clone(),
            updated_at: ts,
        }
    }

    #[tokio::test]
    async fn recovery_sweeps_only_live_statuses() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());

        for (id, status) in [
            ("ses_pending", SessionStatus::Pending),
            ("ses_starting", SessionStatus::Starting),
            ("ses_running", SessionStatus::Running),
            ("ses_idle", SessionStatus::Idle),
            ("ses_hib", SessionStatus::Hibernated),
            ("ses_done", SessionStatus::Terminated),
        ] {
            repo.create(&session_with_status(id, status), None).await.unwrap();
        }

        let swept = db.recover_interrupted_sessions().await.unwrap();
        assert_eq!(swept, 3);

        let errored = repo.get("ses_running").await.unwrap().unwrap();
        assert_eq!(errored.status, SessionStatus::Error);
        assert!(errored.error_message.unwrap().contains("restarted"));

        // Unlinked states are untouched.
        for (id, expected) in [
            ("ses_pending", SessionStatus::Pending),
            ("ses_hib", SessionStatus::Hibernated),
            ("ses_done", SessionStatus::Terminated),
        ] {
            assert_eq!(repo.get(id).await.unwrap().unwrap().status, expected);
        }

        // The sweep is idempotent: errored rows stay errored.
        assert_eq!(db.recover_interrupted_sessions().await.unwrap(), 0);
    }
}
