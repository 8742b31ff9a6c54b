//! Task board persistence: DAG edges, cycle checks, dependency cascade.

use std::collections::{HashMap, HashSet};

use anyhow::Context;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::{CoreError, CoreResult};
use crate::ids::now_ts;

use super::models::{task_transition_allowed, Task, TaskStatus};

const TASK_COLUMNS: &str = "id, orchestrator_session_id, session_id, title, description, \
     status, result, parent_task_id, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

/// Field changes applied by `update`.
#[derive(Debug, Clone, Default)]
pub struct TaskChanges {
    pub status: Option<TaskStatus>,
    pub result: Option<String>,
    pub description: Option<String>,
    pub title: Option<String>,
    pub session_id: Option<String>,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a task and its dependency edges in one transaction, rejecting
    /// edges that would make the orchestrator's dependency graph cyclic.
    pub async fn create_with_deps(&self, task: &Task, depends_on: &[String]) -> CoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning task create")
            .map_err(CoreError::Internal)?;

        // Dependencies must exist on the same board.
        let mut blockers_open = false;
        for dep_id in depends_on {
            let dep: Option<(String, String)> = sqlx::query_as(
                "SELECT orchestrator_session_id, status FROM tasks WHERE id = ?",
            )
            .bind(dep_id)
            .fetch_optional(&mut *tx)
            .await?;

            match dep {
                None => {
                    return Err(CoreError::not_found(format!("dependency task {dep_id}")))
                }
                Some((orch, status)) => {
                    if orch != task.orchestrator_session_id {
                        return Err(CoreError::validation(format!(
                            "dependency {dep_id} belongs to another orchestrator"
                        )));
                    }
                    if status != "completed" {
                        blockers_open = true;
                    }
                }
            }
        }

        let edges = load_edges(&mut tx, &task.orchestrator_session_id).await?;
        if would_create_cycle(&edges, &task.id, depends_on) {
            return Err(CoreError::validation(
                "dependency edges would create a cycle",
            ));
        }

        let status = if blockers_open { TaskStatus::Blocked } else { task.status };

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, orchestrator_session_id, session_id, title, description,
                status, result, parent_task_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.orchestrator_session_id)
        .bind(&task.session_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(status.to_string())
        .bind(&task.result)
        .bind(&task.parent_task_id)
        .bind(&task.created_at)
        .bind(&task.updated_at)
        .execute(&mut *tx)
        .await?;

        for dep_id in depends_on {
            sqlx::query("INSERT INTO task_deps (task_id, depends_on_id) VALUES (?, ?)")
                .bind(&task.id)
                .bind(dep_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit()
            .await
            .context("committing task create")
            .map_err(CoreError::Internal)?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> CoreResult<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    /// Apply changes; when the task completes, unblock dependents whose
    /// blockers have all drained, in the same transaction.
    pub async fn update(&self, id: &str, changes: TaskChanges) -> CoreResult<Task> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning task update")
            .map_err(CoreError::Internal)?;

        let current = sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("task {id}")))?;

        if let Some(next) = changes.status {
            if next != current.status && !task_transition_allowed(current.status, next) {
                return Err(CoreError::conflict(format!(
                    "invalid task transition {} -> {}",
                    current.status, next
                )));
            }
        }

        let status = changes.status.unwrap_or(current.status);
        let title = changes.title.unwrap_or(current.title);
        let description = changes.description.or(current.description);
        let result = changes.result.or(current.result);
        let session_id = changes.session_id.or(current.session_id);
        let updated_at = now_ts();

        sqlx::query(
            "UPDATE tasks SET status = ?, title = ?, description = ?, result = ?, \
             session_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(&title)
        .bind(&description)
        .bind(&result)
        .bind(&session_id)
        .bind(&updated_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if status == TaskStatus::Completed && current.status != TaskStatus::Completed {
            cascade_unblock(&mut tx, id, &updated_at).await?;
        }

        let updated = sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit()
            .await
            .context("committing task update")
            .map_err(CoreError::Internal)?;
        Ok(updated)
    }

    pub async fn list(
        &self,
        orchestrator_session_id: Option<&str>,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> CoreResult<Vec<Task>> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1");
        if orchestrator_session_id.is_some() {
            sql.push_str(" AND orchestrator_session_id = ?");
        }
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY created_at, id LIMIT ?");

        let mut query = sqlx::query_as::<_, Task>(&sql);
        if let Some(orch) = orchestrator_session_id {
            query = query.bind(orch.to_string());
        }
        if let Some(status) = status {
            query = query.bind(status.to_string());
        }
        let tasks = query.bind(limit).fetch_all(&self.pool).await?;
        Ok(tasks)
    }

    pub async fn list_for_session(
        &self,
        session_id: &str,
        status: Option<TaskStatus>,
    ) -> CoreResult<Vec<Task>> {
        let tasks = match status {
            Some(status) => {
                sqlx::query_as::<_, Task>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE session_id = ? AND status = ? ORDER BY created_at, id"
                ))
                .bind(session_id)
                .bind(status.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Task>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE session_id = ? ORDER BY created_at, id"
                ))
                .bind(session_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(tasks)
    }

    pub async fn dependencies_of(&self, task_id: &str) -> CoreResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT depends_on_id FROM task_deps WHERE task_id = ? ORDER BY depends_on_id")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

/// Unblock direct dependents of `completed_id` whose remaining blockers are
/// all completed.
async fn cascade_unblock(
    tx: &mut Transaction<'_, Sqlite>,
    completed_id: &str,
    updated_at: &str,
) -> CoreResult<()> {
    let dependents: Vec<(String,)> = sqlx::query_as(
        "SELECT d.task_id FROM task_deps d \
         JOIN tasks t ON t.id = d.task_id \
         WHERE d.depends_on_id = ? AND t.status = 'blocked'",
    )
    .bind(completed_id)
    .fetch_all(&mut **tx)
    .await?;

    for (dependent_id,) in dependents {
        let (open_blockers,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM task_deps d \
             JOIN tasks dep ON dep.id = d.depends_on_id \
             WHERE d.task_id = ? AND dep.status != 'completed'",
        )
        .bind(&dependent_id)
        .fetch_one(&mut **tx)
        .await?;

        if open_blockers == 0 {
            sqlx::query(
                "UPDATE tasks SET status = 'pending', updated_at = ? \
                 WHERE id = ? AND status = 'blocked'",
            )
            .bind(updated_at)
            .bind(&dependent_id)
            .execute(&mut **tx)
            .await?;
        }
    }

    Ok(())
}

async fn load_edges(
    tx: &mut Transaction<'_, Sqlite>,
    orchestrator_session_id: &str,
) -> CoreResult<Vec<(String, String)>> {
    let edges: Vec<(String, String)> = sqlx::query_as(
        "SELECT d.task_id, d.depends_on_id FROM task_deps d \
         JOIN tasks t ON t.id = d.task_id \
         WHERE t.orchestrator_session_id = ?",
    )
    .bind(orchestrator_session_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(edges)
}

/// DFS over the edge relation (plus the proposed edges) looking for a path
/// from any dependency back to the new task.
fn would_create_cycle(
    existing_edges: &[(String, String)],
    new_task_id: &str,
    depends_on: &[String],
) -> bool {
    if depends_on.iter().any(|dep| dep == new_task_id) {
        return true;
    }

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for (from, to) in existing_edges {
        adjacency.entry(from.as_str()).or_default().push(to.as_str());
    }
    for dep in depends_on {
        adjacency.entry(new_task_id).or_default().push(dep.as_str());
    }

    // A cycle through the new node requires reaching it again from one of
    // its dependencies.
    let mut stack: Vec<&str> = depends_on.iter().map(String::as_str).collect();
    let mut visited: HashSet<&str> = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == new_task_id {
            return true;
        }
        if !visited.insert(node) {
            continue;
        }
        if let Some(nexts) = adjacency.get(node) {
            stack.extend(nexts.iter().copied());
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_dependency_is_a_cycle() {
        assert!(would_create_cycle(&[], "t1", &["t1".to_string()]));
    }

    #[test]
    fn fresh_node_with_deps_is_acyclic() {
        let edges = vec![("t2".to_string(), "t1".to_string())];
        assert!(!would_create_cycle(&edges, "t3", &["t2".to_string()]));
    }

    #[test]
    fn path_back_to_new_node_is_a_cycle() {
        // t2 -> t3 already exists; adding t3 with dep t2 closes the loop.
        let edges = vec![("t2".to_string(), "t3".to_string())];
        assert!(would_create_cycle(&edges, "t3", &["t2".to_string()]));
    }
}
