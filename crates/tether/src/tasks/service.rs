//! Task board service.

use crate::error::{CoreError, CoreResult};
use crate::ids::{new_id, now_ts};

use super::models::{Task, TaskStatus};
use super::repository::{TaskChanges, TaskRepository};

#[derive(Debug, Clone)]
pub struct CreateTaskParams {
    pub orchestrator_session_id: String,
    pub title: String,
    pub description: Option<String>,
    pub assignee_session_id: Option<String>,
    pub parent_task_id: Option<String>,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub result: Option<String>,
    pub description: Option<String>,
    pub title: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilters {
    pub orchestrator_session_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub limit: Option<i64>,
}

#[derive(Clone)]
pub struct TaskService {
    repo: TaskRepository,
}

impl TaskService {
    pub fn new(repo: TaskRepository) -> Self {
        Self { repo }
    }

    pub async fn create(&self, params: CreateTaskParams) -> CoreResult<Task> {
        if params.title.trim().is_empty() {
            return Err(CoreError::validation("title must not be empty"));
        }

        let ts = now_ts();
        let task = Task {
            id: new_id("tsk"),
            orchestrator_session_id: params.orchestrator_session_id,
            session_id: params.assignee_session_id,
            title: params.title,
            description: params.description,
            status: TaskStatus::Pending,
            result: None,
            parent_task_id: params.parent_task_id,
            created_at: ts.clone(),
            updated_at: ts,
        };

        self.repo.create_with_deps(&task, &params.depends_on).await?;

        // The repository may have downgraded the initial status to blocked.
        self.repo
            .get(&task.id)
            .await?
            .ok_or_else(|| CoreError::internal("created task vanished"))
    }

    pub async fn update(&self, id: &str, update: TaskUpdate) -> CoreResult<Task> {
        self.repo
            .update(
                id,
                TaskChanges {
                    status: update.status,
                    result: update.result,
                    description: update.description,
                    title: update.title,
                    session_id: update.session_id,
                },
            )
            .await
    }

    pub async fn get(&self, id: &str) -> CoreResult<Task> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("task {id}")))
    }

    pub async fn list(&self, filters: TaskFilters) -> CoreResult<Vec<Task>> {
        let limit = filters.limit.unwrap_or(100).clamp(1, 500);
        self.repo
            .list(
                filters.orchestrator_session_id.as_deref(),
                filters.status,
                limit,
            )
            .await
    }

    pub async fn list_for_session(
        &self,
        session_id: &str,
        status: Option<TaskStatus>,
    ) -> CoreResult<Vec<Task>> {
        self.repo.list_for_session(session_id, status).await
    }

    pub async fn dependencies_of(&self, task_id: &str) -> CoreResult<Vec<String>> {
        self.repo.dependencies_of(task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::ids::now_ts;
    use crate::session::{Session, SessionPurpose, SessionRepository, SessionStatus};

    async fn board() -> (TaskService, String) {
        let db = Database::in_memory().await.unwrap();

        // Tasks reference their orchestrator session.
        let sessions = SessionRepository::new(db.pool().clone());
        let ts = now_ts();
        let orch = Session {
            id: "ses_orch".to_string(),
            user_id: "u1".to_string(),
            parent_id: None,
            workspace: "orch".to_string(),
            title: "orchestrator".to_string(),
            status: SessionStatus::Pending,
            purpose: SessionPurpose::Orchestrator,
            model_pref: None,
            metadata: "{}".to_string(),
            error_message: None,
            created_at: ts.clone(),
            updated_at: ts,
        };
        sessions.create(&orch, None).await.unwrap();

        (
            TaskService::new(TaskRepository::new(db.pool().clone())),
            orch.id,
        )
    }

    fn params(orch: &str, title: &str, deps: Vec<String>) -> CreateTaskParams {
        CreateTaskParams {
            orchestrator_session_id: orch.to_string(),
            title: title.to_string(),
            description: None,
            assignee_session_id: None,
            parent_task_id: None,
            depends_on: deps,
        }
    }

    #[tokio::test]
    async fn dependency_cascade_unblocks_in_order() {
        let (service, orch) = board().await;

        let a = service.create(params(&orch, "A", vec![])).await.unwrap();
        let b = service
            .create(params(&orch, "B", vec![a.id.clone()]))
            .await
            .unwrap();
        let c = service
            .create(params(&orch, "C", vec![b.id.clone()]))
            .await
            .unwrap();

        assert_eq!(a.status, TaskStatus::Pending);
        assert_eq!(b.status, TaskStatus::Blocked);
        assert_eq!(c.status, TaskStatus::Blocked);

        // Completing A unblocks B in the same commit; C stays blocked.
        service
            .update(&a.id, TaskUpdate { status: Some(TaskStatus::Completed), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(service.get(&b.id).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(service.get(&c.id).await.unwrap().status, TaskStatus::Blocked);

        // Completing B cascades to C.
        service
            .update(&b.id, TaskUpdate { status: Some(TaskStatus::Completed), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(service.get(&c.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn multi_blocker_task_waits_for_all() {
        let (service, orch) = board().await;

        let a = service.create(params(&orch, "A", vec![])).await.unwrap();
        let b = service.create(params(&orch, "B", vec![])).await.unwrap();
        let c = service
            .create(params(&orch, "C", vec![a.id.clone(), b.id.clone()]))
            .await
            .unwrap();
        assert_eq!(c.status, TaskStatus::Blocked);

        service
            .update(&a.id, TaskUpdate { status: Some(TaskStatus::Completed), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(service.get(&c.id).await.unwrap().status, TaskStatus::Blocked);

        service
            .update(&b.id, TaskUpdate { status: Some(TaskStatus::Completed), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(service.get(&c.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn completed_to_pending_is_rejected() {
        let (service, orch) = board().await;
        let task = service.create(params(&orch, "done", vec![])).await.unwrap();

        service
            .update(
                &task.id,
                TaskUpdate { status: Some(TaskStatus::Completed), ..Default::default() },
            )
            .await
            .unwrap();

        let err = service
            .update(
                &task.id,
                TaskUpdate { status: Some(TaskStatus::Pending), ..Default::default() },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected() {
        let (service, orch) = board().await;
        let err = service
            .create(params(&orch, "task", vec!["tsk_ghost".to_string()]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn completed_dependency_does_not_block() {
        let (service, orch) = board().await;
        let a = service.create(params(&orch, "A", vec![])).await.unwrap();
        service
            .update(&a.id, TaskUpdate { status: Some(TaskStatus::Completed), ..Default::default() })
            .await
            .unwrap();

        let b = service.create(params(&orch, "B", vec![a.id])).await.unwrap();
        assert_eq!(b.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn result_text_survives_completion() {
        let (service, orch) = board().await;
        let task = service.create(params(&orch, "handoff", vec![])).await.unwrap();

        let updated = service
            .update(
                &task.id,
                TaskUpdate {
                    status: Some(TaskStatus::Completed),
                    result: Some("branch pushed: fix/login".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.result.as_deref(), Some("branch pushed: fix/login"));
    }
}
