//! Task board: a shared DAG of work items rooted at an orchestrator session.

mod models;
mod repository;
mod service;

pub use models::{task_transition_allowed, Task, TaskStatus};
pub use repository::TaskRepository;
pub use service::{CreateTaskParams, TaskFilters, TaskService, TaskUpdate};
