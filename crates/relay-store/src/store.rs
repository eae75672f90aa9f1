use relay_llm::Message;
use serde_json::Value;

use crate::types::{Session, Task, TaskEvent, TaskEventKind, TaskUpdate};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource not found: {resource} ({id})")]
    NotFound { resource: &'static str, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence boundary consumed by the agent loop and the task manager.
///
/// Implementations must allocate `TaskEvent` ids strictly increasing per
/// task; the subscription protocol relies on that ordering for replay and
/// deduplication.
#[async_trait::async_trait]
pub trait ChatStore: Send + Sync {
    /// Returns the session with `id` when given, creating it if missing;
    /// with no id a fresh session is created.
    async fn get_or_create_session(
        &self,
        id: Option<&str>,
        user: Option<&str>,
    ) -> StoreResult<Session>;

    async fn list_messages(&self, session_id: &str) -> StoreResult<Vec<Message>>;

    async fn push_messages(&self, session_id: &str, messages: &[Message]) -> StoreResult<()>;

    async fn create_task(
        &self,
        session_id: &str,
        input: &str,
        images: &[String],
    ) -> StoreResult<Task>;

    async fn update_task(&self, task_id: &str, update: TaskUpdate) -> StoreResult<Task>;

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>>;

    async fn create_task_event(
        &self,
        task_id: &str,
        kind: TaskEventKind,
        data: Value,
    ) -> StoreResult<TaskEvent>;

    /// Events with id strictly greater than `after_id` (all events when
    /// `None`), ascending.
    async fn list_task_events_since(
        &self,
        task_id: &str,
        after_id: Option<i64>,
    ) -> StoreResult<Vec<TaskEvent>>;
}
