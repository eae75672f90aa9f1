use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use relay_llm::Message;
use serde_json::Value;
use uuid::Uuid;

use crate::store::{ChatStore, StoreError, StoreResult};
use crate::types::{Session, Task, TaskEvent, TaskEventKind, TaskStatus, TaskUpdate};

#[derive(Debug, Default)]
struct MemoryState {
    sessions: BTreeMap<String, Session>,
    messages: BTreeMap<String, Vec<Message>>,
    tasks: BTreeMap<String, Task>,
    events: BTreeMap<String, Vec<TaskEvent>>,
}

/// In-memory `ChatStore` for tests and single-process deployments.
#[derive(Clone, Debug, Default)]
pub struct MemoryChatStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store mutex poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl ChatStore for MemoryChatStore {
    async fn get_or_create_session(
        &self,
        id: Option<&str>,
        user: Option<&str>,
    ) -> StoreResult<Session> {
        let mut state = self.lock()?;

        if let Some(id) = id {
            if let Some(existing) = state.sessions.get(id) {
                return Ok(existing.clone());
            }
        }

        let session = Session {
            id: id
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            user: user.map(str::to_string),
            created_at: Utc::now(),
        };
        state
            .sessions
            .insert(session.id.clone(), session.clone());
        state.messages.entry(session.id.clone()).or_default();
        Ok(session)
    }

    async fn list_messages(&self, session_id: &str) -> StoreResult<Vec<Message>> {
        let state = self.lock()?;
        state
            .messages
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                resource: "session",
                id: session_id.to_string(),
            })
    }

    async fn push_messages(&self, session_id: &str, messages: &[Message]) -> StoreResult<()> {
        let mut state = self.lock()?;
        let Some(stored) = state.messages.get_mut(session_id) else {
            return Err(StoreError::NotFound {
                resource: "session",
                id: session_id.to_string(),
            });
        };
        stored.extend_from_slice(messages);
        Ok(())
    }

    async fn create_task(
        &self,
        session_id: &str,
        input: &str,
        images: &[String],
    ) -> StoreResult<Task> {
        let mut state = self.lock()?;
        if !state.sessions.contains_key(session_id) {
            return Err(StoreError::NotFound {
                resource: "session",
                id: session_id.to_string(),
            });
        }

        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            status: TaskStatus::Pending,
            input: input.to_string(),
            images: images.to_vec(),
            reply: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        state.tasks.insert(task.id.clone(), task.clone());
        state.events.entry(task.id.clone()).or_default();
        Ok(task)
    }

    async fn update_task(&self, task_id: &str, update: TaskUpdate) -> StoreResult<Task> {
        let mut state = self.lock()?;
        let Some(task) = state.tasks.get_mut(task_id) else {
            return Err(StoreError::NotFound {
                resource: "task",
                id: task_id.to_string(),
            });
        };

        if let Some(status) = update.status {
            task.status = status;
        }
        if let Some(reply) = update.reply {
            task.reply = Some(reply);
        }
        if let Some(error) = update.error {
            task.error = Some(error);
        }
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
        let state = self.lock()?;
        Ok(state.tasks.get(task_id).cloned())
    }

    async fn create_task_event(
        &self,
        task_id: &str,
        kind: TaskEventKind,
        data: Value,
    ) -> StoreResult<TaskEvent> {
        let mut state = self.lock()?;
        let Some(events) = state.events.get_mut(task_id) else {
            return Err(StoreError::NotFound {
                resource: "task",
                id: task_id.to_string(),
            });
        };

        let event = TaskEvent {
            id: events.len() as i64 + 1,
            task_id: task_id.to_string(),
            kind,
            data,
            created_at: Utc::now(),
        };
        events.push(event.clone());
        Ok(event)
    }

    async fn list_task_events_since(
        &self,
        task_id: &str,
        after_id: Option<i64>,
    ) -> StoreResult<Vec<TaskEvent>> {
        let state = self.lock()?;
        let Some(events) = state.events.get(task_id) else {
            return Err(StoreError::NotFound {
                resource: "task",
                id: task_id.to_string(),
            });
        };

        let floor = after_id.unwrap_or(0);
        Ok(events
            .iter()
            .filter(|event| event.id > floor)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store_with_task() -> (MemoryChatStore, Task) {
        let store = MemoryChatStore::new();
        let session = store
            .get_or_create_session(None, None)
            .await
            .expect("session should be created");
        let task = store
            .create_task(&session.id, "hello", &[])
            .await
            .expect("task should be created");
        (store, task)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn get_or_create_session_reuses_existing_id() {
        let store = MemoryChatStore::new();
        let first = store
            .get_or_create_session(Some("s-1"), Some("ada"))
            .await
            .expect("session should be created");
        let second = store
            .get_or_create_session(Some("s-1"), None)
            .await
            .expect("session should be returned");

        assert_eq!(first, second);
        assert_eq!(second.user.as_deref(), Some("ada"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn event_ids_increase_per_task_and_since_filters() {
        let (store, task) = store_with_task().await;

        for _ in 0..3 {
            store
                .create_task_event(&task.id, TaskEventKind::Delta, json!({}))
                .await
                .expect("event should append");
        }

        let all = store
            .list_task_events_since(&task.id, None)
            .await
            .expect("events should list");
        assert_eq!(all.iter().map(|event| event.id).collect::<Vec<_>>(), vec![1, 2, 3]);

        let tail = store
            .list_task_events_since(&task.id, Some(2))
            .await
            .expect("events should list");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn update_task_merges_fields() {
        let (store, task) = store_with_task().await;

        let updated = store
            .update_task(&task.id, TaskUpdate::completed("done"))
            .await
            .expect("task should update");
        assert_eq!(updated.status, TaskStatus::Completed);
        assert_eq!(updated.reply.as_deref(), Some("done"));
        assert_eq!(updated.error, None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn push_messages_to_unknown_session_expected_not_found() {
        let store = MemoryChatStore::new();
        let error = store
            .push_messages("missing", &[Message::user("hi")])
            .await
            .expect_err("push should fail");
        assert!(matches!(error, StoreError::NotFound { resource: "session", .. }));
    }
}
