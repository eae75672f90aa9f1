use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use relay_agent::{AgentLoop, EventSink, LoopEvent, LoopInput};
use relay_llm::CancelToken;
use relay_store::{
    ChatStore, StoreResult, Task, TaskEvent, TaskEventKind, TaskStatus, TaskUpdate,
};
use serde_json::{Value, json};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::bus::TaskEventBus;
use crate::errors::TaskError;
use crate::subscribe::TaskSubscription;

/// Fixed message carried by the cancellation error event.
pub const CANCEL_MESSAGE: &str = "Task cancelled";

#[derive(Clone, Debug, Default)]
pub struct TaskInput {
    pub message: String,
    pub session_id: Option<String>,
    pub user: Option<String>,
    pub images: Vec<String>,
}

impl TaskInput {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub task_id: String,
    pub session_id: String,
}

struct ManagerInner {
    store: Arc<dyn ChatStore>,
    agent: AgentLoop,
    bus: Arc<TaskEventBus>,
    cancellations: Mutex<HashMap<String, CancelToken>>,
}

/// Gives every agent-loop run a stable identity, a status, and a durable,
/// replayable event feed.
///
/// All mutable registries (cancellation tokens, bus channels) live on this
/// instance; constructing two managers yields fully isolated runtimes.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl TaskManager {
    pub fn new(store: Arc<dyn ChatStore>, agent: AgentLoop) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                agent,
                bus: Arc::new(TaskEventBus::new()),
                cancellations: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates the task and schedules execution; returns without waiting.
    pub async fn submit(&self, input: TaskInput) -> Result<SubmitReceipt, TaskError> {
        let session = self
            .inner
            .store
            .get_or_create_session(input.session_id.as_deref(), input.user.as_deref())
            .await?;
        let task = self
            .inner
            .store
            .create_task(&session.id, &input.message, &input.images)
            .await?;
        info!(task_id = %task.id, session_id = %session.id, "task submitted");

        let inner = self.inner.clone();
        let task_id = task.id.clone();
        tokio::spawn(async move { inner.execute(&task_id).await });

        Ok(SubmitReceipt {
            task_id: task.id,
            session_id: session.id,
        })
    }

    pub async fn get_status(&self, task_id: &str) -> Result<Option<Task>, TaskError> {
        Ok(self.inner.store.get_task(task_id).await?)
    }

    /// Cancels a live run via its token, or settles a pending/running row
    /// whose token is gone (e.g. after a restart). Returns `false` when the
    /// task already finished.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, TaskError> {
        let token = {
            self.inner
                .cancellations
                .lock()
                .expect("cancellation registry poisoned")
                .get(task_id)
                .cloned()
        };
        if let Some(token) = token {
            info!(task_id, "cancelling running task");
            token.cancel();
            return Ok(true);
        }

        match self.inner.store.get_task(task_id).await? {
            Some(task) if !task.status.is_terminal() => {
                info!(task_id, "cancelling task without a live run");
                self.inner
                    .append_event(task_id, TaskEventKind::Error, json!({ "message": CANCEL_MESSAGE }))
                    .await?;
                self.inner
                    .store
                    .update_task(task_id, TaskUpdate::status(TaskStatus::Cancelled))
                    .await?;
                self.inner.bus.end(task_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Opens an event subscription: replay of persisted events with id
    /// greater than `last_event_id`, then live delivery to end-of-stream.
    pub async fn subscribe(
        &self,
        task_id: &str,
        last_event_id: Option<i64>,
    ) -> Result<TaskSubscription, TaskError> {
        // the live listener attaches before the replay read so events
        // appended during the read are buffered, not lost
        let (subscriber_id, live) = self.inner.bus.attach(task_id);

        let prepared: Result<(Vec<TaskEvent>, bool), TaskError> = async {
            let replay = self
                .inner
                .store
                .list_task_events_since(task_id, last_event_id)
                .await?;
            let task = self
                .inner
                .store
                .get_task(task_id)
                .await?
                .ok_or_else(|| TaskError::UnknownTask(task_id.to_string()))?;
            Ok((replay, task.status.is_terminal()))
        }
        .await;

        match prepared {
            Ok((replay, terminal)) => Ok(TaskSubscription::new(
                self.inner.bus.clone(),
                task_id.to_string(),
                subscriber_id,
                replay,
                live,
                last_event_id.unwrap_or(0),
                terminal,
            )),
            Err(error) => {
                self.inner.bus.detach(task_id, subscriber_id);
                Err(error)
            }
        }
    }
}

impl ManagerInner {
    async fn execute(&self, task_id: &str) {
        let token = CancelToken::new();
        self.cancellations
            .lock()
            .expect("cancellation registry poisoned")
            .insert(task_id.to_string(), token.clone());

        let result = self.run_task(task_id, token).await;

        self.cancellations
            .lock()
            .expect("cancellation registry poisoned")
            .remove(task_id);
        self.bus.end(task_id);

        if let Err(error) = result {
            warn!(task_id, error = %error, "task execution could not be settled");
        }
    }

    async fn run_task(&self, task_id: &str, token: CancelToken) -> Result<(), TaskError> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Err(TaskError::UnknownTask(task_id.to_string()));
        };
        if task.status.is_terminal() {
            // cancelled in the gap between submit and execution start
            return Ok(());
        }

        self.store
            .update_task(task_id, TaskUpdate::status(TaskStatus::Running))
            .await?;

        let sink = Arc::new(TaskEventSink {
            store: self.store.clone(),
            bus: self.bus.clone(),
            task_id: task_id.to_string(),
            gate: AsyncMutex::new(()),
        });

        let outcome = self
            .agent
            .run(
                LoopInput {
                    session_id: task.session_id.clone(),
                    message: task.input.clone(),
                    images: task.images.clone(),
                },
                sink.clone(),
                token,
            )
            .await;

        // the terminal event is appended before the status flips, so an
        // observer that reads a terminal status always finds the event
        // persisted or already buffered on its live channel
        match outcome {
            Ok(run) if run.cancelled => {
                info!(task_id, "task cancelled");
                sink.append(TaskEventKind::Error, json!({ "message": CANCEL_MESSAGE }))
                    .await?;
                self.store
                    .update_task(task_id, TaskUpdate::status(TaskStatus::Cancelled))
                    .await?;
            }
            Ok(run) => {
                info!(task_id, "task completed");
                sink.append(TaskEventKind::Done, json!({ "reply": run.reply.clone() }))
                    .await?;
                self.store
                    .update_task(task_id, TaskUpdate::completed(run.reply))
                    .await?;
            }
            Err(error) => {
                let message = error.to_string();
                warn!(task_id, error = %message, "task failed");
                sink.append(TaskEventKind::Error, json!({ "message": message.clone() }))
                    .await?;
                self.store
                    .update_task(task_id, TaskUpdate::failed(message))
                    .await?;
            }
        }
        Ok(())
    }

    async fn append_event(
        &self,
        task_id: &str,
        kind: TaskEventKind,
        data: Value,
    ) -> Result<TaskEvent, TaskError> {
        let event = self.store.create_task_event(task_id, kind, data).await?;
        self.bus.publish(task_id, event.clone());
        Ok(event)
    }
}

/// Store-backed sink: every loop event is persisted, then published, in
/// emission order.
struct TaskEventSink {
    store: Arc<dyn ChatStore>,
    bus: Arc<TaskEventBus>,
    task_id: String,
    gate: AsyncMutex<()>,
}

impl TaskEventSink {
    async fn append(&self, kind: TaskEventKind, data: Value) -> StoreResult<TaskEvent> {
        // append and publish under one gate so bus order matches id order
        // even if emitters ever overlap
        let _gate = self.gate.lock().await;
        let event = self.store.create_task_event(&self.task_id, kind, data).await?;
        self.bus.publish(&self.task_id, event.clone());
        Ok(event)
    }
}

#[async_trait::async_trait]
impl EventSink for TaskEventSink {
    async fn emit(&self, event: LoopEvent) -> StoreResult<()> {
        self.append(event.kind, event.data).await.map(drop)
    }
}
