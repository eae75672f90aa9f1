use std::sync::{Arc, Mutex};

use relay_llm::ToolCall;
use relay_store::{StoreResult, TaskEventKind};
use serde_json::{Value, json};

/// A structured lifecycle event emitted by the agent loop.
///
/// The task manager turns these into persisted, published `TaskEvent`s; the
/// loop itself only ever emits the non-terminal kinds.
#[derive(Clone, Debug, PartialEq)]
pub struct LoopEvent {
    pub kind: TaskEventKind,
    pub data: Value,
}

impl LoopEvent {
    pub fn new(kind: TaskEventKind, data: Value) -> Self {
        Self { kind, data }
    }

    pub fn session(session_id: &str) -> Self {
        Self::new(TaskEventKind::Session, json!({ "session_id": session_id }))
    }

    pub fn delta(content: &str) -> Self {
        Self::new(TaskEventKind::Delta, json!({ "content": content }))
    }

    pub fn tool(call: &ToolCall) -> Self {
        Self::new(
            TaskEventKind::Tool,
            json!({ "id": call.id, "name": call.name, "arguments": call.arguments }),
        )
    }

    pub fn tool_start(call: &ToolCall) -> Self {
        Self::new(
            TaskEventKind::ToolStart,
            json!({ "id": call.id, "name": call.name }),
        )
    }

    pub fn tool_end(call: &ToolCall, duration_ms: u64, error: Option<&str>) -> Self {
        Self::new(
            TaskEventKind::ToolEnd,
            json!({
                "id": call.id,
                "name": call.name,
                "duration_ms": duration_ms,
                "error": error,
            }),
        )
    }

    pub fn upload_request(call_id: &str, payload: Value) -> Self {
        Self::new(
            TaskEventKind::UploadRequest,
            json!({ "id": call_id, "request": payload }),
        )
    }

    pub fn key_resource(call_id: &str, payload: Value) -> Self {
        Self::new(
            TaskEventKind::KeyResource,
            json!({ "id": call_id, "resource": payload }),
        )
    }
}

/// Callback seam between the loop and its observer.
///
/// `emit` is awaited at every call site and its error fails the run: a sink
/// that persists events must not silently drop history.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: LoopEvent) -> StoreResult<()>;
}

#[derive(Default)]
pub struct NullEventSink;

#[async_trait::async_trait]
impl EventSink for NullEventSink {
    async fn emit(&self, _event: LoopEvent) -> StoreResult<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct BufferedEventSink {
    inner: Arc<Mutex<Vec<LoopEvent>>>,
}

impl BufferedEventSink {
    pub fn snapshot(&self) -> Vec<LoopEvent> {
        self.inner.lock().expect("buffered sink mutex poisoned").clone()
    }

    pub fn kinds(&self) -> Vec<TaskEventKind> {
        self.snapshot().into_iter().map(|event| event.kind).collect()
    }
}

#[async_trait::async_trait]
impl EventSink for BufferedEventSink {
    async fn emit(&self, event: LoopEvent) -> StoreResult<()> {
        self.inner
            .lock()
            .expect("buffered sink mutex poisoned")
            .push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn buffered_sink_records_events_in_emission_order() {
        let sink = BufferedEventSink::default();
        sink.emit(LoopEvent::session("s-1"))
            .await
            .expect("emit should succeed");
        sink.emit(LoopEvent::delta("hi"))
            .await
            .expect("emit should succeed");

        assert_eq!(
            sink.kinds(),
            vec![TaskEventKind::Session, TaskEventKind::Delta]
        );
    }

    #[test]
    fn tool_end_event_carries_error_when_present() {
        let call = ToolCall {
            id: "call-1".to_string(),
            name: "run_sql".to_string(),
            arguments: "{}".to_string(),
        };
        let event = LoopEvent::tool_end(&call, 12, Some("boom"));
        assert_eq!(event.kind, TaskEventKind::ToolEnd);
        assert_eq!(event.data["error"], "boom");
        assert_eq!(event.data["duration_ms"], 12);
    }
}
