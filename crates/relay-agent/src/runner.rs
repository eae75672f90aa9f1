//! The tool-use loop state machine.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use relay_llm::{
    CancelToken, ChatClient, Completion, Message, Request, Role, StreamAccumulator, StreamEvent,
    ToolCall,
};
use relay_store::ChatStore;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::LoopConfig;
use crate::errors::AgentError;
use crate::events::{EventSink, LoopEvent};
use crate::eviction::{ToolCallTracker, compress_messages};
use crate::lock::SessionLocks;
use crate::prompt::PromptBuilder;
use crate::tools::ToolRegistry;

/// Input for one agent-loop run.
#[derive(Clone, Debug)]
pub struct LoopInput {
    pub session_id: String,
    pub message: String,
    pub images: Vec<String>,
}

/// Outcome of a finished run. `messages` holds the turns this run appended
/// to the session, all of which have been flushed to the store.
#[derive(Clone, Debug, PartialEq)]
pub struct LoopRun {
    pub session_id: String,
    pub reply: String,
    pub messages: Vec<Message>,
    pub cancelled: bool,
}

enum LoopState {
    AwaitingModel,
    ExecutingTools(Completion),
    Done(String),
    Cancelled(String),
}

struct RunState {
    history: Vec<Message>,
    buffer: Vec<Message>,
    flushed: usize,
}

/// Orchestrates model calls and tool execution for one session at a time.
///
/// Interior loop state (the tracker, the compressed-context recomputation)
/// is per run; the session lock guarantees runs for one session never
/// interleave.
pub struct AgentLoop {
    store: Arc<dyn ChatStore>,
    client: Arc<dyn ChatClient>,
    tools: Arc<dyn ToolRegistry>,
    prompt: Arc<dyn PromptBuilder>,
    locks: SessionLocks,
    config: LoopConfig,
}

impl AgentLoop {
    pub fn new(
        store: Arc<dyn ChatStore>,
        client: Arc<dyn ChatClient>,
        tools: Arc<dyn ToolRegistry>,
        prompt: Arc<dyn PromptBuilder>,
        config: LoopConfig,
    ) -> Self {
        Self {
            store,
            client,
            tools,
            prompt,
            locks: SessionLocks::new(),
            config,
        }
    }

    pub async fn run(
        &self,
        input: LoopInput,
        sink: Arc<dyn EventSink>,
        cancel: CancelToken,
    ) -> Result<LoopRun, AgentError> {
        let session_id = input.session_id.clone();
        self.locks
            .run_exclusive(&session_id, self.run_locked(input, sink, cancel))
            .await
    }

    async fn run_locked(
        &self,
        input: LoopInput,
        sink: Arc<dyn EventSink>,
        cancel: CancelToken,
    ) -> Result<LoopRun, AgentError> {
        let session_id = input.session_id;
        let history = self.store.list_messages(&session_id).await?;
        let mut tracker =
            ToolCallTracker::scan_messages(self.config.eviction.clone(), &history);

        info!(
            session_id = %session_id,
            history_len = history.len(),
            "agent loop run starting"
        );
        sink.emit(LoopEvent::session(&session_id)).await?;

        let user_message = if input.images.is_empty() {
            Message::user(input.message)
        } else {
            Message::user_with_images(input.message, input.images)
        };
        let mut run = RunState {
            history,
            buffer: vec![user_message],
            flushed: 0,
        };

        let mut rounds = 0usize;
        let mut state = LoopState::AwaitingModel;
        loop {
            state = match state {
                LoopState::AwaitingModel => {
                    if cancel.is_cancelled() {
                        LoopState::Cancelled(String::new())
                    } else if rounds >= self.config.max_rounds {
                        return Err(AgentError::RoundLimit(rounds));
                    } else {
                        rounds += 1;
                        self.await_model(&mut run, &mut tracker, &sink, &cancel).await?
                    }
                }
                LoopState::ExecutingTools(completion) => {
                    self.execute_tools(&session_id, completion, &mut run, &mut tracker, &sink)
                        .await?
                }
                LoopState::Done(reply) => {
                    self.flush(&session_id, &mut run).await?;
                    info!(session_id = %session_id, rounds, "agent loop run completed");
                    return Ok(LoopRun {
                        session_id,
                        reply,
                        messages: run.buffer,
                        cancelled: false,
                    });
                }
                LoopState::Cancelled(partial) => {
                    strip_dangling_tool_calls(&mut run.buffer[run.flushed..]);
                    run.buffer.push(Message::assistant(partial.clone()));
                    self.flush(&session_id, &mut run).await?;
                    info!(session_id = %session_id, rounds, "agent loop run cancelled");
                    return Ok(LoopRun {
                        session_id,
                        reply: partial,
                        messages: run.buffer,
                        cancelled: true,
                    });
                }
            };
        }
    }

    async fn await_model(
        &self,
        run: &mut RunState,
        tracker: &mut ToolCallTracker,
        sink: &Arc<dyn EventSink>,
        cancel: &CancelToken,
    ) -> Result<LoopState, AgentError> {
        tracker.advance_round();

        let tools = self
            .tools
            .list_tools()
            .await
            .map_err(AgentError::ToolCatalog)?;

        // system prompt is rebuilt every round so the tool catalog stays fresh
        let mut messages = Vec::with_capacity(run.history.len() + run.buffer.len() + 1);
        messages.push(Message::system(self.prompt.build_system_prompt(&tools)));
        let mut conversation = run.history.clone();
        conversation.extend(run.buffer.iter().cloned());
        messages.extend(compress_messages(&conversation, tracker));

        debug!(round = tracker.round(), messages = messages.len(), "calling model");
        let request = Request {
            model: self.config.model.clone(),
            messages,
            tools,
        };

        let mut stream = self.client.stream_complete(request, cancel).await?;
        let mut accumulator = StreamAccumulator::new();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(LoopState::Cancelled(accumulator.text().to_string()));
                }
                event = stream.next() => event,
            };
            match event {
                None => break,
                Some(Err(error)) => return Err(error.into()),
                Some(Ok(event)) => {
                    if let StreamEvent::TextDelta(delta) = &event {
                        sink.emit(LoopEvent::delta(delta)).await?;
                    }
                    accumulator.push(&event);
                }
            }
        }
        if cancel.is_cancelled() {
            return Ok(LoopState::Cancelled(accumulator.text().to_string()));
        }

        let completion = accumulator.finish();
        if completion.tool_calls().is_empty() {
            let reply = completion.text().to_string();
            run.buffer.push(completion.message);
            Ok(LoopState::Done(reply))
        } else {
            Ok(LoopState::ExecutingTools(completion))
        }
    }

    async fn execute_tools(
        &self,
        session_id: &str,
        completion: Completion,
        run: &mut RunState,
        tracker: &mut ToolCallTracker,
        sink: &Arc<dyn EventSink>,
    ) -> Result<LoopState, AgentError> {
        debug!(count = completion.tool_calls().len(), "executing tool round");
        run.buffer.push(completion.message.clone());

        // tool calls run strictly in model order: later calls may depend on
        // earlier results
        for call in completion.tool_calls() {
            sink.emit(LoopEvent::tool(call)).await?;
            sink.emit(LoopEvent::tool_start(call)).await?;

            let arguments = parse_arguments(call);
            let started = Instant::now();
            let outcome = self.tools.call_tool(&call.name, arguments).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Err(error) => {
                    let message = error.to_string();
                    sink.emit(LoopEvent::tool_end(call, duration_ms, Some(&message)))
                        .await?;
                    return Err(AgentError::Tool {
                        name: call.name.clone(),
                        source: error,
                    });
                }
                Ok(output) => {
                    sink.emit(LoopEvent::tool_end(call, duration_ms, None)).await?;
                    if let Some(payload) = &output.upload_request {
                        sink.emit(LoopEvent::upload_request(&call.id, payload.clone()))
                            .await?;
                    }
                    if let Some(payload) = &output.key_resource {
                        sink.emit(LoopEvent::key_resource(&call.id, payload.clone()))
                            .await?;
                    }

                    let text = output.flattened_text();
                    tracker.register(&call.id, &call.name, &call.arguments, &text);
                    run.buffer.push(Message::tool(call.id.clone(), text));
                }
            }
        }

        // flush after each full round so external recall of in-flight data
        // works mid-run
        self.flush(session_id, run).await?;
        Ok(LoopState::AwaitingModel)
    }

    async fn flush(&self, session_id: &str, run: &mut RunState) -> Result<(), AgentError> {
        if run.flushed < run.buffer.len() {
            self.store
                .push_messages(session_id, &run.buffer[run.flushed..])
                .await?;
            run.flushed = run.buffer.len();
        }
        Ok(())
    }
}

/// Malformed argument JSON degrades to an empty object; the run continues.
fn parse_arguments(call: &ToolCall) -> Value {
    match serde_json::from_str::<Value>(&call.arguments) {
        Ok(value) if value.is_object() => value,
        _ => {
            warn!(tool = %call.name, "malformed tool arguments; treating as empty");
            Value::Object(Map::new())
        }
    }
}

/// A resumed run must never see a tool call it cannot answer: any unflushed
/// assistant message whose calls have no matching results loses those calls.
fn strip_dangling_tool_calls(unflushed: &mut [Message]) {
    let answered: HashSet<String> = unflushed
        .iter()
        .filter_map(|message| message.tool_call_id.clone())
        .collect();

    for message in unflushed {
        if message.role == Role::Assistant && !message.tool_calls.is_empty() {
            message.tool_calls.retain(|call| answered.contains(&call.id));
            if message.tool_calls.is_empty() && message.content.is_none() {
                message.content = Some(String::new());
            }
        }
    }
}
