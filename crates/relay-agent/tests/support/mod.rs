#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use relay_agent::{RegisteredTool, StaticToolRegistry, ToolExecutor, ToolOutput};
use relay_llm::{
    CancelToken, ChatClient, ClientError, Completion, CompletionStream, Request, StreamAccumulator,
    StreamEvent, ToolCallFragment, ToolSchema,
};
use serde_json::{Value, json};

/// One scripted stream element. `CancelRun` trips the run's cancel token and
/// then lets the stream end, modelling a disconnect observed right after the
/// streaming call returns.
#[derive(Clone, Debug)]
pub enum ScriptAction {
    Delta(String),
    Fragment(ToolCallFragment),
    Finish,
    CancelRun,
}

pub fn delta(text: &str) -> ScriptAction {
    ScriptAction::Delta(text.to_string())
}

pub fn fragment(index: usize, id: Option<&str>, name: Option<&str>, args: &str) -> ScriptAction {
    ScriptAction::Fragment(ToolCallFragment {
        index,
        id: id.map(str::to_string),
        name: name.map(str::to_string),
        arguments: args.to_string(),
    })
}

pub fn tool_call_script(id: &str, name: &str, args: &str) -> Vec<ScriptAction> {
    vec![fragment(0, Some(id), Some(name), args), ScriptAction::Finish]
}

pub fn text_script(text: &str) -> Vec<ScriptAction> {
    vec![delta(text), ScriptAction::Finish]
}

/// Chat client that replays queued scripts, one per model round.
pub struct ScriptClient {
    scripts: Mutex<VecDeque<Vec<ScriptAction>>>,
    pub requests: Mutex<Vec<Request>>,
    pub delay_ms: u64,
}

impl ScriptClient {
    pub fn new(scripts: Vec<Vec<ScriptAction>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::from(scripts)),
            requests: Mutex::new(Vec::new()),
            delay_ms: 0,
        })
    }

    pub fn with_delay(scripts: Vec<Vec<ScriptAction>>, delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::from(scripts)),
            requests: Mutex::new(Vec::new()),
            delay_ms,
        })
    }

    pub fn recorded_requests(&self) -> Vec<Request> {
        self.requests.lock().expect("requests mutex").clone()
    }

    fn next_script(&self) -> Result<Vec<ScriptAction>, ClientError> {
        self.scripts
            .lock()
            .expect("scripts mutex")
            .pop_front()
            .ok_or_else(|| ClientError::Configuration("no script queued".to_string()))
    }
}

#[async_trait]
impl ChatClient for ScriptClient {
    fn name(&self) -> &str {
        "script"
    }

    async fn complete(&self, request: Request) -> Result<Completion, ClientError> {
        let stream = self.stream_complete(request, &CancelToken::new()).await?;
        let mut accumulator = StreamAccumulator::new();
        let mut stream = stream;
        use futures::StreamExt;
        while let Some(event) = stream.next().await {
            accumulator.push(&event?);
        }
        Ok(accumulator.finish())
    }

    async fn stream_complete(
        &self,
        request: Request,
        cancel: &CancelToken,
    ) -> Result<CompletionStream, ClientError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        self.requests.lock().expect("requests mutex").push(request);

        let actions = VecDeque::from(self.next_script()?);
        let cancel = cancel.clone();
        let stream: CompletionStream = Box::pin(futures::stream::unfold(
            (actions, cancel),
            |(mut actions, cancel)| async move {
                loop {
                    match actions.pop_front() {
                        None => return None,
                        Some(ScriptAction::CancelRun) => {
                            cancel.cancel();
                            continue;
                        }
                        Some(ScriptAction::Delta(text)) => {
                            return Some((Ok(StreamEvent::TextDelta(text)), (actions, cancel)));
                        }
                        Some(ScriptAction::Fragment(fragment)) => {
                            return Some((
                                Ok(StreamEvent::ToolCallDelta(fragment)),
                                (actions, cancel),
                            ));
                        }
                        Some(ScriptAction::Finish) => {
                            return Some((
                                Ok(StreamEvent::Finish { usage: None }),
                                (actions, cancel),
                            ));
                        }
                    }
                }
            },
        ));
        Ok(stream)
    }
}

pub fn echo_schema(name: &str) -> ToolSchema {
    ToolSchema {
        name: name.to_string(),
        description: "test tool".to_string(),
        parameters: json!({
            "type": "object",
            "properties": { "value": { "type": "string" } }
        }),
    }
}

/// Registry whose tools record their invocations into a shared log.
pub fn recording_registry(
    names: &[&str],
    log: Arc<Mutex<Vec<(String, Value)>>>,
) -> Arc<StaticToolRegistry> {
    let mut registry = StaticToolRegistry::new();
    for name in names {
        let log = log.clone();
        let tool_name = (*name).to_string();
        let reply = format!("ok-{name}");
        let executor: ToolExecutor = Arc::new(move |args| {
            let log = log.clone();
            let tool_name = tool_name.clone();
            let reply = reply.clone();
            Box::pin(async move {
                log.lock().expect("tool log mutex").push((tool_name, args));
                Ok(ToolOutput::text(reply))
            })
        });
        registry.register(RegisteredTool {
            schema: echo_schema(name),
            executor,
        });
    }
    Arc::new(registry)
}
