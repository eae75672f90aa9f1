#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use relay_agent::{
    AgentLoop, LoopConfig, RegisteredTool, StaticPromptBuilder, StaticToolRegistry, ToolError,
    ToolExecutor, ToolRegistry,
};
use relay_llm::{
    CancelToken, ChatClient, ClientError, Completion, CompletionStream, Request, StreamAccumulator,
    StreamEvent, ToolCallFragment, ToolSchema,
};
use relay_store::MemoryChatStore;
use relay_tasks::TaskManager;
use serde_json::json;

#[derive(Clone, Debug)]
pub enum ScriptAction {
    Delta(String),
    Fragment(ToolCallFragment),
    Finish,
}

pub fn delta(text: &str) -> ScriptAction {
    ScriptAction::Delta(text.to_string())
}

pub fn text_script(text: &str) -> Vec<ScriptAction> {
    vec![delta(text), ScriptAction::Finish]
}

pub fn tool_call_script(id: &str, name: &str, args: &str) -> Vec<ScriptAction> {
    vec![
        ScriptAction::Fragment(ToolCallFragment {
            index: 0,
            id: Some(id.to_string()),
            name: Some(name.to_string()),
            arguments: args.to_string(),
        }),
        ScriptAction::Finish,
    ]
}

/// Chat client that replays queued scripts, one per model round.
pub struct ScriptClient {
    scripts: Mutex<VecDeque<Vec<ScriptAction>>>,
}

impl ScriptClient {
    pub fn new(scripts: Vec<Vec<ScriptAction>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::from(scripts)),
        })
    }
}

#[async_trait]
impl ChatClient for ScriptClient {
    fn name(&self) -> &str {
        "script"
    }

    async fn complete(&self, request: Request) -> Result<Completion, ClientError> {
        let mut stream = self.stream_complete(request, &CancelToken::new()).await?;
        let mut accumulator = StreamAccumulator::new();
        use futures::StreamExt;
        while let Some(event) = stream.next().await {
            accumulator.push(&event?);
        }
        Ok(accumulator.finish())
    }

    async fn stream_complete(
        &self,
        _request: Request,
        _cancel: &CancelToken,
    ) -> Result<CompletionStream, ClientError> {
        let script = self
            .scripts
            .lock()
            .expect("scripts mutex")
            .pop_front()
            .ok_or_else(|| ClientError::Configuration("no script queued".to_string()))?;

        let events: Vec<Result<StreamEvent, ClientError>> = script
            .into_iter()
            .map(|action| {
                Ok(match action {
                    ScriptAction::Delta(text) => StreamEvent::TextDelta(text),
                    ScriptAction::Fragment(fragment) => StreamEvent::ToolCallDelta(fragment),
                    ScriptAction::Finish => StreamEvent::Finish { usage: None },
                })
            })
            .collect();
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

/// Client whose stream never produces events; runs against it sit in the
/// model call until cancelled.
pub struct StallingClient;

#[async_trait]
impl ChatClient for StallingClient {
    fn name(&self) -> &str {
        "stalling"
    }

    async fn complete(&self, _request: Request) -> Result<Completion, ClientError> {
        Err(ClientError::Configuration(
            "stalling client has no completions".to_string(),
        ))
    }

    async fn stream_complete(
        &self,
        _request: Request,
        _cancel: &CancelToken,
    ) -> Result<CompletionStream, ClientError> {
        Ok(Box::pin(futures::stream::pending()))
    }
}

pub fn failing_registry(name: &str) -> Arc<StaticToolRegistry> {
    let mut registry = StaticToolRegistry::new();
    let executor: ToolExecutor =
        Arc::new(|_args| Box::pin(async { Err(ToolError::Execution("kaboom".to_string())) }));
    registry.register(RegisteredTool {
        schema: ToolSchema {
            name: name.to_string(),
            description: "always fails".to_string(),
            parameters: json!({ "type": "object", "properties": {} }),
        },
        executor,
    });
    Arc::new(registry)
}

pub fn manager_with(
    store: Arc<MemoryChatStore>,
    client: Arc<dyn ChatClient>,
    tools: Arc<dyn ToolRegistry>,
) -> TaskManager {
    let agent = AgentLoop::new(
        store.clone(),
        client,
        tools,
        Arc::new(StaticPromptBuilder::new("You are relay.")),
        LoopConfig::default(),
    );
    TaskManager::new(store, agent)
}

pub fn empty_registry() -> Arc<StaticToolRegistry> {
    Arc::new(StaticToolRegistry::new())
}
