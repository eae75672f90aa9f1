use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use relay_llm::ToolSchema;
use serde_json::Value;

use crate::errors::ToolError;

/// One piece of structured tool output.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
}

/// Result of a tool invocation.
///
/// The side channels are explicit optional fields rather than ad hoc markers
/// on the content: a tool that wants the caller to upload something, or that
/// produced a resource worth pinning, says so here.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolOutput {
    pub content: Vec<ToolContent>,
    pub upload_request: Option<Value>,
    pub key_resource: Option<Value>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            ..Self::default()
        }
    }

    pub fn with_upload_request(mut self, request: Value) -> Self {
        self.upload_request = Some(request);
        self
    }

    pub fn with_key_resource(mut self, resource: Value) -> Self {
        self.key_resource = Some(resource);
        self
    }

    /// Concatenated text content, fed back to the model as the tool message.
    pub fn flattened_text(&self) -> String {
        self.content
            .iter()
            .map(|part| match part {
                ToolContent::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Catalog and dispatcher for callable tools.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolSchema>, ToolError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, ToolError>;
}

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send>>;
pub type ToolExecutor = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

#[derive(Clone)]
pub struct RegisteredTool {
    pub schema: ToolSchema,
    pub executor: ToolExecutor,
}

/// Closure-backed registry for in-process tools.
#[derive(Clone, Default)]
pub struct StaticToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl StaticToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: RegisteredTool) {
        self.tools.insert(tool.schema.name.clone(), tool);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ToolRegistry for StaticToolRegistry {
    async fn list_tools(&self) -> Result<Vec<ToolSchema>, ToolError> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|tool| tool.schema.clone())
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schemas)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, ToolError> {
        let Some(tool) = self.tools.get(name) else {
            return Err(ToolError::Unknown(name.to_string()));
        };
        (tool.executor)(arguments).await
    }
}
