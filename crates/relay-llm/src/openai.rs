//! Adapter for OpenAI-compatible chat-completion endpoints.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::pin::Pin;

use crate::cancel::CancelToken;
use crate::client::{ChatClient, CompletionStream};
use crate::errors::ClientError;
use crate::sse::SseParser;
use crate::stream::{StreamEvent, ToolCallFragment};
use crate::types::{Completion, Message, Request, Role, ToolCall, Usage};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    default_model: String,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            default_model: default_model.into(),
        }
    }

    /// Builds a client from `OPENAI_API_KEY`, `OPENAI_BASE_URL`, and
    /// `OPENAI_MODEL`. Returns `None` when no API key is configured.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok()?;
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        Some(Self::new(base_url, api_key, model))
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn body(&self, request: &Request, stream: bool) -> wire::ChatRequest {
        wire::ChatRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            messages: request.messages.iter().map(wire::message_out).collect(),
            tools: request.tools.iter().map(wire::tool_out).collect(),
            stream,
        }
    }

    async fn send(&self, body: &wire::ChatRequest) -> Result<reqwest::Response, ClientError> {
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: Request) -> Result<Completion, ClientError> {
        let body = self.body(&request, false);
        let response: wire::ChatResponse = self.send(&body).await?.json().await?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Stream("response contained no choices".to_string()))?;

        Ok(Completion {
            message: wire::message_in(choice.message),
            usage: response.usage.map(wire::usage_in),
        })
    }

    async fn stream_complete(
        &self,
        request: Request,
        cancel: &CancelToken,
    ) -> Result<CompletionStream, ClientError> {
        let body = self.body(&request, true);
        let response = self.send(&body).await?;

        let state = StreamState {
            body: Box::pin(response.bytes_stream()),
            parser: SseParser::new(),
            pending: VecDeque::new(),
            done: false,
            cancel: cancel.clone(),
        };

        Ok(Box::pin(futures::stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Ok(Some((event, state)));
                }
                if state.done || state.cancel.is_cancelled() {
                    return Ok(None);
                }

                let chunk = tokio::select! {
                    _ = state.cancel.cancelled() => return Ok(None),
                    chunk = state.body.next() => chunk,
                };

                match chunk {
                    None => state.done = true,
                    Some(Err(error)) => return Err(ClientError::Transport(error)),
                    Some(Ok(bytes)) => {
                        let text = String::from_utf8_lossy(&bytes);
                        for sse in state.parser.push(&text) {
                            if sse.data.trim() == "[DONE]" {
                                state.done = true;
                                break;
                            }
                            let chunk: wire::ChatChunk = serde_json::from_str(&sse.data)?;
                            state.pending.extend(wire::chunk_events(chunk));
                        }
                    }
                }
            }
        })))
    }
}

struct StreamState {
    body: Pin<Box<dyn futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
    parser: SseParser,
    pending: VecDeque<StreamEvent>,
    done: bool,
    cancel: CancelToken,
}

mod wire {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::{Value, json};

    #[derive(Serialize)]
    pub struct ChatRequest {
        pub model: String,
        pub messages: Vec<WireMessage>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub tools: Vec<WireTool>,
        pub stream: bool,
    }

    #[derive(Serialize)]
    pub struct WireMessage {
        pub role: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub content: Option<Value>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub tool_calls: Vec<WireToolCall>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub tool_call_id: Option<String>,
    }

    #[derive(Serialize, Deserialize)]
    pub struct WireToolCall {
        pub id: String,
        #[serde(rename = "type")]
        pub kind: String,
        pub function: WireFunction,
    }

    #[derive(Serialize, Deserialize)]
    pub struct WireFunction {
        pub name: String,
        pub arguments: String,
    }

    #[derive(Serialize)]
    pub struct WireTool {
        #[serde(rename = "type")]
        pub kind: &'static str,
        pub function: Value,
    }

    #[derive(Deserialize)]
    pub struct ChatResponse {
        pub choices: Vec<Choice>,
        pub usage: Option<WireUsage>,
    }

    #[derive(Deserialize)]
    pub struct Choice {
        pub message: ResponseMessage,
    }

    #[derive(Deserialize)]
    pub struct ResponseMessage {
        pub content: Option<String>,
        #[serde(default)]
        pub tool_calls: Vec<WireToolCall>,
    }

    #[derive(Deserialize)]
    pub struct WireUsage {
        pub prompt_tokens: u64,
        pub completion_tokens: u64,
        pub total_tokens: u64,
    }

    #[derive(Deserialize)]
    pub struct ChatChunk {
        #[serde(default)]
        pub choices: Vec<ChunkChoice>,
        pub usage: Option<WireUsage>,
    }

    #[derive(Deserialize)]
    pub struct ChunkChoice {
        pub delta: Delta,
        pub finish_reason: Option<String>,
    }

    #[derive(Deserialize, Default)]
    pub struct Delta {
        pub content: Option<String>,
        #[serde(default)]
        pub tool_calls: Vec<DeltaToolCall>,
    }

    #[derive(Deserialize)]
    pub struct DeltaToolCall {
        pub index: usize,
        pub id: Option<String>,
        pub function: Option<DeltaFunction>,
    }

    #[derive(Deserialize, Default)]
    pub struct DeltaFunction {
        pub name: Option<String>,
        pub arguments: Option<String>,
    }

    fn role_out(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn message_out(message: &Message) -> WireMessage {
        let content = if message.images.is_empty() {
            message.content.clone().map(Value::String)
        } else {
            let mut parts = Vec::new();
            if let Some(text) = &message.content {
                parts.push(json!({ "type": "text", "text": text }));
            }
            for url in &message.images {
                parts.push(json!({ "type": "image_url", "image_url": { "url": url } }));
            }
            Some(Value::Array(parts))
        };

        WireMessage {
            role: role_out(message.role),
            content,
            tool_calls: message
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    kind: "function".to_string(),
                    function: WireFunction {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect(),
            tool_call_id: message.tool_call_id.clone(),
        }
    }

    pub fn message_in(message: ResponseMessage) -> Message {
        Message::assistant_with_tool_calls(
            message.content,
            message
                .tool_calls
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect(),
        )
    }

    pub fn tool_out(schema: &crate::types::ToolSchema) -> WireTool {
        WireTool {
            kind: "function",
            function: json!({
                "name": schema.name,
                "description": schema.description,
                "parameters": schema.parameters,
            }),
        }
    }

    pub fn usage_in(usage: WireUsage) -> Usage {
        Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }

    pub fn chunk_events(chunk: ChatChunk) -> Vec<StreamEvent> {
        let usage = chunk.usage.map(usage_in);
        let mut events = Vec::new();
        let mut finished = false;

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    events.push(StreamEvent::TextDelta(content));
                }
            }
            for call in choice.delta.tool_calls {
                let function = call.function.unwrap_or_default();
                events.push(StreamEvent::ToolCallDelta(ToolCallFragment {
                    index: call.index,
                    id: call.id,
                    name: function.name,
                    arguments: function.arguments.unwrap_or_default(),
                }));
            }
            if choice.finish_reason.is_some() {
                finished = true;
            }
        }

        if finished {
            events.push(StreamEvent::Finish { usage });
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_with_tool_call_delta_expected_fragment_event() {
        let chunk: wire::ChatChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call-1","function":{"name":"run_sql","arguments":"{\"sq"}}]},"finish_reason":null}]}"#,
        )
        .expect("chunk should parse");

        let events = wire::chunk_events(chunk);
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::ToolCallDelta(fragment) => {
                assert_eq!(fragment.index, 0);
                assert_eq!(fragment.id.as_deref(), Some("call-1"));
                assert_eq!(fragment.name.as_deref(), Some("run_sql"));
                assert_eq!(fragment.arguments, "{\"sq");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn chunk_with_finish_reason_expected_finish_event() {
        let chunk: wire::ChatChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"done"},"finish_reason":"stop"}],"usage":{"prompt_tokens":5,"completion_tokens":1,"total_tokens":6}}"#,
        )
        .expect("chunk should parse");

        let events = wire::chunk_events(chunk);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::TextDelta("done".to_string()));
        match &events[1] {
            StreamEvent::Finish { usage } => {
                assert_eq!(usage.as_ref().expect("usage should be set").total_tokens, 6);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn user_message_with_images_serializes_as_content_parts() {
        let message = Message::user_with_images(
            "describe this",
            vec!["https://example.com/a.png".to_string()],
        );
        let encoded =
            serde_json::to_value(wire::message_out(&message)).expect("should serialize");
        let parts = encoded["content"].as_array().expect("content should be parts");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["image_url"]["url"], "https://example.com/a.png");
    }
}
