use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),

    #[error("tool execution failed: {0}")]
    Execution(String),
}

/// Top-level error type for the relay-agent crate.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model call failed: {0}")]
    Client(#[from] relay_llm::ClientError),

    #[error(transparent)]
    Store(#[from] relay_store::StoreError),

    #[error("tool '{name}' failed: {source}")]
    Tool {
        name: String,
        #[source]
        source: ToolError,
    },

    #[error("tool catalog unavailable: {0}")]
    ToolCatalog(ToolError),

    #[error("model round limit reached after {0} rounds")]
    RoundLimit(usize),
}
