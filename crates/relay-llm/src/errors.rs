use thiserror::Error;

/// Errors surfaced by chat-client implementations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed stream payload: {0}")]
    Stream(String),

    #[error("response decoding failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid client configuration: {0}")]
    Configuration(String),
}
