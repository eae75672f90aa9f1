use thiserror::Error;

/// Top-level error type for the relay-tasks crate.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Store(#[from] relay_store::StoreError),

    #[error("unknown task: {0}")]
    UnknownTask(String),
}
