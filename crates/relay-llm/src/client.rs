use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::cancel::CancelToken;
use crate::errors::ClientError;
use crate::stream::StreamEvent;
use crate::types::{Completion, Request};

pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ClientError>> + Send>>;

/// Chat-completion provider contract.
///
/// `stream_complete` takes the run's cancel token so implementations can stop
/// producing events once cancellation fires; callers still race the stream
/// against the token themselves, so honoring it here is an optimization, not
/// a correctness requirement.
#[async_trait]
pub trait ChatClient: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: Request) -> Result<Completion, ClientError>;

    async fn stream_complete(
        &self,
        request: Request,
        cancel: &CancelToken,
    ) -> Result<CompletionStream, ClientError>;
}
