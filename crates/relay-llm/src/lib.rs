//! Chat-completion client layer for relay.
//!
//! Defines the message/request/completion types shared by the agent loop and
//! the store, the `ChatClient` contract with streaming and cooperative
//! cancellation, the delta/fragment accumulator, and an adapter for
//! OpenAI-compatible endpoints.

pub mod accumulator;
pub mod cancel;
pub mod client;
pub mod errors;
pub mod openai;
pub mod sse;
pub mod stream;
pub mod types;

pub use accumulator::*;
pub use cancel::*;
pub use client::*;
pub use errors::*;
pub use openai::*;
pub use stream::*;
pub use types::*;
