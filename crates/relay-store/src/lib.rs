//! Durable chat/task persistence boundary for relay.
//!
//! `ChatStore` is the only interface the agent loop and task manager consume;
//! `MemoryChatStore` is the reference implementation used by tests and
//! single-process deployments.

pub mod memory;
pub mod store;
pub mod types;

pub use memory::*;
pub use store::*;
pub use types::*;
