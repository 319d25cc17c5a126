//! LLM roles and execution loops.
//!
//! The orchestrator drives the coordination tool catalog; sub-agents drive
//! the research catalog. Both talk to a pluggable [`provider::LlmProvider`]
//! through provider-agnostic [`message`] types.

pub mod message;
pub mod orchestrator;
pub mod prompt;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod step;
pub mod sub_agent;

pub use message::{ChatMessage, ChatRequest, ChatResponse, ChatStreamEvent, LlmToolCall, Role};
pub use orchestrator::Orchestrator;
pub use provider::{ChatStream, LlmProvider};
