//! Pluggable LLM provider trait.
//!
//! Implementations translate provider-agnostic [`ChatRequest`]/[`ChatResponse`]
//! into provider-specific SDK calls. This keeps all agent logic decoupled
//! from any particular LLM vendor.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use super::message::{ChatRequest, ChatResponse, ChatStreamEvent};
use crate::error::EngineError;

/// A pinned stream of chat completion frames.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatStreamEvent, EngineError>> + Send>>;

/// Trait for LLM provider backends.
///
/// Implementations handle the transport layer (HTTP, SDK calls) for a
/// specific provider while presenting a uniform interface to agents.
/// Cancellation is driven by the caller dropping the stream/future.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g., `"openai"`).
    fn name(&self) -> &'static str;

    /// Executes a chat completion request.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Api`] on provider failures, classified for
    /// retry decisions.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, EngineError>;

    /// Executes a streaming chat completion request.
    ///
    /// The stream yields text deltas, tool-call-start notices, completed
    /// tool calls, and a final `Done` frame.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on connection failures; per-frame errors
    /// surface through the stream.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream, EngineError>;
}
