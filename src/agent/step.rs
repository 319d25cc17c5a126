//! One streaming LLM step.
//!
//! A step sends the current conversation to the provider, consumes the
//! stream to completion, and returns the assembled text and tool calls.
//! Stream events are surfaced through a callback so the orchestrator can
//! publish tool-input-start notices the moment a call begins, before its
//! arguments finish streaming.

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::message::{ChatRequest, ChatStreamEvent, LlmToolCall, TokenUsage};
use super::provider::LlmProvider;
use crate::error::EngineError;

/// Assembled result of one streamed step.
#[derive(Debug, Default)]
pub struct StepOutcome {
    /// Assistant text accumulated across deltas.
    pub text: String,
    /// Completed tool calls, in emission order.
    pub tool_calls: Vec<LlmToolCall>,
    /// Token usage for the step.
    pub usage: TokenUsage,
    /// Finish reason reported by the provider.
    pub finish_reason: Option<String>,
}

/// Runs one streaming step, invoking `on_event` for every frame.
///
/// Cancellation aborts the stream mid-flight.
///
/// # Errors
///
/// Returns [`EngineError::Cancelled`] on cancellation and propagates
/// provider stream errors.
pub async fn run_streaming_step(
    provider: &dyn LlmProvider,
    request: &ChatRequest,
    cancel: &CancellationToken,
    mut on_event: impl FnMut(&ChatStreamEvent) + Send,
) -> Result<StepOutcome, EngineError> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    let mut stream = tokio::select! {
        s = provider.chat_stream(request) => s?,
        () = cancel.cancelled() => return Err(EngineError::Cancelled),
    };

    let mut outcome = StepOutcome::default();
    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
        };
        let Some(item) = item else {
            break;
        };
        let event = item?;
        on_event(&event);
        match event {
            ChatStreamEvent::TextDelta(delta) => outcome.text.push_str(&delta),
            ChatStreamEvent::ToolCallStarted { .. } => {}
            ChatStreamEvent::ToolCallCompleted(call) => outcome.tool_calls.push(call),
            ChatStreamEvent::Done {
                usage,
                finish_reason,
            } => {
                outcome.usage = usage;
                outcome.finish_reason = finish_reason;
            }
        }
    }

    debug!(
        tool_calls = outcome.tool_calls.len(),
        text_len = outcome.text.len(),
        "streamed step complete"
    );
    Ok(outcome)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::agent::message::{ChatResponse, user_message};
    use crate::agent::provider::ChatStream;
    use async_trait::async_trait;

    struct ScriptedStream {
        frames: Vec<ChatStreamEvent>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedStream {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, EngineError> {
            Err(EngineError::Stream {
                message: "not used".to_string(),
            })
        }

        async fn chat_stream(&self, _request: &ChatRequest) -> Result<ChatStream, EngineError> {
            let frames: Vec<Result<ChatStreamEvent, EngineError>> =
                self.frames.iter().cloned().map(Ok).collect();
            Ok(Box::pin(futures_util::stream::iter(frames)))
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "test".to_string(),
            messages: vec![user_message("q")],
            temperature: Some(0.0),
            max_tokens: None,
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_assembles_text_and_tool_calls() {
        let provider = ScriptedStream {
            frames: vec![
                ChatStreamEvent::TextDelta("Thinking".to_string()),
                ChatStreamEvent::TextDelta(" about it".to_string()),
                ChatStreamEvent::ToolCallStarted {
                    id: "call_1".to_string(),
                    name: "spawn_agent".to_string(),
                },
                ChatStreamEvent::ToolCallCompleted(LlmToolCall {
                    id: "call_1".to_string(),
                    name: "spawn_agent".to_string(),
                    arguments: r#"{"task":"t"}"#.to_string(),
                }),
                ChatStreamEvent::Done {
                    usage: TokenUsage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                        total_tokens: 15,
                    },
                    finish_reason: Some("tool_calls".to_string()),
                },
            ],
        };
        let cancel = CancellationToken::new();
        let mut started = Vec::new();
        let outcome = run_streaming_step(&provider, &request(), &cancel, |event| {
            if let ChatStreamEvent::ToolCallStarted { name, .. } = event {
                started.push(name.clone());
            }
        })
        .await
        .unwrap_or_else(|e| panic!("step failed: {e}"));

        assert_eq!(outcome.text, "Thinking about it");
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(started, vec!["spawn_agent"]);
        assert_eq!(outcome.usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let provider = ScriptedStream { frames: Vec::new() };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_streaming_step(&provider, &request(), &cancel, |_| {}).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
