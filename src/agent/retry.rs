//! Retry with classified exponential backoff for LLM calls.
//!
//! Errors are classified into bad-request, rate-limit, server-error,
//! auth-error, or unknown. Rate limits back off from a 5 s base, everything
//! else from 2 s; delay doubles per attempt. Bad requests and auth errors
//! fail immediately.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::agent::message::{ChatRequest, ChatResponse};
use crate::agent::provider::LlmProvider;
use crate::error::{EngineError, ErrorClass};

/// Maximum attempts per chat call.
const MAX_ATTEMPTS: u32 = 3;

/// Backoff delay for a given class and 1-based attempt number.
#[must_use]
pub fn backoff_delay(class: ErrorClass, attempt: u32) -> Duration {
    let base = class.backoff_base();
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// Calls `provider.chat`, retrying transient failures up to 3 attempts.
///
/// Cancellation aborts both the in-flight call and any backoff sleep.
///
/// # Errors
///
/// Returns the last provider error once attempts are exhausted, the
/// original error for non-retryable classes, or [`EngineError::Cancelled`].
pub async fn chat_with_retry(
    provider: &dyn LlmProvider,
    request: &ChatRequest,
    cancel: &CancellationToken,
) -> Result<ChatResponse, EngineError> {
    let mut last_err = None;
    for attempt in 1..=MAX_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let result = tokio::select! {
            r = provider.chat(request) => r,
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
        };
        match result {
            Ok(response) => return Ok(response),
            Err(e) => {
                let class = e.class();
                if !class.is_retryable() || attempt == MAX_ATTEMPTS {
                    return Err(e);
                }
                let delay = backoff_delay(class, attempt);
                warn!(
                    attempt,
                    class = class.as_str(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "LLM call failed, backing off"
                );
                last_err = Some(e);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return Err(EngineError::Cancelled),
                }
            }
        }
    }
    Err(last_err.unwrap_or(EngineError::Orchestration {
        message: "retry loop exhausted without an error".to_string(),
    }))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::agent::message::{ChatStreamEvent, TokenUsage, user_message};
    use crate::agent::provider::ChatStream;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        calls: AtomicU32,
        fail_first: u32,
        class: ErrorClass,
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, EngineError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(EngineError::Api {
                    message: "induced failure".to_string(),
                    status: None,
                    class: self.class,
                })
            } else {
                Ok(ChatResponse {
                    content: "ok".to_string(),
                    usage: TokenUsage::default(),
                    tool_calls: Vec::new(),
                    finish_reason: Some("stop".to_string()),
                })
            }
        }

        async fn chat_stream(&self, _request: &ChatRequest) -> Result<ChatStream, EngineError> {
            let events = vec![Ok(ChatStreamEvent::Done {
                usage: TokenUsage::default(),
                finish_reason: Some("stop".to_string()),
            })];
            Ok(Box::pin(futures_util::stream::iter(events)))
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "test".to_string(),
            messages: vec![user_message("q")],
            temperature: Some(0.0),
            max_tokens: Some(64),
            tools: Vec::new(),
        }
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(
            backoff_delay(ErrorClass::RateLimit, 1),
            Duration::from_secs(5)
        );
        assert_eq!(
            backoff_delay(ErrorClass::RateLimit, 2),
            Duration::from_secs(10)
        );
        assert_eq!(
            backoff_delay(ErrorClass::ServerError, 1),
            Duration::from_secs(2)
        );
        assert_eq!(
            backoff_delay(ErrorClass::ServerError, 3),
            Duration::from_secs(8)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let provider = FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: 2,
            class: ErrorClass::ServerError,
        };
        let cancel = CancellationToken::new();
        let response = chat_with_retry(&provider, &request(), &cancel)
            .await
            .unwrap_or_else(|e| panic!("expected success: {e}"));
        assert_eq!(response.content, "ok");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_bad_request_fails_fast() {
        let provider = FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            class: ErrorClass::BadRequest,
        };
        let cancel = CancellationToken::new();
        let result = chat_with_retry(&provider, &request(), &cancel).await;
        assert!(result.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts() {
        let provider = FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            class: ErrorClass::ServerError,
        };
        let cancel = CancellationToken::new();
        let result = chat_with_retry(&provider, &request(), &cancel).await;
        assert!(result.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let provider = FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: 0,
            class: ErrorClass::Unknown,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = chat_with_retry(&provider, &request(), &cancel).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
