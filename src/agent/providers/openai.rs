//! `OpenAI` provider implementation using the `async-openai` crate.
//!
//! Supports any `OpenAI`-compatible API (`OpenAI`, Azure, local proxies)
//! via the base URL override. Streamed tool-call deltas are assembled
//! into complete calls; a start notice is emitted the moment a call's
//! name is known so callers can surface it before the arguments arrive.

use std::collections::BTreeMap;

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessage,
    ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
    ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestToolMessage, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
    ChatCompletionStreamOptions, ChatCompletionTool, ChatCompletionToolType,
    CreateChatCompletionRequest, FunctionCall, FunctionObject, ImageDetail, ImageUrl,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::agent::message::{
    ChatMessage, ChatRequest, ChatResponse, ChatStreamEvent, ContentPart, LlmToolCall,
    MessageContent, Role, TokenUsage,
};
use crate::agent::provider::{ChatStream, LlmProvider};
use crate::error::{EngineError, ErrorClass};

/// `OpenAI`-compatible LLM provider.
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
}

impl OpenAiProvider {
    /// Creates a new provider for the given key and optional base URL.
    #[must_use]
    pub fn new(api_key: &str, base_url: Option<&str>) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self {
            client: Client::with_config(config),
        }
    }

    /// Converts our message type to the `OpenAI` SDK type.
    fn convert_message(msg: &ChatMessage) -> ChatCompletionRequestMessage {
        match msg.role {
            Role::System => {
                ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                    content: async_openai::types::ChatCompletionRequestSystemMessageContent::Text(
                        msg.content.as_text(),
                    ),
                    name: None,
                })
            }
            Role::User => ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: Self::convert_user_content(&msg.content),
                name: None,
            }),
            Role::Assistant => {
                let tool_calls = if msg.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        msg.tool_calls
                            .iter()
                            .map(|tc| ChatCompletionMessageToolCall {
                                id: tc.id.clone(),
                                r#type: ChatCompletionToolType::Function,
                                function: FunctionCall {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                };

                let text = msg.content.as_text();
                let content = if text.is_empty() {
                    None
                } else {
                    Some(
                        async_openai::types::ChatCompletionRequestAssistantMessageContent::Text(
                            text,
                        ),
                    )
                };

                #[allow(deprecated)]
                ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                    content,
                    name: None,
                    tool_calls,
                    refusal: None,
                    audio: None,
                    function_call: None,
                })
            }
            Role::Tool => ChatCompletionRequestMessage::Tool(ChatCompletionRequestToolMessage {
                content: async_openai::types::ChatCompletionRequestToolMessageContent::Text(
                    msg.content.as_text(),
                ),
                tool_call_id: msg.tool_call_id.clone().unwrap_or_default(),
            }),
        }
    }

    /// User content: plain text stays text; parts become an array with
    /// inline image URLs.
    fn convert_user_content(content: &MessageContent) -> ChatCompletionRequestUserMessageContent {
        match content {
            MessageContent::Text(t) => ChatCompletionRequestUserMessageContent::Text(t.clone()),
            MessageContent::Parts(parts) => ChatCompletionRequestUserMessageContent::Array(
                parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => {
                            ChatCompletionRequestUserMessageContentPart::Text(
                                ChatCompletionRequestMessageContentPartText { text: text.clone() },
                            )
                        }
                        ContentPart::Image { image } => {
                            ChatCompletionRequestUserMessageContentPart::ImageUrl(
                                ChatCompletionRequestMessageContentPartImage {
                                    image_url: ImageUrl {
                                        url: image.clone(),
                                        detail: Some(ImageDetail::Auto),
                                    },
                                },
                            )
                        }
                    })
                    .collect(),
            ),
        }
    }

    /// Builds an `OpenAI` chat completion request from our generic request.
    fn build_request(request: &ChatRequest, stream: bool) -> CreateChatCompletionRequest {
        let messages: Vec<_> = request.messages.iter().map(Self::convert_message).collect();

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|td| ChatCompletionTool {
                        r#type: ChatCompletionToolType::Function,
                        function: FunctionObject {
                            name: td.name.clone(),
                            description: Some(td.description.clone()),
                            parameters: Some(td.parameters.clone()),
                            strict: None,
                        },
                    })
                    .collect(),
            )
        };

        CreateChatCompletionRequest {
            model: request.model.clone(),
            messages,
            temperature: request.temperature.filter(|&t| t != 0.0),
            max_completion_tokens: request.max_tokens,
            stream: if stream { Some(true) } else { None },
            stream_options: stream.then_some(ChatCompletionStreamOptions {
                include_usage: true,
            }),
            tools,
            ..Default::default()
        }
    }

    /// Maps an SDK error to a classified [`EngineError::Api`].
    fn convert_error(e: &OpenAIError) -> EngineError {
        let message = e.to_string();
        let lowered = message.to_lowercase();
        let class = if lowered.contains("429")
            || lowered.contains("rate limit")
            || lowered.contains("too many requests")
        {
            ErrorClass::RateLimit
        } else if lowered.contains("401")
            || lowered.contains("403")
            || lowered.contains("invalid api key")
            || lowered.contains("incorrect api key")
            || lowered.contains("authentication")
        {
            ErrorClass::AuthError
        } else if lowered.contains("500")
            || lowered.contains("502")
            || lowered.contains("503")
            || lowered.contains("server error")
            || lowered.contains("overloaded")
        {
            ErrorClass::ServerError
        } else if matches!(e, OpenAIError::InvalidArgument(_) | OpenAIError::ApiError(_))
            && (lowered.contains("400") || lowered.contains("invalid"))
        {
            ErrorClass::BadRequest
        } else {
            ErrorClass::Unknown
        };
        EngineError::Api {
            message,
            status: None,
            class,
        }
    }
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("client", &"<async-openai::Client>")
            .finish()
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
    started: bool,
}

/// Receiver-backed stream adapter.
struct EventReceiver {
    rx: mpsc::Receiver<Result<ChatStreamEvent, EngineError>>,
}

impl futures_util::Stream for EventReceiver {
    type Item = Result<ChatStreamEvent, EngineError>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, EngineError> {
        let openai_request = Self::build_request(request, false);

        let response = self
            .client
            .chat()
            .create(openai_request)
            .await
            .map_err(|e| Self::convert_error(&e))?;

        let choice = response.choices.first();

        let content = choice
            .and_then(|c| c.message.content.as_ref())
            .cloned()
            .unwrap_or_default();

        let tool_calls = choice
            .and_then(|c| c.message.tool_calls.as_ref())
            .map(|tcs| {
                tcs.iter()
                    .map(|tc| LlmToolCall {
                        id: tc.id.clone(),
                        name: tc.function.name.clone(),
                        arguments: tc.function.arguments.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let finish_reason = choice.and_then(|c| {
            c.finish_reason
                .as_ref()
                .map(|fr| format!("{fr:?}").to_lowercase())
        });

        let usage = response
            .usage
            .map_or_else(TokenUsage::default, |u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            });

        Ok(ChatResponse {
            content,
            usage,
            tool_calls,
            finish_reason,
        })
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream, EngineError> {
        let openai_request = Self::build_request(request, true);

        let mut sdk_stream = self
            .client
            .chat()
            .create_stream(openai_request)
            .await
            .map_err(|e| Self::convert_error(&e))?;

        let (tx, rx) = mpsc::channel::<Result<ChatStreamEvent, EngineError>>(64);

        tokio::spawn(async move {
            let mut pending: BTreeMap<i64, PendingToolCall> = BTreeMap::new();
            let mut usage = TokenUsage::default();
            let mut finish_reason: Option<String> = None;

            while let Some(item) = sdk_stream.next().await {
                match item {
                    Ok(chunk) => {
                        if let Some(u) = chunk.usage {
                            usage = TokenUsage {
                                prompt_tokens: u.prompt_tokens,
                                completion_tokens: u.completion_tokens,
                                total_tokens: u.total_tokens,
                            };
                        }
                        let Some(choice) = chunk.choices.first() else {
                            continue;
                        };
                        if let Some(fr) = &choice.finish_reason {
                            finish_reason = Some(format!("{fr:?}").to_lowercase());
                        }
                        if let Some(text) = &choice.delta.content {
                            if !text.is_empty()
                                && tx
                                    .send(Ok(ChatStreamEvent::TextDelta(text.clone())))
                                    .await
                                    .is_err()
                            {
                                return;
                            }
                        }
                        for tc in choice.delta.tool_calls.iter().flatten() {
                            let entry = pending.entry(i64::from(tc.index)).or_default();
                            if let Some(id) = &tc.id {
                                entry.id.clone_from(id);
                            }
                            if let Some(f) = &tc.function {
                                if let Some(name) = &f.name {
                                    entry.name.push_str(name);
                                }
                                if let Some(args) = &f.arguments {
                                    entry.arguments.push_str(args);
                                }
                            }
                            if !entry.started && !entry.name.is_empty() {
                                entry.started = true;
                                if tx
                                    .send(Ok(ChatStreamEvent::ToolCallStarted {
                                        id: entry.id.clone(),
                                        name: entry.name.clone(),
                                    }))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(OpenAiProvider::convert_error(&e))).await;
                        return;
                    }
                }
            }

            for (_, call) in pending {
                let arguments = if call.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    call.arguments
                };
                if tx
                    .send(Ok(ChatStreamEvent::ToolCallCompleted(LlmToolCall {
                        id: call.id,
                        name: call.name,
                        arguments,
                    })))
                    .await
                    .is_err()
                {
                    return;
                }
            }

            let _ = tx
                .send(Ok(ChatStreamEvent::Done {
                    usage,
                    finish_reason,
                }))
                .await;
        });

        Ok(Box::pin(EventReceiver { rx }))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::agent::message;
    use crate::tools::catalog::ToolDefinition;

    #[test]
    fn test_convert_system_message() {
        let msg = message::system_message("test");
        let converted = OpenAiProvider::convert_message(&msg);
        assert!(matches!(converted, ChatCompletionRequestMessage::System(_)));
    }

    #[test]
    fn test_convert_tool_message() {
        let msg = message::tool_message("call_123", "result data");
        let converted = OpenAiProvider::convert_message(&msg);
        assert!(matches!(converted, ChatCompletionRequestMessage::Tool(_)));
    }

    #[test]
    fn test_convert_multimodal_user_message() {
        let msg = message::user_parts_message(vec![
            ContentPart::Text {
                text: "chart guide".to_string(),
            },
            ContentPart::Image {
                image: "data:image/png;base64,AAAA".to_string(),
            },
        ]);
        let converted = OpenAiProvider::convert_message(&msg);
        if let ChatCompletionRequestMessage::User(u) = converted {
            if let ChatCompletionRequestUserMessageContent::Array(parts) = u.content {
                assert_eq!(parts.len(), 2);
            } else {
                panic!("expected array content");
            }
        } else {
            panic!("expected user message");
        }
    }

    #[test]
    fn test_convert_assistant_with_tool_calls() {
        let msg = message::assistant_message(
            "",
            vec![LlmToolCall {
                id: "call_1".to_string(),
                name: "web_search".to_string(),
                arguments: r#"{"query":"x"}"#.to_string(),
            }],
        );
        let converted = OpenAiProvider::convert_message(&msg);
        if let ChatCompletionRequestMessage::Assistant(a) = converted {
            assert_eq!(a.tool_calls.as_ref().map_or(0, Vec::len), 1);
            assert!(a.content.is_none());
        } else {
            panic!("expected assistant message");
        }
    }

    #[test]
    fn test_build_request_with_tools() {
        let request = ChatRequest {
            model: "gpt-5.2-2025-12-11".to_string(),
            messages: vec![message::user_message("test")],
            temperature: Some(0.0),
            max_tokens: Some(100),
            tools: vec![ToolDefinition {
                name: "web_search".to_string(),
                description: "Search the web".to_string(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            }],
        };
        let built = OpenAiProvider::build_request(&request, false);
        assert_eq!(built.tools.as_ref().map_or(0, Vec::len), 1);
        assert!(built.stream.is_none());
    }

    #[test]
    fn test_build_request_streaming_requests_usage() {
        let request = ChatRequest {
            model: "gpt-5.2-2025-12-11".to_string(),
            messages: vec![message::user_message("test")],
            temperature: None,
            max_tokens: None,
            tools: Vec::new(),
        };
        let built = OpenAiProvider::build_request(&request, true);
        assert_eq!(built.stream, Some(true));
        assert!(built.stream_options.is_some());
    }
}
