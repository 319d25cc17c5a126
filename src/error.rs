//! Error types for the research engine.
//!
//! Two layers: [`EngineError`] propagates through Rust code with `?`, while
//! [`ToolFailure`] is the structured, serializable object handed back to a
//! calling LLM when a tool invocation fails. Tool failures are results the
//! model is expected to read and react to, never exceptions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of a provider-side failure, used to pick retry backoff
/// and reported in `agent_failed` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed request; retrying is pointless.
    BadRequest,
    /// HTTP 429 or provider throttling.
    RateLimit,
    /// HTTP 5xx or provider-side outage.
    ServerError,
    /// Invalid or missing credentials.
    AuthError,
    /// Anything else (network resets, parse failures, timeouts).
    Unknown,
}

impl ErrorClass {
    /// Stable string form used in event payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::AuthError => "auth_error",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a call failing with this class is worth retrying.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimit | Self::ServerError | Self::Unknown)
    }

    /// Base delay for exponential backoff. Rate limits get a longer base.
    #[must_use]
    pub const fn backoff_base(self) -> Duration {
        match self {
            Self::RateLimit => Duration::from_secs(5),
            _ => Duration::from_secs(2),
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the engine and its components.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No session with the given ID exists.
    #[error("session not found: {id}")]
    SessionNotFound {
        /// The session ID that was looked up.
        id: String,
    },

    /// Agent lookup failed within a session.
    #[error("agent not found: {id}")]
    AgentNotFound {
        /// The agent ID that was looked up.
        id: String,
    },

    /// Query validation failed at session creation.
    #[error("invalid query: {message}")]
    InvalidQuery {
        /// What was wrong with the query.
        message: String,
    },

    /// A required provider API key was not supplied.
    #[error("missing API key for {provider}")]
    ApiKeyMissing {
        /// Which provider the key was for (`llm`, `search`, `sandbox`).
        provider: &'static str,
    },

    /// Orchestration-level failure (planning, coordination, state).
    #[error("orchestration error: {message}")]
    Orchestration {
        /// Failure description.
        message: String,
    },

    /// LLM provider request failure.
    #[error("API request failed: {message}")]
    Api {
        /// Provider error description.
        message: String,
        /// HTTP status if available.
        status: Option<u16>,
        /// Failure classification for retry decisions.
        class: ErrorClass,
    },

    /// Streaming response failure.
    #[error("stream error: {message}")]
    Stream {
        /// Stream failure description.
        message: String,
    },

    /// Search provider failure.
    #[error("search failed: {message}")]
    Search {
        /// Provider error description.
        message: String,
        /// HTTP status if available.
        status: Option<u16>,
        /// Provider-supplied retry hint, when present.
        retry_after: Option<Duration>,
    },

    /// Sandbox provider failure.
    #[error("sandbox error: {message}")]
    Sandbox {
        /// Provider error description.
        message: String,
    },

    /// The LLM step loop hit its iteration cap.
    #[error("step limit exceeded after {max_steps} steps")]
    StepLimitExceeded {
        /// The configured cap.
        max_steps: usize,
    },

    /// A path escaped its sandbox or the workspace could not be managed.
    #[error("workspace error: {message}")]
    Workspace {
        /// Failure description.
        message: String,
    },

    /// The response could not be parsed into the expected shape.
    #[error("response parse error: {message}")]
    ResponseParse {
        /// Parse failure description.
        message: String,
    },

    /// The session or agent was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Classifies this error for retry/backoff decisions.
    ///
    /// API errors carry their classification; everything else maps to
    /// [`ErrorClass::Unknown`] except cancellation, which is never retried.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Api { class, .. } => *class,
            Self::Cancelled => ErrorClass::BadRequest,
            Self::Search { status, .. } => match status {
                Some(429) => ErrorClass::RateLimit,
                Some(s) if *s >= 500 => ErrorClass::ServerError,
                Some(s) if *s == 401 || *s == 403 => ErrorClass::AuthError,
                Some(_) => ErrorClass::BadRequest,
                None => ErrorClass::Unknown,
            },
            _ => ErrorClass::Unknown,
        }
    }

    /// Whether a search-layer error should be retried by the rate gate.
    ///
    /// Retryable: HTTP 429, 5xx, and transport errors without a status.
    #[must_use]
    pub fn is_retryable_search(&self) -> bool {
        match self {
            Self::Search { status, .. } => match status {
                Some(429) => true,
                Some(s) => *s >= 500,
                None => true,
            },
            _ => false,
        }
    }
}

/// Machine-readable failure codes for the tool dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolErrorCode {
    ImageNotFound,
    FileNotFound,
    FileAccessDenied,
    SearchFailed,
    SearchRateLimited,
    CodeExecutionFailed,
    CodeExecutionTimeout,
    CodeSandboxError,
    AgentNotFound,
    AgentNotReady,
    AgentLimitReached,
    ToolCallLimitReached,
    ApiError,
    ApiKeyMissing,
    ValidationFailed,
    UnknownError,
}

/// Structured failure returned to a calling LLM when a tool fails.
///
/// Serialized verbatim into the tool-result message so the model can read
/// the code, the suggested action, and whether a retry is worthwhile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFailure {
    /// Machine-readable code.
    #[serde(rename = "errorCode")]
    pub error_code: ToolErrorCode,
    /// Human-readable description.
    pub message: String,
    /// What the model should do next.
    #[serde(rename = "suggestedAction")]
    pub suggested_action: String,
    /// Whether retrying the same call may succeed.
    #[serde(rename = "canRetry")]
    pub can_retry: bool,
    /// When to retry, if the provider told us.
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ToolFailure {
    /// Creates a failure with a default suggested action and no retry.
    #[must_use]
    pub fn new(error_code: ToolErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            suggested_action: "Adjust the input and try a different approach.".to_string(),
            can_retry: false,
            retry_after_ms: None,
        }
    }

    /// Sets the suggested action.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = action.into();
        self
    }

    /// Marks the failure retryable.
    #[must_use]
    pub const fn retryable(mut self) -> Self {
        self.can_retry = true;
        self
    }

    /// Sets a retry delay hint in milliseconds.
    #[must_use]
    pub const fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    /// Converts an [`EngineError`] from a provider call into a tool failure.
    #[must_use]
    pub fn from_engine_error(err: &EngineError) -> Self {
        match err {
            EngineError::Search {
                message,
                status: Some(429),
                retry_after,
            } => Self::new(
                ToolErrorCode::SearchRateLimited,
                format!("Search provider rate limited: {message}"),
            )
            .with_action("Wait before searching again, or proceed with results already gathered.")
            .retryable()
            .with_retry_after_ms(
                retry_after.map_or(2_000, |d| u64::try_from(d.as_millis()).unwrap_or(2_000)),
            ),
            EngineError::Search { message, .. } => Self::new(
                ToolErrorCode::SearchFailed,
                format!("Search failed: {message}"),
            )
            .with_action("Rephrase the query or reduce num_results, then retry once.")
            .retryable(),
            EngineError::Sandbox { message } => Self::new(
                ToolErrorCode::CodeSandboxError,
                format!("Sandbox unavailable: {message}"),
            )
            .with_action("Skip code execution and continue with the data you already have."),
            EngineError::Api { message, .. } => {
                Self::new(ToolErrorCode::ApiError, format!("API error: {message}"))
                    .with_action("Retry once; if it fails again, continue without this call.")
                    .retryable()
            }
            EngineError::ApiKeyMissing { provider } => Self::new(
                ToolErrorCode::ApiKeyMissing,
                format!("No API key configured for {provider}"),
            )
            .with_action("This capability is unavailable; work with the other tools."),
            other => Self::new(ToolErrorCode::UnknownError, other.to_string()),
        }
    }
}
