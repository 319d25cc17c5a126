//! Tool dispatch layer.
//!
//! Tools validate their input, enforce budgets, emit lifecycle events, and
//! return structured results. Failures are never exceptions to the calling
//! LLM: every error becomes a [`ToolFailure`](crate::error::ToolFailure)
//! serialized into the tool-result message.

use chrono::Utc;

use crate::agent::message::ChatMessage;
use crate::session::{SessionHandle, ToolCallRecord, ToolCallStatus};

pub mod catalog;
pub mod orchestrator;
pub mod sub_agent;
pub mod types;

pub use types::{ToolInput, ToolOutcome, outcome_content};

/// Result of dispatching one tool call.
pub struct ToolDispatch {
    /// Content of the tool-result message sent back to the model.
    pub content: String,
    /// Extra messages to append after the tool result (used by
    /// `view_image` to inject the loaded image into the conversation).
    pub extra_messages: Vec<ChatMessage>,
}

/// Records the start of a tool call against an agent, emitting `tool_call`.
///
/// Returns the stored (possibly regenerated) tool call ID.
pub fn begin_call(
    handle: &SessionHandle,
    agent_id: &str,
    provider_call_id: &str,
    tool_name: &str,
    input: serde_json::Value,
    step_number: usize,
    index_in_step: usize,
    description: Option<String>,
) -> String {
    let now = Utc::now();
    let record = ToolCallRecord {
        tool_call_id: provider_call_id.to_string(),
        tool_name: tool_name.to_string(),
        step_number,
        index_in_step,
        input,
        status: ToolCallStatus::Executing,
        result: None,
        created_at: now,
        started_at: now,
        completed_at: None,
        duration_ms: None,
        description,
    };
    handle
        .add_tool_call(agent_id, record)
        .unwrap_or_else(|_| provider_call_id.to_string())
}

/// Records the completion of a tool call, emitting `tool_result`.
///
/// `input` backfills the recorded input for calls registered before their
/// arguments finished streaming.
pub fn finish_call(
    handle: &SessionHandle,
    agent_id: &str,
    tool_call_id: &str,
    outcome: &ToolOutcome,
    input: Option<serde_json::Value>,
) {
    let (status, result) = match outcome {
        Ok(value) => (ToolCallStatus::Completed, Some(value.clone())),
        Err(failure) => (
            ToolCallStatus::Failed,
            serde_json::to_value(failure).ok(),
        ),
    };
    let _ = handle.update_tool_call(agent_id, tool_call_id, status, result, input);
}

/// Parses a raw argument string into a JSON value for recording; falls
/// back to wrapping the raw text so malformed input still shows up in the
/// event stream.
#[must_use]
pub fn input_value(arguments: &str) -> serde_json::Value {
    serde_json::from_str(arguments)
        .unwrap_or_else(|_| serde_json::Value::String(arguments.to_string()))
}
