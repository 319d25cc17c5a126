//! Typed session events.
//!
//! Every state mutation on a session appends exactly one [`Event`] to its
//! log; subscribers observe the log in append order. The wire frame is
//! `{type, data, timestamp}` with snake_case type tags.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::model::PlanStep;

/// Payload of an event, discriminated by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// First frame delivered to every subscriber.
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// The session moved to a new status.
    SessionStatusChange { status: String },
    /// A sub-agent was created.
    AgentSpawned {
        #[serde(rename = "agentId")]
        agent_id: String,
        task: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    /// An agent moved to a new status.
    AgentStatusChange {
        #[serde(rename = "agentId")]
        agent_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(rename = "retryCount", skip_serializing_if = "Option::is_none")]
        retry_count: Option<u32>,
    },
    /// The orchestrator completed one LLM turn with tool calls.
    OrchestratorStep {
        #[serde(rename = "stepNumber")]
        step_number: usize,
        #[serde(rename = "toolCalls")]
        tool_calls: Vec<StepToolCall>,
    },
    /// A tool call began executing.
    ToolCall {
        #[serde(rename = "agentId")]
        agent_id: String,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: serde_json::Value,
        #[serde(rename = "stepNumber")]
        step_number: usize,
        #[serde(rename = "indexInStep")]
        index_in_step: usize,
        #[serde(rename = "startedAt")]
        started_at: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    /// A tool call finished.
    ToolResult {
        #[serde(rename = "agentId")]
        agent_id: String,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(rename = "startedAt")]
        started_at: String,
        #[serde(rename = "completedAt")]
        completed_at: String,
        #[serde(rename = "duration")]
        duration_ms: u64,
        #[serde(rename = "stepNumber")]
        step_number: usize,
        #[serde(rename = "indexInStep")]
        index_in_step: usize,
    },
    /// The research plan was created or modified.
    PlanUpdate {
        steps: Vec<PlanStep>,
        #[serde(rename = "totalSteps")]
        total_steps: usize,
    },
    /// An error surfaced from the orchestrator, an agent, or the system.
    Error {
        source: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(rename = "agentId", skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    /// An agent exhausted its attempts or was cancelled.
    AgentFailed {
        #[serde(rename = "agentId")]
        agent_id: String,
        error: String,
        #[serde(rename = "errorType")]
        error_type: String,
        attempts: u32,
    },
}

impl EventPayload {
    /// The wire type tag for this payload.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::SessionStatusChange { .. } => "session_status_change",
            Self::AgentSpawned { .. } => "agent_spawned",
            Self::AgentStatusChange { .. } => "agent_status_change",
            Self::OrchestratorStep { .. } => "orchestrator_step",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::PlanUpdate { .. } => "plan_update",
            Self::Error { .. } => "error",
            Self::AgentFailed { .. } => "agent_failed",
        }
    }
}

/// One tool call as listed in an `orchestrator_step` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepToolCall {
    #[serde(rename = "toolName")]
    pub tool_name: String,
    pub input: serde_json::Value,
}

/// A timestamped event frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Type tag and payload.
    #[serde(flatten)]
    pub payload: EventPayload,
    /// ISO-8601 emission time.
    pub timestamp: String,
}

impl Event {
    /// Stamps a payload with the current time.
    #[must_use]
    pub fn now(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_frame_shape() {
        let event = Event::now(EventPayload::Connected {
            session_id: "abc".to_string(),
        });
        let json: serde_json::Value =
            serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        assert_eq!(json["type"], "connected");
        assert_eq!(json["data"]["sessionId"], "abc");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_snake_case_tags() {
        let event = Event::now(EventPayload::SessionStatusChange {
            status: "executing".to_string(),
        });
        let json = serde_json::to_string(&event).unwrap_or_default();
        assert!(json.contains("\"session_status_change\""));

        let event = Event::now(EventPayload::AgentFailed {
            agent_id: "agent_1".to_string(),
            error: "boom".to_string(),
            error_type: "rate_limit".to_string(),
            attempts: 3,
        });
        let json: serde_json::Value =
            serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        assert_eq!(json["type"], "agent_failed");
        assert_eq!(json["data"]["errorType"], "rate_limit");
        assert_eq!(json["data"]["attempts"], 3);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let event = Event::now(EventPayload::AgentStatusChange {
            agent_id: "agent_1".to_string(),
            status: "running".to_string(),
            error: None,
            retry_count: None,
        });
        let json = serde_json::to_string(&event).unwrap_or_default();
        assert!(!json.contains("error"));
        assert!(!json.contains("retryCount"));
    }

    #[test]
    fn test_type_name_matches_serialization() {
        let payloads = vec![
            EventPayload::Connected {
                session_id: String::new(),
            },
            EventPayload::PlanUpdate {
                steps: Vec::new(),
                total_steps: 0,
            },
            EventPayload::Error {
                source: "system".to_string(),
                error: String::new(),
                stack: None,
                agent_id: None,
            },
        ];
        for payload in payloads {
            let expected = payload.type_name();
            let json: serde_json::Value =
                serde_json::to_value(&payload).unwrap_or(serde_json::Value::Null);
            assert_eq!(json["type"], expected);
        }
    }
}
