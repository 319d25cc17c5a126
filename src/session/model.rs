//! Session entities: sessions, agents, tool calls, and plan steps.
//!
//! These are plain data types; all mutation goes through the
//! [`SessionStore`](super::store::SessionStore) so that every state change
//! produces exactly one event.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ModelSelection;
use crate::session::flow::FlowGraph;

/// Agent ID of the orchestrator pseudo-agent.
///
/// The orchestrator records its own tool calls under this ID so event
/// emission is uniform across the orchestrator and spawned sub-agents.
pub const ORCHESTRATOR_AGENT_ID: &str = "orchestrator";

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Initializing,
    Planning,
    Executing,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Whether this status is terminal. Terminal sessions never change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable string form used in event payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an agent.
///
/// Transitions respect `pending → running → {completed, failed}`;
/// `retrying` appears transiently while a validation retry is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

impl AgentStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable string form used in event payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Executing,
    Completed,
    Failed,
}

impl ToolCallStatus {
    /// Whether the call has finished (successfully or not).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Status of a plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepStatus {
    Pending,
    InProgress,
    Completed,
}

/// One recorded tool invocation by an agent (or the orchestrator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Provider-supplied ID, or generated when absent.
    pub tool_call_id: String,
    /// Name of the invoked tool.
    pub tool_name: String,
    /// Which orchestrator/sub-agent turn issued this call.
    pub step_number: usize,
    /// Position within the turn.
    pub index_in_step: usize,
    /// Tool input as supplied by the model.
    pub input: serde_json::Value,
    /// Current status.
    pub status: ToolCallStatus,
    /// Result, present iff the call is terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When execution began.
    pub started_at: DateTime<Utc>,
    /// When execution finished, absent while executing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// `completed_at − started_at` in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Model-supplied description of why the call was made.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One agent within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Stable ID (`agent_N`, or [`ORCHESTRATOR_AGENT_ID`]).
    pub agent_id: String,
    /// The task the agent was spawned with.
    pub task: String,
    /// Optional short description for display.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Current status.
    pub status: AgentStatus,
    /// Ordered tool calls, append-only.
    pub tool_calls: Vec<ToolCallRecord>,
    /// When the agent was created.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Last observed activity (tool call, status change).
    pub last_activity: DateTime<Utc>,
    /// Error description when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Validation retries issued so far.
    pub retry_count: u32,
}

impl AgentRecord {
    /// Creates a fresh record in the given status.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, task: impl Into<String>, status: AgentStatus) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            task: task.into(),
            description: None,
            status,
            tool_calls: Vec::new(),
            created_at: now,
            updated_at: now,
            last_activity: now,
            error: None,
            retry_count: 0,
        }
    }
}

/// One step in the orchestrator's research plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Stable step ID.
    pub step_id: String,
    /// What this step accomplishes.
    pub description: String,
    /// Current status.
    pub status: PlanStepStatus,
    /// Agents assigned to this step.
    #[serde(default)]
    pub agent_ids: Vec<String>,
    /// When the step was created.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Display ordering, when the planner supplied one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<usize>,
}

/// Root entity for one end-to-end research run.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque UUID.
    pub session_id: String,
    /// The research query.
    pub query: String,
    /// Opaque clarification context from the disambiguation step.
    pub clarification: Option<String>,
    /// Models for the five LLM roles.
    pub models: ModelSelection,
    /// Current status.
    pub status: SessionStatus,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Agents by ID, including the orchestrator pseudo-agent.
    pub agents: HashMap<String, AgentRecord>,
    /// Plan steps by ID.
    pub plan: HashMap<String, PlanStep>,
    /// Strategic perspective from the planner, once generated.
    pub strategic_perspective: Option<String>,
    /// Topology for visualization.
    pub flow: FlowGraph,
    /// Monotonic counter backing generated agent IDs.
    pub next_agent_seq: usize,
    /// Monotonic counter backing generated plan step IDs.
    pub next_step_seq: usize,
}

impl Session {
    /// Next generated agent ID (`agent_1`, `agent_2`, …).
    pub fn allocate_agent_id(&mut self) -> String {
        self.next_agent_seq += 1;
        format!("agent_{}", self.next_agent_seq)
    }

    /// Next generated plan step ID (`step_1`, `step_2`, …).
    pub fn allocate_step_id(&mut self) -> String {
        self.next_step_seq += 1;
        format!("step_{}", self.next_step_seq)
    }

    /// Number of real (non-orchestrator) agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents
            .keys()
            .filter(|id| id.as_str() != ORCHESTRATOR_AGENT_ID)
            .count()
    }

    /// Plan steps sorted by explicit order, then by step ID.
    #[must_use]
    pub fn ordered_plan(&self) -> Vec<PlanStep> {
        let mut steps: Vec<PlanStep> = self.plan.values().cloned().collect();
        steps.sort_by(|a, b| match (a.order, b.order) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.step_id.cmp(&b.step_id)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.step_id.cmp(&b.step_id),
        });
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Executing.is_terminal());
        assert!(AgentStatus::Completed.is_terminal());
        assert!(!AgentStatus::Retrying.is_terminal());
        assert!(ToolCallStatus::Failed.is_terminal());
        assert!(!ToolCallStatus::Executing.is_terminal());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&SessionStatus::Planning).unwrap_or_default();
        assert_eq!(json, "\"planning\"");
        let json = serde_json::to_string(&PlanStepStatus::InProgress).unwrap_or_default();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn test_agent_id_allocation_monotonic() {
        let mut session = Session {
            session_id: "s".to_string(),
            query: "q".to_string(),
            clarification: None,
            models: ModelSelection::default(),
            status: SessionStatus::Initializing,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            agents: HashMap::new(),
            plan: HashMap::new(),
            strategic_perspective: None,
            flow: FlowGraph::default(),
            next_agent_seq: 0,
            next_step_seq: 0,
        };
        assert_eq!(session.allocate_agent_id(), "agent_1");
        assert_eq!(session.allocate_agent_id(), "agent_2");
        assert_eq!(session.allocate_step_id(), "step_1");
    }

    #[test]
    fn test_ordered_plan() {
        let now = Utc::now();
        let mut session = Session {
            session_id: "s".to_string(),
            query: "q".to_string(),
            clarification: None,
            models: ModelSelection::default(),
            status: SessionStatus::Planning,
            created_at: now,
            updated_at: now,
            agents: HashMap::new(),
            plan: HashMap::new(),
            strategic_perspective: None,
            flow: FlowGraph::default(),
            next_agent_seq: 0,
            next_step_seq: 0,
        };
        for (id, order) in [("step_2", None), ("step_1", Some(2)), ("step_3", Some(1))] {
            session.plan.insert(
                id.to_string(),
                PlanStep {
                    step_id: id.to_string(),
                    description: String::new(),
                    status: PlanStepStatus::Pending,
                    agent_ids: Vec::new(),
                    created_at: now,
                    updated_at: now,
                    order,
                },
            );
        }
        let ordered = session.ordered_plan();
        assert_eq!(ordered[0].step_id, "step_3");
        assert_eq!(ordered[1].step_id, "step_1");
        assert_eq!(ordered[2].step_id, "step_2");
    }
}
