//! Session state: entities, events, the authoritative store, and the
//! derived flow graph.

pub mod event;
pub mod flow;
pub mod model;
pub mod store;

pub use event::{Event, EventPayload, StepToolCall};
pub use flow::{FlowEdge, FlowGraph, FlowNode};
pub use model::{
    AgentRecord, AgentStatus, ORCHESTRATOR_AGENT_ID, PlanStep, PlanStepStatus, Session,
    SessionStatus, ToolCallRecord, ToolCallStatus,
};
pub use store::{EventStream, SessionHandle, SessionStore};
