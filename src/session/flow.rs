//! Flow graph derivation for session topology visualization.
//!
//! Nodes are the orchestrator, spawned agents, and recorded tool calls.
//! Edges link the orchestrator to each agent it spawned, each agent to its
//! tool calls, and sequential tool calls of one agent to each other.

use serde::{Deserialize, Serialize};

use super::model::{ORCHESTRATOR_AGENT_ID, Session};

/// A node in the session flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    /// Unique node ID.
    pub id: String,
    /// Node kind: `"orchestrator"`, `"agent"`, or `"tool_call"`.
    pub kind: String,
    /// Display label.
    pub label: String,
    /// Current status string of the underlying entity.
    pub status: String,
}

/// A directed edge in the session flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEdge {
    /// Unique edge ID.
    pub id: String,
    /// Source node ID.
    pub source: String,
    /// Target node ID.
    pub target: String,
}

/// Nodes and edges describing the current session topology.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowGraph {
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
}

/// Derives the flow graph from the current session state.
#[must_use]
pub fn derive_flow(session: &Session) -> FlowGraph {
    let mut graph = FlowGraph::default();

    let orchestrator_status = session
        .agents
        .get(ORCHESTRATOR_AGENT_ID)
        .map_or_else(|| "running".to_string(), |a| a.status.to_string());
    graph.nodes.push(FlowNode {
        id: ORCHESTRATOR_AGENT_ID.to_string(),
        kind: "orchestrator".to_string(),
        label: "Orchestrator".to_string(),
        status: orchestrator_status,
    });

    let mut agent_ids: Vec<&String> = session
        .agents
        .keys()
        .filter(|id| id.as_str() != ORCHESTRATOR_AGENT_ID)
        .collect();
    agent_ids.sort();

    let mut ordered: Vec<&str> = vec![ORCHESTRATOR_AGENT_ID];
    ordered.extend(agent_ids.iter().map(|id| id.as_str()));

    for agent_id in ordered {
        let Some(agent) = session.agents.get(agent_id) else {
            continue;
        };
        if agent_id != ORCHESTRATOR_AGENT_ID {
            graph.nodes.push(FlowNode {
                id: agent.agent_id.clone(),
                kind: "agent".to_string(),
                label: agent
                    .description
                    .clone()
                    .unwrap_or_else(|| agent.agent_id.clone()),
                status: agent.status.to_string(),
            });
            graph.edges.push(FlowEdge {
                id: format!("{ORCHESTRATOR_AGENT_ID}->{}", agent.agent_id),
                source: ORCHESTRATOR_AGENT_ID.to_string(),
                target: agent.agent_id.clone(),
            });
        }

        let mut previous: Option<String> = None;
        for call in &agent.tool_calls {
            let node_id = format!("{}:{}", agent.agent_id, call.tool_call_id);
            graph.nodes.push(FlowNode {
                id: node_id.clone(),
                kind: "tool_call".to_string(),
                label: call.tool_name.clone(),
                status: format!("{:?}", call.status).to_lowercase(),
            });
            graph.edges.push(FlowEdge {
                id: format!("{}->{node_id}", agent.agent_id),
                source: agent.agent_id.clone(),
                target: node_id.clone(),
            });
            if let Some(prev) = previous {
                graph.edges.push(FlowEdge {
                    id: format!("{prev}->{node_id}"),
                    source: prev,
                    target: node_id.clone(),
                });
            }
            previous = Some(node_id);
        }
    }

    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelSelection;
    use crate::session::model::{
        AgentRecord, AgentStatus, SessionStatus, ToolCallRecord, ToolCallStatus,
    };
    use chrono::Utc;
    use std::collections::HashMap;

    fn session_with_one_agent() -> Session {
        let now = Utc::now();
        let mut agents = HashMap::new();
        agents.insert(
            ORCHESTRATOR_AGENT_ID.to_string(),
            AgentRecord::new(ORCHESTRATOR_AGENT_ID, "coordinate", AgentStatus::Running),
        );
        let mut agent = AgentRecord::new("agent_1", "research", AgentStatus::Running);
        for i in 0..2 {
            agent.tool_calls.push(ToolCallRecord {
                tool_call_id: format!("call_{i}"),
                tool_name: "web_search".to_string(),
                step_number: 1,
                index_in_step: i,
                input: serde_json::Value::Null,
                status: ToolCallStatus::Completed,
                result: None,
                created_at: now,
                started_at: now,
                completed_at: Some(now),
                duration_ms: Some(0),
                description: None,
            });
        }
        agents.insert("agent_1".to_string(), agent);
        Session {
            session_id: "s".to_string(),
            query: "q".to_string(),
            clarification: None,
            models: ModelSelection::default(),
            status: SessionStatus::Executing,
            created_at: now,
            updated_at: now,
            agents,
            plan: HashMap::new(),
            strategic_perspective: None,
            flow: FlowGraph::default(),
            next_agent_seq: 1,
            next_step_seq: 0,
        }
    }

    #[test]
    fn test_derive_flow_topology() {
        let graph = derive_flow(&session_with_one_agent());
        // orchestrator + agent + 2 tool calls
        assert_eq!(graph.nodes.len(), 4);
        // orchestrator->agent, agent->call0, agent->call1, call0->call1
        assert_eq!(graph.edges.len(), 4);
        assert!(
            graph
                .edges
                .iter()
                .any(|e| e.source == ORCHESTRATOR_AGENT_ID && e.target == "agent_1")
        );
        assert!(
            graph
                .edges
                .iter()
                .any(|e| e.source == "agent_1:call_0" && e.target == "agent_1:call_1")
        );
    }
}
