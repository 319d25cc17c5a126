//! Shared per-session context handed to the orchestrator, sub-agents, and
//! tool executors.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::agent::provider::LlmProvider;
use crate::config::{EngineConfig, ModelSelection};
use crate::rate_gate::RateGate;
use crate::sandbox::SandboxProvider;
use crate::session::SessionHandle;
use crate::workspace::Workspace;

/// Everything a session's tasks need to run: state handle, workspace,
/// providers, and configuration. Cheap to share via `Arc`.
pub struct SessionContext {
    /// Per-session state and event log.
    pub handle: Arc<SessionHandle>,
    /// The session's directory tree.
    pub workspace: Workspace,
    /// Engine configuration.
    pub config: EngineConfig,
    /// Models for the five LLM roles.
    pub models: ModelSelection,
    /// LLM provider shared by all roles.
    pub llm: Arc<dyn LlmProvider>,
    /// Serialised search queue.
    pub rate_gate: RateGate,
    /// Python sandbox.
    pub sandbox: Arc<dyn SandboxProvider>,
    /// The research query.
    pub query: String,
    /// Opaque clarification context, when the client supplied one.
    pub clarification: Option<String>,
    /// Join handles of spawned sub-agent tasks, drained on shutdown.
    pub agent_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionContext {
    /// Registers a spawned sub-agent task for later draining.
    pub fn track_agent_task(&self, task: JoinHandle<()>) {
        self.agent_tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(task);
    }

    /// Takes all tracked sub-agent task handles.
    #[must_use]
    pub fn take_agent_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(
            &mut *self
                .agent_tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }
}
