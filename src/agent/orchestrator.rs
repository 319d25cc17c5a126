//! Top-level orchestrator loop.
//!
//! Drives the orchestrator LLM with the coordination tool catalog:
//! plan → delegate → wait → collect → write report. Each streamed turn is
//! one step; tool calls are registered against the orchestrator
//! pseudo-agent the moment the provider starts emitting them, dispatched
//! when their arguments complete, and answered with tool-result messages.
//! The loop ends when the model stops calling tools or the step cap is
//! reached.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message::{ChatRequest, ChatStreamEvent, assistant_message, tool_message};
use super::message::{system_message, user_message};
use super::prompt::{ORCHESTRATOR_SYSTEM_PROMPT, build_orchestrator_user_message};
use super::step::run_streaming_step;
use crate::context::SessionContext;
use crate::error::EngineError;
use crate::session::model::ORCHESTRATOR_AGENT_ID;
use crate::session::{AgentStatus, SessionStatus, StepToolCall};
use crate::tools::catalog::orchestrator_tools;
use crate::tools::orchestrator::OrchestratorToolExecutor;
use crate::tools::{begin_call, input_value};
use crate::workspace::{ORCHESTRATOR_WORKLOG, REPORT_FILE};

/// The orchestrator for one session.
pub struct Orchestrator {
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Creates the orchestrator bound to the session's cancellation token.
    #[must_use]
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        let cancel = ctx.handle.cancel_token();
        Self { ctx, cancel }
    }

    /// Runs the session end-to-end and returns the report text.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Orchestration`] when the provider produced no
    /// steps at all (a provider-side problem, never success), propagates
    /// stream errors, and returns [`EngineError::Cancelled`] on
    /// cancellation.
    pub async fn run(&self) -> Result<String, EngineError> {
        let _ = self.ctx.handle.update_status(SessionStatus::Planning);

        let mut messages = vec![
            system_message(ORCHESTRATOR_SYSTEM_PROMPT),
            user_message(&build_orchestrator_user_message(
                &self.ctx.query,
                self.ctx.clarification.as_deref(),
            )),
        ];
        let mut executor = OrchestratorToolExecutor::new(Arc::clone(&self.ctx), self.cancel.clone());

        let mut steps_with_tools = 0usize;
        let mut total_tool_calls = 0usize;

        for step_number in 1..=self.ctx.config.orchestrator_step_cap {
            let request = ChatRequest {
                model: self.ctx.models.orchestrator.clone(),
                messages: messages.clone(),
                temperature: Some(0.1),
                max_tokens: Some(4096),
                tools: orchestrator_tools(),
            };

            // Register each tool call against the pseudo-agent as soon as
            // the provider starts emitting it; input arrives later.
            let handle = Arc::clone(&self.ctx.handle);
            let mut registered: HashMap<String, String> = HashMap::new();
            let mut next_index = 0usize;
            let outcome = run_streaming_step(
                self.ctx.llm.as_ref(),
                &request,
                &self.cancel,
                |event| {
                    if let ChatStreamEvent::ToolCallStarted { id, name } = event {
                        let stored = begin_call(
                            &handle,
                            ORCHESTRATOR_AGENT_ID,
                            id,
                            name,
                            serde_json::Value::Null,
                            step_number,
                            next_index,
                            None,
                        );
                        registered.insert(id.clone(), stored);
                        next_index += 1;
                    }
                },
            )
            .await?;

            if !outcome.text.is_empty() {
                self.append_worklog(step_number, &outcome.text).await;
            }

            if outcome.tool_calls.is_empty() {
                debug!(step_number, "orchestrator produced a final message");
                break;
            }

            steps_with_tools += 1;
            total_tool_calls += outcome.tool_calls.len();

            let step_tool_calls: Vec<StepToolCall> = outcome
                .tool_calls
                .iter()
                .map(|call| StepToolCall {
                    tool_name: call.name.clone(),
                    input: input_value(&call.arguments),
                })
                .collect();
            let _ = self
                .ctx
                .handle
                .add_orchestrator_step(step_number, step_tool_calls);

            messages.push(assistant_message(&outcome.text, outcome.tool_calls.clone()));
            for (index, call) in outcome.tool_calls.iter().enumerate() {
                let pre_registered = registered.remove(&call.id);
                let dispatch = executor
                    .dispatch(call, step_number, index, pre_registered)
                    .await;
                messages.push(tool_message(&call.id, &dispatch.content));
            }
        }

        if steps_with_tools == 0 && total_tool_calls == 0 {
            return Err(EngineError::Orchestration {
                message: "orchestrator executed zero steps and no tool calls; \
                          treating the run as a provider failure"
                    .to_string(),
            });
        }

        let report_path = self.ctx.workspace.session_dir().join(REPORT_FILE);
        let report = tokio::fs::read_to_string(&report_path)
            .await
            .unwrap_or_default();
        if report.trim().is_empty() {
            return Err(EngineError::Orchestration {
                message: "orchestrator finished without writing a report".to_string(),
            });
        }
        Ok(report)
    }

    /// Appends the step's streamed assistant text to the audit worklog.
    /// Never read back programmatically.
    async fn append_worklog(&self, step_number: usize, text: &str) {
        use tokio::io::AsyncWriteExt;
        let path = self.ctx.workspace.session_dir().join(ORCHESTRATOR_WORKLOG);
        let entry = format!("\n## Step {step_number}\n\n{text}\n");
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(entry.as_bytes()).await
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, "orchestrator worklog append failed");
        }
    }
}

/// Runs a session to its terminal status: executes the orchestrator,
/// propagates failure/cancellation, drains sub-agent tasks, and schedules
/// workspace cleanup.
pub async fn run_session(ctx: Arc<SessionContext>) {
    let session_id = ctx.handle.session_id().to_string();
    let orchestrator = Orchestrator::new(Arc::clone(&ctx));
    let result = orchestrator.run().await;

    // The session token is the broadcast signal for every child task.
    ctx.handle.cancel_token().cancel();
    for task in ctx.take_agent_tasks() {
        if let Err(e) = task.await {
            warn!(%session_id, error = %e, "sub-agent task join failed");
        }
    }

    match result {
        Ok(_) => {
            let _ = ctx
                .handle
                .update_agent_status(ORCHESTRATOR_AGENT_ID, AgentStatus::Completed, None);
            let _ = ctx.handle.update_status(SessionStatus::Completed);
            info!(%session_id, "session completed");
        }
        Err(e) => {
            let message = match &e {
                EngineError::Cancelled => "cancelled".to_string(),
                other => other.to_string(),
            };
            error!(%session_id, error = %message, "session failed");
            ctx.handle
                .emit_error("orchestrator", message.clone(), None);
            let _ = ctx.handle.update_agent_status(
                ORCHESTRATOR_AGENT_ID,
                AgentStatus::Failed,
                Some(message),
            );
            let _ = ctx.handle.update_status(SessionStatus::Failed);
        }
    }

    if let Some(delay) = ctx.config.session_cleanup_delay {
        ctx.workspace.schedule_cleanup(delay);
    }
}
