//! Orchestrator tool executor.
//!
//! Implements the coordination tools: planning, agent spawning and
//! awaiting, result collection, plan updates, report writing, and scoped
//! session-directory file access. All calls are recorded against the
//! orchestrator pseudo-agent.

use std::path::Path;
use std::sync::Arc;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::types::{
    FileInput, FileOperation, GetAgentResultInput, PlanMode, SpawnAgentInput, ToolInput,
    ToolOutcome, UpdatePlanInput, WaitForAgentsInput, WriteReportInput,
};
use super::{ToolDispatch, begin_call, finish_call, input_value, outcome_content};
use crate::agent::message::{ChatRequest, ContentPart, LlmToolCall, system_message};
use crate::agent::message::user_parts_message;
use crate::agent::prompt::{
    PLANNER_SYSTEM_PROMPT, REPORT_WRITER_SYSTEM_PROMPT, build_agent_results_section,
    build_chart_reference_guide, build_planner_user_message, build_report_instructions,
};
use crate::agent::retry::chat_with_retry;
use crate::agent::sub_agent::spawn_sub_agent;
use crate::context::SessionContext;
use crate::error::{ToolErrorCode, ToolFailure};
use crate::session::model::ORCHESTRATOR_AGENT_ID;
use crate::session::{PlanStep, SessionStatus};
use crate::workspace::{CHARTS_DIR, PLAN_FILE, REPORT_FILE, RESULTS_FILE};

/// Fallback poll interval backing up the status-change notification in
/// `wait_for_agents`.
const WAIT_POLL_INTERVAL_MS: u64 = 500;

/// The persisted plan document (`orchestrator_plan.json`).
#[derive(Debug, Serialize, Deserialize)]
pub struct PlanDocument {
    pub session_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategic_perspective: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub steps: Vec<PlanStep>,
}

/// Executes coordination tool calls for the orchestrator.
pub struct OrchestratorToolExecutor {
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl OrchestratorToolExecutor {
    /// Creates an executor bound to the session.
    #[must_use]
    pub fn new(ctx: Arc<SessionContext>, cancel: CancellationToken) -> Self {
        Self { ctx, cancel }
    }

    /// Dispatches one tool call, recording its lifecycle against the
    /// orchestrator pseudo-agent. `pre_registered` carries the stored call
    /// ID when the call was already registered at stream time.
    pub async fn dispatch(
        &mut self,
        call: &LlmToolCall,
        step_number: usize,
        index_in_step: usize,
        pre_registered: Option<String>,
    ) -> ToolDispatch {
        let input = ToolInput::parse(&call.name, &call.arguments);
        let description = input.as_ref().ok().and_then(ToolInput::description);
        let input_json = input_value(&call.arguments);
        let stored_id = pre_registered.unwrap_or_else(|| {
            begin_call(
                &self.ctx.handle,
                ORCHESTRATOR_AGENT_ID,
                &call.id,
                &call.name,
                input_json.clone(),
                step_number,
                index_in_step,
                description,
            )
        });

        let outcome: ToolOutcome = match input {
            Err(failure) => Err(failure),
            Ok(input) => self.execute(input).await,
        };

        finish_call(
            &self.ctx.handle,
            ORCHESTRATOR_AGENT_ID,
            &stored_id,
            &outcome,
            Some(input_json),
        );
        ToolDispatch {
            content: outcome_content(&outcome),
            extra_messages: Vec::new(),
        }
    }

    async fn execute(&self, input: ToolInput) -> ToolOutcome {
        match input {
            ToolInput::GeneratePlan => self.generate_plan().await,
            ToolInput::SpawnAgent(input) => self.spawn_agent(input).await,
            ToolInput::WaitForAgents(input) => self.wait_for_agents(input).await,
            ToolInput::GetAgentResult(input) => self.get_agent_result(&input).await,
            ToolInput::UpdatePlan(input) => self.update_plan(input).await,
            ToolInput::WriteReport(input) => self.write_report(input).await,
            ToolInput::File(input) => self.file(input).await,
            _ => Err(ToolFailure::new(
                ToolErrorCode::UnknownError,
                "tool not available to the orchestrator",
            )
            .with_action("Use only the tools in your catalog.")),
        }
    }

    // -----------------------------------------------------------------------
    // generate_plan
    // -----------------------------------------------------------------------

    /// Invokes the planner model and persists its strategic perspective.
    async fn generate_plan(&self) -> ToolOutcome {
        let request = ChatRequest {
            model: self.ctx.models.planner.clone(),
            messages: vec![
                system_message(PLANNER_SYSTEM_PROMPT),
                crate::agent::message::user_message(&build_planner_user_message(
                    &self.ctx.query,
                    self.ctx.clarification.as_deref(),
                )),
            ],
            temperature: Some(0.3),
            max_tokens: Some(1024),
            tools: Vec::new(),
        };

        let response = chat_with_retry(self.ctx.llm.as_ref(), &request, &self.cancel)
            .await
            .map_err(|e| ToolFailure::from_engine_error(&e))?;

        let perspective = response.content.trim().to_string();
        if perspective.is_empty() {
            return Err(ToolFailure::new(
                ToolErrorCode::ApiError,
                "planner returned empty output",
            )
            .with_action("Retry generate_plan once; if it fails again, plan the research yourself.")
            .retryable());
        }

        self.ctx.handle.set_strategic_perspective(perspective.clone());
        self.persist_plan_document().await?;
        Ok(json!({ "strategic_perspective": perspective }))
    }

    // -----------------------------------------------------------------------
    // spawn_agent
    // -----------------------------------------------------------------------

    /// Allocates the next agent ID, prepares its workspace, and starts its
    /// task in the background.
    async fn spawn_agent(&self, input: SpawnAgentInput) -> ToolOutcome {
        if input.task.trim().is_empty() {
            return Err(ToolFailure::new(
                ToolErrorCode::ValidationFailed,
                "task must not be empty",
            )
            .with_action("Provide a complete, self-contained task description.")
            .retryable());
        }

        if self.ctx.handle.agent_count() >= self.ctx.config.max_agents {
            return Err(ToolFailure::new(
                ToolErrorCode::AgentLimitReached,
                format!(
                    "the per-session limit of {} agents is reached",
                    self.ctx.config.max_agents
                ),
            )
            .with_action("Wait for running agents and reuse their results instead of spawning."));
        }

        // Context files are read up-front so the agent task owns plain strings.
        let mut context_files = Vec::with_capacity(input.context_files.len());
        for relative in &input.context_files {
            let path = self
                .ctx
                .workspace
                .resolve_under(self.ctx.workspace.session_dir(), relative)
                .map_err(|_| {
                    ToolFailure::new(
                        ToolErrorCode::FileAccessDenied,
                        format!("context file {relative} is outside the session directory"),
                    )
                    .with_action("Reference only files inside the session workspace.")
                })?;
            let content = tokio::fs::read_to_string(&path).await.map_err(|_| {
                ToolFailure::new(
                    ToolErrorCode::FileNotFound,
                    format!("context file {relative} does not exist"),
                )
                .with_action("Spawn without the missing file or create it first.")
            })?;
            context_files.push((relative.clone(), content));
        }

        let agent_id = self.ctx.handle.allocate_agent_id();
        let task_handle = spawn_sub_agent(
            Arc::clone(&self.ctx),
            agent_id.clone(),
            input.task.clone(),
            input.description.clone(),
            context_files,
            self.cancel.child_token(),
        )
        .await
        .map_err(|e| ToolFailure::from_engine_error(&e))?;
        self.ctx.track_agent_task(task_handle);

        // First spawned agent moves the session from planning to executing.
        let snapshot = self.ctx.handle.snapshot();
        if snapshot.status == SessionStatus::Planning
            || snapshot.status == SessionStatus::Initializing
        {
            let _ = self.ctx.handle.update_status(SessionStatus::Executing);
        }

        info!(%agent_id, "sub-agent spawned");
        Ok(json!({ "agent_id": agent_id, "status": "pending" }))
    }

    // -----------------------------------------------------------------------
    // wait_for_agents
    // -----------------------------------------------------------------------

    /// Blocks until all named agents are terminal or the timeout elapses.
    /// Reports agents in the order they were named in the call.
    async fn wait_for_agents(&self, input: WaitForAgentsInput) -> ToolOutcome {
        if input.agent_ids.is_empty() {
            return Err(ToolFailure::new(
                ToolErrorCode::ValidationFailed,
                "agent_ids must not be empty",
            )
            .retryable());
        }
        for agent_id in &input.agent_ids {
            if self.ctx.handle.agent(agent_id).is_none() {
                return Err(ToolFailure::new(
                    ToolErrorCode::AgentNotFound,
                    format!("no agent named {agent_id}"),
                )
                .with_action("Wait only for agent ids returned by spawn_agent."));
            }
        }

        let timeout = input
            .timeout_seconds
            .map_or(self.ctx.config.wait_for_agents_timeout, |s| {
                std::time::Duration::from_secs(s)
            });
        let deadline = Instant::now() + timeout;

        let timed_out = loop {
            let all_terminal = input.agent_ids.iter().all(|id| {
                self.ctx
                    .handle
                    .agent(id)
                    .is_some_and(|a| a.status.is_terminal())
            });
            if all_terminal {
                break false;
            }
            if Instant::now() >= deadline {
                break true;
            }
            tokio::select! {
                () = self.ctx.handle.agent_status_changed() => {}
                () = tokio::time::sleep(std::time::Duration::from_millis(WAIT_POLL_INTERVAL_MS)) => {}
                () = tokio::time::sleep_until(deadline) => {}
                () = self.cancel.cancelled() => {
                    return Err(ToolFailure::new(
                        ToolErrorCode::UnknownError,
                        "cancelled while waiting for agents",
                    ));
                }
            }
        };

        let agents: Vec<serde_json::Value> = input
            .agent_ids
            .iter()
            .filter_map(|id| self.ctx.handle.agent(id))
            .map(|agent| {
                json!({
                    "agent_id": agent.agent_id,
                    "status": agent.status.to_string(),
                    "error": agent.error,
                })
            })
            .collect();

        Ok(json!({
            "success": !timed_out,
            "timed_out": timed_out,
            "agents": agents,
        }))
    }

    // -----------------------------------------------------------------------
    // get_agent_result
    // -----------------------------------------------------------------------

    /// Reads a terminal agent's results and copies them (plus chart images)
    /// into the shared artifacts directory.
    async fn get_agent_result(&self, input: &GetAgentResultInput) -> ToolOutcome {
        let agent = self.ctx.handle.agent(&input.agent_id).ok_or_else(|| {
            ToolFailure::new(
                ToolErrorCode::AgentNotFound,
                format!("no agent named {}", input.agent_id),
            )
            .with_action("Use an agent id returned by spawn_agent.")
        })?;
        if !agent.status.is_terminal() {
            return Err(ToolFailure::new(
                ToolErrorCode::AgentNotReady,
                format!("{} is still {}", input.agent_id, agent.status),
            )
            .with_action("Call wait_for_agents for this agent first, then retry.")
            .retryable());
        }

        let agent_dir = self.ctx.workspace.agent_dir(&input.agent_id);
        let results_path = agent_dir.join(RESULTS_FILE);
        let results = tokio::fs::read_to_string(&results_path)
            .await
            .map_err(|_| {
                ToolFailure::new(
                    ToolErrorCode::FileNotFound,
                    format!("{} produced no results file", input.agent_id),
                )
                .with_action("Treat this agent as failed and continue with the others.")
            })?;

        let mut to_copy = vec![results_path];
        let charts_dir = agent_dir.join(CHARTS_DIR);
        if let Ok(mut entries) = tokio::fs::read_dir(&charts_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("png" | "jpg" | "jpeg")
                ) {
                    to_copy.push(path);
                }
            }
        }
        to_copy[1..].sort();

        let artifacts = self
            .ctx
            .workspace
            .copy_artifacts(&input.agent_id, &to_copy)
            .await
            .map_err(|e| {
                ToolFailure::new(ToolErrorCode::UnknownError, format!("artifact copy failed: {e}"))
                    .retryable()
            })?;

        debug!(agent_id = %input.agent_id, artifacts = artifacts.len(), "agent result collected");
        Ok(json!({
            "agent_id": input.agent_id,
            "status": agent.status.to_string(),
            "results": results,
            "artifacts": artifacts,
        }))
    }

    // -----------------------------------------------------------------------
    // update_plan
    // -----------------------------------------------------------------------

    async fn update_plan(&self, input: UpdatePlanInput) -> ToolOutcome {
        if input.steps.is_empty() {
            return Err(ToolFailure::new(
                ToolErrorCode::ValidationFailed,
                "steps must not be empty",
            )
            .retryable());
        }
        let replace = !matches!(input.mode, Some(PlanMode::Append));
        let steps = self
            .ctx
            .handle
            .update_plan(input.steps, replace)
            .map_err(|e| ToolFailure::from_engine_error(&e))?;
        self.persist_plan_document().await?;
        Ok(json!({ "success": true, "total_steps": steps.len() }))
    }

    // -----------------------------------------------------------------------
    // write_report
    // -----------------------------------------------------------------------

    /// Assembles the multimodal report-writer request (chart guide, inline
    /// charts, concatenated findings, final instructions), persists the
    /// returned markdown verbatim, and returns a terse confirmation. The
    /// report body deliberately never flows back through the orchestrator.
    async fn write_report(&self, input: WriteReportInput) -> ToolOutcome {
        if input.agent_results.is_empty() {
            return Err(ToolFailure::new(
                ToolErrorCode::ValidationFailed,
                "agent_results must not be empty",
            )
            .retryable());
        }

        let mut chart_paths = Vec::new();
        let mut chart_images = Vec::new();
        let mut findings = Vec::new();

        for agent_ref in &input.agent_results {
            let artifacts_dir = self.ctx.workspace.artifacts_dir(&agent_ref.agent_id);
            let results = match tokio::fs::read_to_string(artifacts_dir.join(RESULTS_FILE)).await {
                Ok(text) => text,
                // Fall back to the agent's own copy when collection was skipped.
                Err(_) => tokio::fs::read_to_string(
                    self.ctx
                        .workspace
                        .agent_dir(&agent_ref.agent_id)
                        .join(RESULTS_FILE),
                )
                .await
                .map_err(|_| {
                    ToolFailure::new(
                        ToolErrorCode::AgentNotReady,
                        format!("no collected results for {}", agent_ref.agent_id),
                    )
                    .with_action("Call get_agent_result for every agent before write_report.")
                    .retryable()
                })?,
            };
            findings.push((agent_ref.agent_id.clone(), agent_ref.task.clone(), results));

            let mut entries = match tokio::fs::read_dir(&artifacts_dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            let mut image_paths = Vec::new();
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("png" | "jpg" | "jpeg")
                ) {
                    image_paths.push(path);
                }
            }
            image_paths.sort();
            for path in image_paths {
                let Ok(bytes) = tokio::fs::read(&path).await else {
                    continue;
                };
                let mime = match path.extension().and_then(|e| e.to_str()) {
                    Some("jpg" | "jpeg") => "image/jpeg",
                    _ => "image/png",
                };
                let name = path.file_name().map(|n| n.to_string_lossy().to_string());
                chart_paths.push(format!(
                    "artifacts/{}/{}",
                    agent_ref.agent_id,
                    name.unwrap_or_default()
                ));
                chart_images.push(format!(
                    "data:{mime};base64,{}",
                    base64::engine::general_purpose::STANDARD.encode(&bytes)
                ));
            }
        }

        let mut parts = vec![ContentPart::Text {
            text: build_chart_reference_guide(&chart_paths),
        }];
        parts.extend(
            chart_images
                .into_iter()
                .map(|image| ContentPart::Image { image }),
        );
        parts.push(ContentPart::Text {
            text: build_agent_results_section(&findings),
        });
        parts.push(ContentPart::Text {
            text: build_report_instructions(&input.query, input.clarification.as_deref()),
        });

        let request = ChatRequest {
            model: self.ctx.models.report_writer.clone(),
            messages: vec![
                system_message(REPORT_WRITER_SYSTEM_PROMPT),
                user_parts_message(parts),
            ],
            temperature: Some(0.2),
            max_tokens: Some(8192),
            tools: Vec::new(),
        };

        let response = chat_with_retry(self.ctx.llm.as_ref(), &request, &self.cancel)
            .await
            .map_err(|e| ToolFailure::from_engine_error(&e))?;

        let report = response.content;
        if report.trim().is_empty() {
            return Err(ToolFailure::new(
                ToolErrorCode::ApiError,
                "report writer returned empty output",
            )
            .with_action("Retry write_report once.")
            .retryable());
        }

        let report_path = self.ctx.workspace.session_dir().join(REPORT_FILE);
        tokio::fs::write(&report_path, report.as_bytes())
            .await
            .map_err(|e| {
                ToolFailure::new(ToolErrorCode::UnknownError, format!("report write failed: {e}"))
                    .retryable()
            })?;

        info!(bytes = report.len(), "final report written");
        Ok(json!({
            "success": true,
            "message": format!("Report written to {REPORT_FILE} ({} bytes)", report.len()),
        }))
    }

    // -----------------------------------------------------------------------
    // file
    // -----------------------------------------------------------------------

    /// Scoped read/write/append anywhere under the session directory.
    async fn file(&self, input: FileInput) -> ToolOutcome {
        let path = self
            .ctx
            .workspace
            .resolve_under(self.ctx.workspace.session_dir(), &input.path)
            .map_err(|_| {
                ToolFailure::new(
                    ToolErrorCode::FileAccessDenied,
                    format!("path {} is outside the session directory", input.path),
                )
                .with_action("Use a path relative to the session directory.")
            })?;

        match input.operation {
            FileOperation::Read => match tokio::fs::read_to_string(&path).await {
                Ok(content) => Ok(json!({ "content": content })),
                Err(_) => Err(ToolFailure::new(
                    ToolErrorCode::FileNotFound,
                    format!("{} does not exist", input.path),
                )),
            },
            FileOperation::Write | FileOperation::Append => {
                if let Some(parent) = path.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                let content = input.content.unwrap_or_default();
                let io_result = if input.operation == FileOperation::Write {
                    tokio::fs::write(&path, content.as_bytes()).await
                } else {
                    append(&path, content.as_bytes()).await
                };
                io_result.map_err(|e| {
                    ToolFailure::new(ToolErrorCode::UnknownError, format!("write failed: {e}"))
                        .retryable()
                })?;
                Ok(json!({ "success": true, "path": input.path, "bytes": content.len() }))
            }
        }
    }

    /// Writes `orchestrator_plan.json` from the current session snapshot.
    async fn persist_plan_document(&self) -> Result<(), ToolFailure> {
        let snapshot = self.ctx.handle.snapshot();
        let document = PlanDocument {
            session_id: snapshot.session_id.clone(),
            created: snapshot.created_at,
            updated: Utc::now(),
            query: snapshot.query.clone(),
            clarification_context: snapshot.clarification.clone(),
            strategic_perspective: snapshot.strategic_perspective.clone(),
            reasoning: None,
            steps: snapshot.ordered_plan(),
        };
        let body = serde_json::to_string_pretty(&document).map_err(|e| {
            ToolFailure::new(ToolErrorCode::UnknownError, format!("plan serialization failed: {e}"))
        })?;
        tokio::fs::write(self.ctx.workspace.session_dir().join(PLAN_FILE), body)
            .await
            .map_err(|e| {
                ToolFailure::new(ToolErrorCode::UnknownError, format!("plan write failed: {e}"))
            })
    }
}

async fn append(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await
}
