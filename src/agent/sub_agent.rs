//! Sub-agent execution loop.
//!
//! A sub-agent runs one research task to completion: it drives its LLM
//! with the research tool catalog, then validates that `results.md` was
//! actually produced. An attempt whose results file is still the
//! placeholder (or nearly empty) is retried with a validation-failure
//! message injected into the conversation; the third failed attempt marks
//! the agent failed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message::{ChatMessage, ChatRequest, assistant_message, system_message, tool_message, user_message};
use super::prompt::{
    RESULTS_PLACEHOLDER, SUB_AGENT_SYSTEM_PROMPT, build_context_files_message,
    build_sub_agent_task_message, build_validation_failed_message,
};
use super::retry::chat_with_retry;
use crate::context::SessionContext;
use crate::error::EngineError;
use crate::session::{AgentRecord, AgentStatus};
use crate::tools::catalog::sub_agent_tools;
use crate::tools::sub_agent::SubAgentToolExecutor;
use crate::workspace::{RESULTS_FILE, STATUS_FILE, WORKLOG_FILE};

/// Registers a new sub-agent, prepares its workspace, and starts its task.
///
/// Returns the join handle of the background task.
///
/// # Errors
///
/// Returns [`EngineError`] if the workspace cannot be prepared or the
/// agent cannot be registered.
pub async fn spawn_sub_agent(
    ctx: Arc<SessionContext>,
    agent_id: String,
    task: String,
    description: Option<String>,
    context_files: Vec<(String, String)>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, EngineError> {
    let agent_dir = ctx.workspace.create_agent_dirs(&agent_id).await?;
    tokio::fs::write(
        agent_dir.join(WORKLOG_FILE),
        format!("# Worklog for {agent_id}\n\nTask: {task}\n"),
    )
    .await?;
    tokio::fs::write(agent_dir.join(RESULTS_FILE), RESULTS_PLACEHOLDER).await?;

    let mut record = AgentRecord::new(&agent_id, &task, AgentStatus::Pending);
    record.description = description;
    ctx.handle.add_agent(record)?;
    write_status_file(&agent_dir, &agent_id, AgentStatus::Pending, None).await;

    let handle = tokio::spawn(run_sub_agent(
        ctx,
        agent_id,
        task,
        context_files,
        agent_dir,
        cancel,
    ));
    Ok(handle)
}

async fn run_sub_agent(
    ctx: Arc<SessionContext>,
    agent_id: String,
    task: String,
    context_files: Vec<(String, String)>,
    agent_dir: PathBuf,
    cancel: CancellationToken,
) {
    let _ = ctx
        .handle
        .update_agent_status(&agent_id, AgentStatus::Running, None);
    write_status_file(&agent_dir, &agent_id, AgentStatus::Running, None).await;

    let mut messages = vec![system_message(SUB_AGENT_SYSTEM_PROMPT)];
    if !context_files.is_empty() {
        messages.push(system_message(&build_context_files_message(&context_files)));
    }
    messages.push(user_message(&build_sub_agent_task_message(&task)));

    let mut executor = SubAgentToolExecutor::new(
        Arc::clone(&ctx),
        agent_id.clone(),
        agent_dir.clone(),
        cancel.clone(),
    );

    let max_attempts = ctx.config.sub_agent_max_attempts;
    let mut step_number = 0usize;
    let mut attempts_used = 0u32;
    let failure: EngineError = 'attempts: {
        for attempt in 1..=max_attempts {
            attempts_used = attempt;
            if let Err(e) = run_attempt(
                &ctx,
                &agent_id,
                &mut messages,
                &mut executor,
                &mut step_number,
                &cancel,
            )
            .await
            {
                break 'attempts e;
            }

            let valid = validate_results(
                &agent_dir.join(RESULTS_FILE),
                ctx.config.results_min_chars,
            )
            .await;
            if valid {
                let _ = ctx
                    .handle
                    .update_agent_status(&agent_id, AgentStatus::Completed, None);
                write_status_file(&agent_dir, &agent_id, AgentStatus::Completed, None).await;
                info!(%agent_id, attempt, "sub-agent completed");
                return;
            }

            if attempt < max_attempts {
                warn!(%agent_id, attempt, "results validation failed, retrying");
                let _ = ctx
                    .handle
                    .update_agent_status(&agent_id, AgentStatus::Retrying, None);
                messages.push(system_message(&build_validation_failed_message(
                    attempt,
                    ctx.config.results_min_chars,
                )));
                let _ = ctx
                    .handle
                    .update_agent_status(&agent_id, AgentStatus::Running, None);
            }
        }
        EngineError::Orchestration {
            message: format!("results validation failed after {max_attempts} attempts"),
        }
    };

    let (error_text, error_type) = match &failure {
        EngineError::Cancelled => ("cancelled".to_string(), "unknown"),
        other => (other.to_string(), other.class().as_str()),
    };
    let _ = ctx.handle.update_agent_status(
        &agent_id,
        AgentStatus::Failed,
        Some(error_text.clone()),
    );
    write_status_file(&agent_dir, &agent_id, AgentStatus::Failed, Some(&error_text)).await;
    ctx.handle
        .emit_agent_failed(&agent_id, error_text, error_type, attempts_used);
}

/// One attempt: LLM turns with tool dispatch until the model stops calling
/// tools or the per-attempt step cap is reached.
async fn run_attempt(
    ctx: &Arc<SessionContext>,
    agent_id: &str,
    messages: &mut Vec<ChatMessage>,
    executor: &mut SubAgentToolExecutor,
    step_number: &mut usize,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    for _ in 0..ctx.config.sub_agent_step_cap {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        *step_number += 1;

        let request = ChatRequest {
            model: ctx.models.sub_agent.clone(),
            messages: messages.clone(),
            temperature: Some(0.0),
            max_tokens: Some(4096),
            tools: sub_agent_tools(),
        };
        let response = chat_with_retry(ctx.llm.as_ref(), &request, cancel).await?;

        if response.tool_calls.is_empty() {
            debug!(agent_id, step = *step_number, "sub-agent finished its turn");
            return Ok(());
        }

        messages.push(assistant_message(&response.content, response.tool_calls.clone()));
        for (index, call) in response.tool_calls.iter().enumerate() {
            let dispatch = executor.dispatch(call, *step_number, index).await;
            messages.push(tool_message(&call.id, &dispatch.content));
            messages.extend(dispatch.extra_messages);
        }
    }
    debug!(agent_id, "sub-agent hit its step cap");
    Ok(())
}

/// A results file is valid when it is not the seeded placeholder and holds
/// at least `min_chars` characters of content beyond its header line.
async fn validate_results(path: &Path, min_chars: usize) -> bool {
    let Ok(content) = tokio::fs::read_to_string(path).await else {
        return false;
    };
    if content == RESULTS_PLACEHOLDER {
        return false;
    }
    let mut lines = content.lines().skip_while(|line| line.trim().is_empty());
    let first = lines.next().unwrap_or_default();
    let mut body = lines.collect::<Vec<_>>().join("\n");
    if !first.starts_with('#') {
        body = format!("{first}\n{body}");
    }
    body.trim().chars().count() >= min_chars
}

async fn write_status_file(
    agent_dir: &Path,
    agent_id: &str,
    status: AgentStatus,
    error: Option<&str>,
) {
    let body = json!({
        "agent_id": agent_id,
        "status": status.to_string(),
        "updated_at": Utc::now().to_rfc3339(),
        "error": error,
    });
    let rendered = serde_json::to_string_pretty(&body).unwrap_or_default();
    if let Err(e) = tokio::fs::write(agent_dir.join(STATUS_FILE), rendered).await {
        warn!(agent_id, error = %e, "status file write failed");
    }
}
