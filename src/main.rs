//! `delver` CLI: run one research session end-to-end from the terminal.
//!
//! Events stream to stderr as they happen; the final report path prints to
//! stdout when the session completes.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use delver::engine::SessionRequest;
use delver::session::EventPayload;
use delver::{ApiKeys, Engine, EngineConfig, ModelSelection, SessionStatus};

#[derive(Parser)]
#[command(name = "delver", version, about = "Deep research from the command line")]
struct Cli {
    /// The research query.
    query: String,

    /// Clarification context to pass alongside the query.
    #[arg(long)]
    clarification: Option<String>,

    /// Model for the orchestrator role.
    #[arg(long, env = "DELVER_ORCHESTRATOR_MODEL")]
    orchestrator_model: Option<String>,

    /// Model for the sub-agent role.
    #[arg(long, env = "DELVER_SUB_AGENT_MODEL")]
    sub_agent_model: Option<String>,

    /// LLM provider API key.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    llm_key: String,

    /// Search provider API key.
    #[arg(long, env = "EXA_API_KEY", hide_env_values = true)]
    search_key: String,

    /// Sandbox provider API key.
    #[arg(long, env = "E2B_API_KEY", hide_env_values = true)]
    sandbox_key: String,

    /// Keep the session workspace instead of scheduling deletion.
    #[arg(long)]
    keep_workspace: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("delver=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config_builder = EngineConfig::builder().from_env();
    if cli.keep_workspace {
        config_builder = config_builder.session_cleanup_delay(None);
    }
    let config = config_builder.build();
    let reports_dir = config.reports_dir.clone();

    let mut models = ModelSelection::default();
    if let Some(model) = cli.orchestrator_model {
        models.orchestrator.clone_from(&model);
        models.planner.clone_from(&model);
        models.report_writer = model;
    }
    if let Some(model) = cli.sub_agent_model {
        models.sub_agent.clone_from(&model);
        models.summarizer = model;
    }

    let engine = Engine::new(config);
    let session_id = match engine
        .create_session(SessionRequest {
            query: cli.query,
            clarification: cli.clarification,
            models,
            api_keys: ApiKeys {
                llm: cli.llm_key,
                search: cli.search_key,
                sandbox: cli.sandbox_key,
            },
        })
        .await
    {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "session creation failed");
            return ExitCode::FAILURE;
        }
    };
    info!(%session_id, "session started");

    let Ok(mut events) = engine.subscribe(&session_id) else {
        error!("subscription failed");
        return ExitCode::FAILURE;
    };

    let mut final_status = SessionStatus::Failed;
    while let Some(event) = events.next().await {
        match &event.payload {
            EventPayload::SessionStatusChange { status } => {
                info!(%status, "session status");
                final_status = match status.as_str() {
                    "completed" => SessionStatus::Completed,
                    _ => SessionStatus::Failed,
                };
            }
            EventPayload::AgentSpawned { agent_id, description, .. } => {
                info!(%agent_id, description = description.as_deref().unwrap_or(""), "agent spawned");
            }
            EventPayload::AgentStatusChange { agent_id, status, .. } => {
                info!(%agent_id, %status, "agent status");
            }
            EventPayload::ToolCall { agent_id, tool_name, .. } => {
                info!(%agent_id, %tool_name, "tool call");
            }
            EventPayload::AgentFailed { agent_id, error, error_type, attempts } => {
                error!(%agent_id, %error, %error_type, attempts = *attempts, "agent failed");
            }
            EventPayload::Error { source, error, .. } => {
                error!(%source, %error, "error");
            }
            _ => {}
        }
    }

    if final_status == SessionStatus::Completed {
        println!(
            "{}",
            reports_dir
                .join(&session_id)
                .join("final_report.md")
                .display()
        );
        ExitCode::SUCCESS
    } else {
        match engine.report(&session_id).await {
            Ok(partial) if !partial.trim().is_empty() => {
                error!("session failed; partial report follows on stdout");
                println!("{partial}");
            }
            _ => error!("session failed with no report"),
        }
        ExitCode::FAILURE
    }
}
