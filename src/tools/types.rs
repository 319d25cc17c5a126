//! Runtime-tagged tool payloads.
//!
//! The LLM supplies each tool's arguments as free-form JSON; [`ToolInput`]
//! maps them to a typed variant by tool name before any execution happens,
//! so malformed input is rejected at the dispatch boundary with a
//! structured failure rather than deep inside a tool.

use serde::{Deserialize, Serialize};

use crate::error::{ToolErrorCode, ToolFailure};

/// `file` tool operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Read,
    Write,
    Append,
}

/// Input for the `file` tool (both families).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInput {
    pub operation: FileOperation,
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Input for `web_search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchInput {
    pub query: String,
    #[serde(default)]
    pub num_results: Option<usize>,
    #[serde(default)]
    pub search_type: Option<String>,
    #[serde(default)]
    pub use_autoprompt: Option<bool>,
    #[serde(default)]
    pub start_published_date: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Input for `code_interpreter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeInterpreterInput {
    pub code: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default, rename = "outputFile")]
    pub output_file: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Input for `view_image`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewImageInput {
    #[serde(rename = "imagePath")]
    pub image_path: String,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Input for `spawn_agent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnAgentInput {
    pub task: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub context_files: Vec<String>,
}

/// Input for `wait_for_agents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForAgentsInput {
    pub agent_ids: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Input for `get_agent_result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAgentResultInput {
    pub agent_id: String,
}

/// Input for `update_plan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePlanInput {
    pub steps: Vec<String>,
    #[serde(default)]
    pub mode: Option<PlanMode>,
}

/// `update_plan` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanMode {
    Replace,
    Append,
}

/// One agent reference in a `write_report` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportAgentRef {
    pub agent_id: String,
    pub task: String,
}

/// Input for `write_report`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteReportInput {
    pub query: String,
    #[serde(default)]
    pub clarification: Option<String>,
    pub agent_results: Vec<ReportAgentRef>,
}

/// A tool input, tagged by tool name.
#[derive(Debug, Clone)]
pub enum ToolInput {
    GeneratePlan,
    SpawnAgent(SpawnAgentInput),
    WaitForAgents(WaitForAgentsInput),
    GetAgentResult(GetAgentResultInput),
    UpdatePlan(UpdatePlanInput),
    WriteReport(WriteReportInput),
    File(FileInput),
    WebSearch(WebSearchInput),
    CodeInterpreter(CodeInterpreterInput),
    ViewImage(ViewImageInput),
}

impl ToolInput {
    /// Parses raw JSON arguments into the typed input for `tool_name`.
    ///
    /// # Errors
    ///
    /// Returns a [`ToolFailure`] with `VALIDATION_FAILED` for malformed
    /// arguments and `UNKNOWN_ERROR` for unknown tool names.
    pub fn parse(tool_name: &str, arguments: &str) -> Result<Self, ToolFailure> {
        fn de<T: serde::de::DeserializeOwned>(
            tool_name: &str,
            arguments: &str,
        ) -> Result<T, ToolFailure> {
            serde_json::from_str(arguments).map_err(|e| {
                ToolFailure::new(
                    ToolErrorCode::ValidationFailed,
                    format!("invalid arguments for {tool_name}: {e}"),
                )
                .with_action("Fix the argument JSON to match the tool schema and call again.")
                .retryable()
            })
        }

        match tool_name {
            "generate_plan" => Ok(Self::GeneratePlan),
            "spawn_agent" => de(tool_name, arguments).map(Self::SpawnAgent),
            "wait_for_agents" => de(tool_name, arguments).map(Self::WaitForAgents),
            "get_agent_result" => de(tool_name, arguments).map(Self::GetAgentResult),
            "update_plan" => de(tool_name, arguments).map(Self::UpdatePlan),
            "write_report" => de(tool_name, arguments).map(Self::WriteReport),
            "file" => de(tool_name, arguments).map(Self::File),
            "web_search" => de(tool_name, arguments).map(Self::WebSearch),
            "code_interpreter" => de(tool_name, arguments).map(Self::CodeInterpreter),
            "view_image" => de(tool_name, arguments).map(Self::ViewImage),
            other => Err(ToolFailure::new(
                ToolErrorCode::UnknownError,
                format!("unknown tool: {other}"),
            )
            .with_action("Use only the tools listed in your catalog.")),
        }
    }

    /// The model-supplied description, when the input carries one.
    #[must_use]
    pub fn description(&self) -> Option<String> {
        match self {
            Self::File(i) => i.description.clone(),
            Self::WebSearch(i) => i.description.clone(),
            Self::CodeInterpreter(i) => i.description.clone(),
            Self::ViewImage(i) => i.description.clone(),
            Self::SpawnAgent(i) => i.description.clone(),
            _ => None,
        }
    }
}

/// Result of a tool execution: a JSON value for the model, or a structured
/// failure it should react to.
pub type ToolOutcome = Result<serde_json::Value, ToolFailure>;

/// Renders an outcome as the tool-result message content.
#[must_use]
pub fn outcome_content(outcome: &ToolOutcome) -> String {
    match outcome {
        Ok(value) => serde_json::to_string(value)
            .unwrap_or_else(|_| "\"unserializable tool result\"".to_string()),
        Err(failure) => serde_json::to_string(failure)
            .unwrap_or_else(|_| "\"unserializable tool failure\"".to_string()),
    }
}
