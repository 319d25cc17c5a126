//! Sub-agent tool executor.
//!
//! Dispatches the four research tools with per-tool budgets. Budgets are
//! hard limits per agent: `web_search` 20, `file` 15, `code_interpreter` 5,
//! `view_image` 5; a tool is also blocked after 3 consecutive failures.
//! Exhausted budgets return `TOOL_CALL_LIMIT_REACHED` telling the agent to
//! wrap up with what it has.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::types::{
    CodeInterpreterInput, FileInput, FileOperation, ToolInput, ToolOutcome, ViewImageInput,
    WebSearchInput,
};
use super::{ToolDispatch, begin_call, finish_call, input_value, outcome_content};
use crate::agent::message::{ChatMessage, ContentPart, user_parts_message};
use crate::agent::message::{ChatRequest, LlmToolCall, system_message, user_message};
use crate::agent::prompt::{SUMMARIZER_SYSTEM_PROMPT, build_summarizer_input};
use crate::context::SessionContext;
use crate::error::{EngineError, ToolErrorCode, ToolFailure};
use crate::search::{SearchDocument, SearchOptions};
use crate::workspace::{CHARTS_DIR, RESULTS_FILE, WORKLOG_FILE};

/// Snippet length used when summarisation fails.
const FALLBACK_SNIPPET_CHARS: usize = 300;
/// Consecutive failures after which a tool is blocked.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Default)]
struct BudgetEntry {
    calls: u32,
    consecutive_failures: u32,
}

/// Per-tool call limits.
fn budget_limit(tool_name: &str) -> u32 {
    match tool_name {
        "web_search" => 20,
        "file" => 15,
        "code_interpreter" | "view_image" => 5,
        _ => 0,
    }
}

/// Executes tool calls for one sub-agent.
pub struct SubAgentToolExecutor {
    ctx: Arc<SessionContext>,
    agent_id: String,
    agent_dir: PathBuf,
    cancel: CancellationToken,
    budgets: HashMap<String, BudgetEntry>,
}

impl SubAgentToolExecutor {
    /// Creates an executor rooted at the agent's directory.
    #[must_use]
    pub fn new(
        ctx: Arc<SessionContext>,
        agent_id: String,
        agent_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            agent_id,
            agent_dir,
            cancel,
            budgets: HashMap::new(),
        }
    }

    /// Dispatches one tool call, recording its lifecycle against the agent.
    pub async fn dispatch(
        &mut self,
        call: &LlmToolCall,
        step_number: usize,
        index_in_step: usize,
    ) -> ToolDispatch {
        let input = ToolInput::parse(&call.name, &call.arguments);
        let description = input.as_ref().ok().and_then(ToolInput::description);
        let stored_id = begin_call(
            &self.ctx.handle,
            &self.agent_id,
            &call.id,
            &call.name,
            input_value(&call.arguments),
            step_number,
            index_in_step,
            description,
        );

        let mut extra_messages = Vec::new();
        let outcome: ToolOutcome = match input {
            Err(failure) => Err(failure),
            Ok(input) => match self.check_budget(&call.name) {
                Err(failure) => Err(failure),
                Ok(()) => {
                    let outcome = self.execute(input, &mut extra_messages).await;
                    self.settle_budget(&call.name, outcome.is_ok());
                    outcome
                }
            },
        };

        finish_call(&self.ctx.handle, &self.agent_id, &stored_id, &outcome, None);
        ToolDispatch {
            content: outcome_content(&outcome),
            extra_messages,
        }
    }

    /// Charges one call against the tool's budget, or rejects it.
    fn check_budget(&mut self, tool_name: &str) -> Result<(), ToolFailure> {
        let limit = budget_limit(tool_name);
        let entry = self.budgets.entry(tool_name.to_string()).or_default();

        if entry.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            return Err(ToolFailure::new(
                ToolErrorCode::ToolCallLimitReached,
                format!("{tool_name} is blocked after {MAX_CONSECUTIVE_FAILURES} consecutive failures"),
            )
            .with_action(
                "Stop calling this tool. Wrap up using the information you already have.",
            ));
        }
        if entry.calls >= limit {
            return Err(ToolFailure::new(
                ToolErrorCode::ToolCallLimitReached,
                format!("{tool_name} budget of {limit} calls is exhausted"),
            )
            .with_action(
                "Stop calling this tool. Write your findings to results.md with what you have.",
            ));
        }
        entry.calls += 1;
        Ok(())
    }

    fn settle_budget(&mut self, tool_name: &str, success: bool) {
        let entry = self.budgets.entry(tool_name.to_string()).or_default();
        if success {
            entry.consecutive_failures = 0;
        } else {
            entry.consecutive_failures += 1;
        }
    }

    async fn execute(
        &self,
        input: ToolInput,
        extra_messages: &mut Vec<ChatMessage>,
    ) -> ToolOutcome {
        match input {
            ToolInput::WebSearch(input) => self.web_search(input).await,
            ToolInput::File(input) => self.file(input).await,
            ToolInput::CodeInterpreter(input) => self.code_interpreter(input).await,
            ToolInput::ViewImage(input) => self.view_image(input, extra_messages).await,
            _ => Err(ToolFailure::new(
                ToolErrorCode::UnknownError,
                "tool not available to sub-agents",
            )
            .with_action("Use only web_search, file, code_interpreter, or view_image.")),
        }
    }

    // -----------------------------------------------------------------------
    // web_search
    // -----------------------------------------------------------------------

    /// Runs a search through the rate gate, then replaces raw page text
    /// with a summarizer-model digest. Raw extracted text never reaches
    /// the calling LLM.
    async fn web_search(&self, input: WebSearchInput) -> ToolOutcome {
        if input.query.trim().is_empty() {
            return Err(
                ToolFailure::new(ToolErrorCode::ValidationFailed, "query must not be empty")
                    .with_action("Provide a non-empty search query.")
                    .retryable(),
            );
        }

        let opts = SearchOptions {
            num_results: input.num_results.unwrap_or(5).clamp(1, 10),
            search_type: input.search_type.clone(),
            use_autoprompt: input.use_autoprompt.unwrap_or(false),
            start_published_date: input.start_published_date.clone(),
        };

        let response = tokio::select! {
            r = self.ctx.rate_gate.search(input.query.clone(), opts) => r,
            () = self.cancel.cancelled() => Err(EngineError::Cancelled),
        }
        .map_err(|e| ToolFailure::from_engine_error(&e))?;

        let metadata: Vec<serde_json::Value> = response
            .results
            .iter()
            .map(|doc| {
                json!({
                    "title": doc.title,
                    "url": doc.url,
                    "author": doc.author,
                    "publishedDate": doc.published_date,
                    "score": doc.score,
                })
            })
            .collect();

        match self.summarize(&input.query, &response.results).await {
            Ok(summary) => Ok(json!({
                "summary": summary,
                "results": metadata,
                "autoprompt": response.autoprompt,
            })),
            Err(e) => {
                debug!(error = %e, "summarisation failed, falling back to snippets");
                let snippets: Vec<serde_json::Value> = response
                    .results
                    .iter()
                    .map(|doc| {
                        json!({
                            "title": doc.title,
                            "url": doc.url,
                            "author": doc.author,
                            "publishedDate": doc.published_date,
                            "score": doc.score,
                            "snippet": doc.text.chars().take(FALLBACK_SNIPPET_CHARS).collect::<String>(),
                        })
                    })
                    .collect();
                Ok(json!({
                    "summary": "Summarisation unavailable; per-result snippets follow.",
                    "results": snippets,
                    "autoprompt": response.autoprompt,
                }))
            }
        }
    }

    async fn summarize(
        &self,
        query: &str,
        results: &[SearchDocument],
    ) -> Result<String, EngineError> {
        let request = ChatRequest {
            model: self.ctx.models.summarizer.clone(),
            messages: vec![
                system_message(SUMMARIZER_SYSTEM_PROMPT),
                user_message(&build_summarizer_input(query, results)),
            ],
            temperature: Some(0.0),
            max_tokens: Some(2048),
            tools: Vec::new(),
        };
        let response = tokio::select! {
            r = self.ctx.llm.chat(&request) => r?,
            () = self.cancel.cancelled() => return Err(EngineError::Cancelled),
        };
        if response.content.trim().is_empty() {
            return Err(EngineError::ResponseParse {
                message: "summarizer returned empty output".to_string(),
            });
        }
        Ok(response.content)
    }

    // -----------------------------------------------------------------------
    // file
    // -----------------------------------------------------------------------

    /// Scoped file access: only `worklog.md` and `results.md`, only inside
    /// the agent directory.
    async fn file(&self, input: FileInput) -> ToolOutcome {
        let basename = Path::new(&input.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if basename != WORKLOG_FILE && basename != RESULTS_FILE {
            return Err(ToolFailure::new(
                ToolErrorCode::FileAccessDenied,
                format!("path {} is outside your sandbox", input.path),
            )
            .with_action("Use exactly worklog.md or results.md."));
        }

        let path = self
            .ctx
            .workspace
            .resolve_under(&self.agent_dir, &input.path)
            .map_err(|_| {
                ToolFailure::new(
                    ToolErrorCode::FileAccessDenied,
                    format!("path {} is outside your sandbox", input.path),
                )
                .with_action("Use exactly worklog.md or results.md.")
            })?;

        match input.operation {
            FileOperation::Read => match tokio::fs::read_to_string(&path).await {
                Ok(content) => Ok(json!({ "content": content })),
                Err(_) => Err(ToolFailure::new(
                    ToolErrorCode::FileNotFound,
                    format!("{basename} does not exist yet"),
                )
                .with_action("Write to the file before reading it.")),
            },
            FileOperation::Write | FileOperation::Append => {
                let content = normalize_escapes(input.content.as_deref().unwrap_or_default());
                let io_result = if input.operation == FileOperation::Write {
                    tokio::fs::write(&path, content.as_bytes()).await
                } else {
                    append_file(&path, content.as_bytes()).await
                };
                io_result.map_err(|e| {
                    ToolFailure::new(ToolErrorCode::UnknownError, format!("write failed: {e}"))
                        .retryable()
                })?;
                Ok(json!({ "success": true, "path": basename, "bytes": content.len() }))
            }
        }
    }

    // -----------------------------------------------------------------------
    // code_interpreter
    // -----------------------------------------------------------------------

    /// Executes Python in the sandbox and saves captured images under
    /// `charts/`. The base64 payloads stay out of the tool response; charts
    /// are referenced by relative path only.
    async fn code_interpreter(&self, input: CodeInterpreterInput) -> ToolOutcome {
        if let Some(language) = input.language.as_deref()
            && !language.eq_ignore_ascii_case("python")
        {
            return Err(ToolFailure::new(
                ToolErrorCode::CodeExecutionFailed,
                "Only Python is supported. JavaScript and other languages are not available.",
            )
            .with_action("Rewrite the code in Python and call code_interpreter again."));
        }

        let code = wrap_python(&input.code);
        let timeout_ms = u64::try_from(self.ctx.config.sandbox_timeout.as_millis()).unwrap_or(30_000);

        let result = tokio::select! {
            r = self.ctx.sandbox.run_python(&code, timeout_ms) => r,
            () = self.cancel.cancelled() => Err(EngineError::Cancelled),
        }
        .map_err(|e| match e {
            EngineError::Cancelled => ToolFailure::new(
                ToolErrorCode::CodeExecutionFailed,
                "execution cancelled",
            ),
            other => ToolFailure::new(
                ToolErrorCode::CodeSandboxError,
                format!("sandbox unavailable: {other}"),
            )
            .with_action("Skip code execution and continue with the data you already have."),
        })?;

        if let Some(error) = &result.error {
            let is_timeout = error.name.to_lowercase().contains("timeout");
            let failure = if is_timeout {
                ToolFailure::new(
                    ToolErrorCode::CodeExecutionTimeout,
                    format!("execution exceeded {timeout_ms} ms"),
                )
                .with_action("Simplify the computation or reduce the data size, then retry once.")
                .retryable()
            } else {
                ToolFailure::new(
                    ToolErrorCode::CodeExecutionFailed,
                    format!("{}: {}", error.name, error.value),
                )
                .with_action("Fix the error in the code and retry once.")
                .retryable()
            };
            return Err(failure);
        }

        let mut files = Vec::new();
        let mut chart_index = 0usize;
        for output in &result.results {
            let (payload, ext) = match (&output.png, &output.jpeg) {
                (Some(png), _) => (png, "png"),
                (None, Some(jpeg)) => (jpeg, "jpg"),
                _ => continue,
            };
            chart_index += 1;
            let name = match (&input.output_file, chart_index) {
                (Some(name), 1) => sanitize_chart_name(name, ext),
                _ => format!("chart_{chart_index}.{ext}"),
            };
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(payload)
                .map_err(|e| {
                    ToolFailure::new(
                        ToolErrorCode::CodeSandboxError,
                        format!("sandbox returned undecodable image data: {e}"),
                    )
                })?;
            let path = self.agent_dir.join(CHARTS_DIR).join(&name);
            tokio::fs::write(&path, &bytes).await.map_err(|e| {
                ToolFailure::new(ToolErrorCode::UnknownError, format!("chart write failed: {e}"))
            })?;
            files.push(json!({
                "path": format!("{CHARTS_DIR}/{name}"),
                "type": "image",
                "content": "[image saved to disk]",
                "size": bytes.len(),
            }));
        }

        let text_outputs: Vec<&String> = result
            .results
            .iter()
            .filter(|o| o.png.is_none() && o.jpeg.is_none())
            .filter_map(|o| o.text.as_ref())
            .collect();

        Ok(json!({
            "success": true,
            "stdout": result.logs.stdout,
            "stderr": result.logs.stderr,
            "outputs": text_outputs,
            "files": files,
        }))
    }

    // -----------------------------------------------------------------------
    // view_image
    // -----------------------------------------------------------------------

    /// Loads an image from the agent directory into the conversation as a
    /// multimodal user message.
    async fn view_image(
        &self,
        input: ViewImageInput,
        extra_messages: &mut Vec<ChatMessage>,
    ) -> ToolOutcome {
        let path = self
            .ctx
            .workspace
            .resolve_under(&self.agent_dir, &input.image_path)
            .map_err(|_| {
                ToolFailure::new(
                    ToolErrorCode::FileAccessDenied,
                    format!("path {} is outside your sandbox", input.image_path),
                )
                .with_action("Use a path inside your agent directory, e.g. charts/chart_1.png.")
            })?;

        let bytes = tokio::fs::read(&path).await.map_err(|_| {
            ToolFailure::new(
                ToolErrorCode::ImageNotFound,
                format!("no image at {}", input.image_path),
            )
            .with_action("Check the path returned by code_interpreter and retry.")
        })?;

        let mime = match path.extension().and_then(|e| e.to_str()) {
            Some("jpg" | "jpeg") => "image/jpeg",
            _ => "image/png",
        };
        let data_url = format!(
            "data:{mime};base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&bytes)
        );

        let question = input
            .question
            .unwrap_or_else(|| "Inspect this image and verify it is correct.".to_string());
        extra_messages.push(user_parts_message(vec![
            ContentPart::Image { image: data_url },
            ContentPart::Text {
                text: format!("Image {} loaded. {question}", input.image_path),
            },
        ]));

        Ok(json!({
            "success": true,
            "message": format!("{} added to the conversation", input.image_path),
        }))
    }
}

/// Converts literal `\n` and `\t` escape sequences into real characters.
fn normalize_escapes(content: &str) -> String {
    content.replace("\\n", "\n").replace("\\t", "\t")
}

async fn append_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await
}

/// Keeps only a safe file name with the expected image extension.
fn sanitize_chart_name(requested: &str, ext: &str) -> String {
    let stem = Path::new(requested)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("chart")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect::<String>();
    let stem = if stem.is_empty() { "chart".to_string() } else { stem };
    format!("{stem}.{ext}")
}

/// Wraps user code with the matplotlib prologue and the figure-flush
/// epilogue expected by the sandbox's image capture.
fn wrap_python(code: &str) -> String {
    format!(
        "import matplotlib\n\
         matplotlib.use(\"Agg\")\n\
         import matplotlib.pyplot as plt\n\
         plt.rcParams[\"figure.dpi\"] = 100\n\
         \n\
         {code}\n\
         \n\
         if plt.get_fignums():\n\
         \x20\x20\x20\x20plt.show()\n\
         \x20\x20\x20\x20plt.close(\"all\")\n"
    )
}
