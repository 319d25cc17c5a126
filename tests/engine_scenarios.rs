//! End-to-end engine scenarios with scripted providers.
//!
//! The LLM mock decides its next move from the conversation itself (which
//! tool results are already present), so each conversation is deterministic
//! regardless of interleaving across concurrent agents.

#![allow(clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use delver::agent::message::{
    ChatMessage, ChatRequest, ChatResponse, ChatStreamEvent, LlmToolCall, Role, TokenUsage,
};
use delver::agent::provider::{ChatStream, LlmProvider};
use delver::config::{ApiKeys, EngineConfig, ModelSelection};
use delver::engine::{Engine, ProviderFactory, SessionRequest};
use delver::error::EngineError;
use delver::sandbox::{SandboxProvider, SandboxResult};
use delver::search::{SearchDocument, SearchOptions, SearchProvider, SearchResponse};
use delver::session::{EventPayload, SessionStatus};

// ---------------------------------------------------------------------------
// Scripted LLM
// ---------------------------------------------------------------------------

const ORCH_MODEL: &str = "orch-model";
const PLANNER_MODEL: &str = "planner-model";
const SUMMARIZER_MODEL: &str = "summarizer-model";
const REPORT_MODEL: &str = "report-model";
const SUB_MODEL: &str = "sub-model";

fn models() -> ModelSelection {
    ModelSelection {
        orchestrator: ORCH_MODEL.to_string(),
        planner: PLANNER_MODEL.to_string(),
        summarizer: SUMMARIZER_MODEL.to_string(),
        report_writer: REPORT_MODEL.to_string(),
        sub_agent: SUB_MODEL.to_string(),
    }
}

fn keys() -> ApiKeys {
    ApiKeys {
        llm: "llm-key".to_string(),
        search: "search-key".to_string(),
        sandbox: "sandbox-key".to_string(),
    }
}

struct ScriptedLlm {
    /// Tasks the orchestrator script delegates, in order.
    tasks: Vec<String>,
    call_seq: AtomicUsize,
}

impl ScriptedLlm {
    fn new(tasks: Vec<&str>) -> Self {
        Self {
            tasks: tasks.into_iter().map(str::to_string).collect(),
            call_seq: AtomicUsize::new(0),
        }
    }

    fn call_id(&self) -> String {
        format!("call_{}", self.call_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn tool_call(&self, name: &str, arguments: serde_json::Value) -> LlmToolCall {
        LlmToolCall {
            id: self.call_id(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    fn count_calls(messages: &[ChatMessage], name: &str) -> usize {
        messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .flat_map(|m| m.tool_calls.iter())
            .filter(|c| c.name == name)
            .count()
    }

    fn with_calls(tool_calls: Vec<LlmToolCall>) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            usage: TokenUsage::default(),
            finish_reason: Some("tool_calls".to_string()),
            tool_calls,
        }
    }

    fn with_text(text: &str) -> ChatResponse {
        ChatResponse {
            content: text.to_string(),
            usage: TokenUsage::default(),
            finish_reason: Some("stop".to_string()),
            tool_calls: Vec::new(),
        }
    }

    fn orchestrator_turn(&self, messages: &[ChatMessage]) -> ChatResponse {
        let n = self.tasks.len();
        if Self::count_calls(messages, "generate_plan") == 0 {
            return Self::with_calls(vec![
                self.tool_call("generate_plan", serde_json::json!({})),
                self.tool_call(
                    "update_plan",
                    serde_json::json!({"steps": ["Research", "Report"], "mode": "replace"}),
                ),
            ]);
        }
        if Self::count_calls(messages, "spawn_agent") < n {
            let calls = self
                .tasks
                .iter()
                .map(|task| {
                    self.tool_call(
                        "spawn_agent",
                        serde_json::json!({"task": task, "description": "scripted task"}),
                    )
                })
                .collect();
            return Self::with_calls(calls);
        }
        let agent_ids: Vec<String> = (1..=n).map(|i| format!("agent_{i}")).collect();
        if Self::count_calls(messages, "wait_for_agents") == 0 {
            return Self::with_calls(vec![self.tool_call(
                "wait_for_agents",
                serde_json::json!({"agent_ids": agent_ids, "timeout_seconds": 60}),
            )]);
        }
        if Self::count_calls(messages, "get_agent_result") < n {
            let calls = agent_ids
                .iter()
                .map(|id| {
                    self.tool_call("get_agent_result", serde_json::json!({"agent_id": id}))
                })
                .collect();
            return Self::with_calls(calls);
        }
        if Self::count_calls(messages, "write_report") == 0 {
            let agent_results: Vec<serde_json::Value> = agent_ids
                .iter()
                .zip(&self.tasks)
                .map(|(id, task)| serde_json::json!({"agent_id": id, "task": task}))
                .collect();
            return Self::with_calls(vec![self.tool_call(
                "write_report",
                serde_json::json!({"query": "scripted", "agent_results": agent_results}),
            )]);
        }
        Self::with_text("Research complete.")
    }

    fn sub_agent_turn(&self, messages: &[ChatMessage]) -> ChatResponse {
        let task = messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_text())
            .unwrap_or_default();
        let searches = Self::count_calls(messages, "web_search");
        let file_writes = Self::count_calls(messages, "file");

        if task.contains("searchspam") {
            // 25 searches in batches of five, then a valid results file.
            if searches < 25 {
                let calls = (0..5)
                    .map(|i| {
                        self.tool_call(
                            "web_search",
                            serde_json::json!({"query": format!("spam {searches} {i}")}),
                        )
                    })
                    .collect();
                return Self::with_calls(calls);
            }
        } else if task.contains("traversal") {
            if file_writes == 0 {
                return Self::with_calls(vec![self.tool_call(
                    "file",
                    serde_json::json!({
                        "operation": "write",
                        "path": "../../etc/passwd",
                        "content": "x"
                    }),
                )]);
            }
        } else if searches == 0 {
            return Self::with_calls(vec![self.tool_call(
                "web_search",
                serde_json::json!({"query": task.chars().take(40).collect::<String>()}),
            )]);
        }

        let results_written = messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .flat_map(|m| m.tool_calls.iter())
            .any(|c| c.name == "file" && c.arguments.contains("results.md"));
        if !results_written {
            let body = format!("# Results\n\n{}", "finding with figure 42.5% ".repeat(20));
            return Self::with_calls(vec![self.tool_call(
                "file",
                serde_json::json!({
                    "operation": "write",
                    "path": "results.md",
                    "content": body
                }),
            )]);
        }
        Self::with_text("Task complete.")
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, EngineError> {
        match request.model.as_str() {
            PLANNER_MODEL => Ok(Self::with_text("Strategic perspective: split the work.")),
            SUMMARIZER_MODEL => Ok(Self::with_text(
                "The sources report revenue of $12.4M in 2024 [1] and 18% growth [2].",
            )),
            REPORT_MODEL => Ok(Self::with_text(
                "# Final Report\n\nRevenue reached $12.4M in 2024 with 18% growth.",
            )),
            SUB_MODEL => {
                let user = request
                    .messages
                    .iter()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_text())
                    .unwrap_or_default();
                if user.contains("hang") {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    return Ok(Self::with_text("never reached"));
                }
                Ok(self.sub_agent_turn(&request.messages))
            }
            other => Err(EngineError::Orchestration {
                message: format!("unexpected chat model {other}"),
            }),
        }
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream, EngineError> {
        assert_eq!(request.model, ORCH_MODEL, "only the orchestrator streams");
        let response = self.orchestrator_turn(&request.messages);
        let mut frames: Vec<Result<ChatStreamEvent, EngineError>> = Vec::new();
        if !response.content.is_empty() {
            frames.push(Ok(ChatStreamEvent::TextDelta(response.content.clone())));
        }
        for call in &response.tool_calls {
            frames.push(Ok(ChatStreamEvent::ToolCallStarted {
                id: call.id.clone(),
                name: call.name.clone(),
            }));
        }
        for call in response.tool_calls {
            frames.push(Ok(ChatStreamEvent::ToolCallCompleted(call)));
        }
        frames.push(Ok(ChatStreamEvent::Done {
            usage: TokenUsage::default(),
            finish_reason: response.finish_reason,
        }));
        Ok(Box::pin(futures_util::stream::iter(frames)))
    }
}

// ---------------------------------------------------------------------------
// Scripted search + sandbox
// ---------------------------------------------------------------------------

struct ScriptedSearch {
    rate_limit_first: AtomicU32,
}

#[async_trait]
impl SearchProvider for ScriptedSearch {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn search_with_contents(
        &self,
        query: &str,
        _opts: &SearchOptions,
    ) -> Result<SearchResponse, EngineError> {
        let remaining = self.rate_limit_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.rate_limit_first.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Search {
                message: "too many requests".to_string(),
                status: Some(429),
                retry_after: None,
            });
        }
        Ok(SearchResponse {
            results: vec![
                SearchDocument {
                    title: format!("Result one for {query}"),
                    url: "https://example.com/1".to_string(),
                    text: "Full page text with revenue of $12.4M in 2024.".to_string(),
                    author: Some("Author A".to_string()),
                    published_date: Some("2024-05-01".to_string()),
                    score: Some(0.9),
                },
                SearchDocument {
                    title: format!("Result two for {query}"),
                    url: "https://example.com/2".to_string(),
                    text: "Another page reporting 18% growth year over year.".to_string(),
                    author: None,
                    published_date: None,
                    score: Some(0.7),
                },
            ],
            autoprompt: None,
        })
    }
}

struct NullSandbox;

#[async_trait]
impl SandboxProvider for NullSandbox {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn run_python(&self, _code: &str, _timeout_ms: u64) -> Result<SandboxResult, EngineError> {
        Ok(SandboxResult::default())
    }
}

struct MockFactory {
    llm: Arc<ScriptedLlm>,
    search_rate_limit_first: u32,
}

impl ProviderFactory for MockFactory {
    fn llm(
        &self,
        _keys: &ApiKeys,
        _base_url: Option<&str>,
    ) -> Result<Arc<dyn LlmProvider>, EngineError> {
        Ok(Arc::clone(&self.llm) as Arc<dyn LlmProvider>)
    }

    fn search(&self, _keys: &ApiKeys) -> Result<Arc<dyn SearchProvider>, EngineError> {
        Ok(Arc::new(ScriptedSearch {
            rate_limit_first: AtomicU32::new(self.search_rate_limit_first),
        }))
    }

    fn sandbox(&self, _keys: &ApiKeys) -> Result<Arc<dyn SandboxProvider>, EngineError> {
        Ok(Arc::new(NullSandbox))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    engine: Arc<Engine>,
    _reports: tempfile::TempDir,
}

fn harness(tasks: Vec<&str>, search_rate_limit_first: u32) -> Harness {
    let reports = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
    let config = EngineConfig::builder()
        .reports_dir(reports.path())
        .min_search_spacing(Duration::from_millis(1))
        .session_cleanup_delay(None)
        .build();
    let factory = Arc::new(MockFactory {
        llm: Arc::new(ScriptedLlm::new(tasks)),
        search_rate_limit_first,
    });
    Harness {
        engine: Engine::with_factory(config, factory),
        _reports: reports,
    }
}

async fn run_to_completion(
    harness: &Harness,
    query: &str,
) -> (String, Vec<delver::session::Event>) {
    let session_id = harness
        .engine
        .create_session(SessionRequest {
            query: query.to_string(),
            clarification: Some("clarified scope".to_string()),
            models: models(),
            api_keys: keys(),
        })
        .await
        .unwrap_or_else(|e| panic!("create_session failed: {e}"));

    let mut stream = harness
        .engine
        .subscribe(&session_id)
        .unwrap_or_else(|e| panic!("subscribe failed: {e}"));
    let events = tokio::time::timeout(Duration::from_secs(30), async {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    })
    .await
    .unwrap_or_else(|_| panic!("session did not reach a terminal status"));
    (session_id, events)
}

fn count_events(events: &[delver::session::Event], type_name: &str) -> usize {
    events
        .iter()
        .filter(|e| e.payload.type_name() == type_name)
        .count()
}

// ---------------------------------------------------------------------------
// Scenario A: happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_a_happy_path() {
    let h = harness(vec!["market sizing", "competitor landscape"], 0);
    let (session_id, events) = run_to_completion(&h, "Sample market analysis").await;

    let status = h
        .engine
        .status(&session_id)
        .unwrap_or_else(|e| panic!("status failed: {e}"));
    assert_eq!(status.status, SessionStatus::Completed);

    assert!(count_events(&events, "agent_spawned") >= 2);
    let completed_agents = events
        .iter()
        .filter(|e| {
            matches!(
                &e.payload,
                EventPayload::AgentStatusChange { status, agent_id, .. }
                    if status == "completed" && agent_id.starts_with("agent_")
            )
        })
        .count();
    assert!(completed_agents >= 2, "expected both agents to complete");

    let terminal_changes = events
        .iter()
        .filter(|e| {
            matches!(
                &e.payload,
                EventPayload::SessionStatusChange { status } if status == "completed"
            )
        })
        .count();
    assert_eq!(terminal_changes, 1);

    let report = h
        .engine
        .report(&session_id)
        .await
        .unwrap_or_else(|e| panic!("report failed: {e}"));
    assert!(report.contains("# Final Report"));
    assert!(report.contains("$12.4M"));

    // Plan file and orchestrator step events exist.
    assert!(count_events(&events, "orchestrator_step") >= 4);
    assert!(count_events(&events, "plan_update") >= 1);
    let (plan_bytes, content_type) = h
        .engine
        .files(&session_id, "orchestrator_plan.json")
        .await
        .unwrap_or_else(|e| panic!("files failed: {e}"));
    assert_eq!(content_type, "application/json");
    assert!(!plan_bytes.is_empty());
}

#[tokio::test]
async fn scenario_a_summarised_search_results_carry_no_raw_text() {
    let h = harness(vec!["single task"], 0);
    let (_session_id, events) = run_to_completion(&h, "Check summariser contract").await;

    let mut saw_search_result = false;
    for event in &events {
        if let EventPayload::ToolResult {
            tool_name,
            status,
            result: Some(result),
            ..
        } = &event.payload
            && tool_name == "web_search"
            && status == "completed"
        {
            saw_search_result = true;
            let summary = result["summary"].as_str().unwrap_or_default();
            assert!(!summary.is_empty(), "summary must be non-empty");
            assert!(summary.contains("$12.4M"), "figures must be preserved");
            for item in result["results"].as_array().unwrap_or(&Vec::new()) {
                assert!(item.get("text").is_none(), "raw text must be stripped");
                assert!(item.get("content").is_none());
                assert!(item.get("title").is_some());
                assert!(item.get("url").is_some());
            }
        }
    }
    assert!(saw_search_result, "expected at least one web_search result");
}

// ---------------------------------------------------------------------------
// Scenario B: budget exhaustion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_b_search_budget_exhaustion() {
    let h = harness(vec!["searchspam mission"], 0);
    let (session_id, events) = run_to_completion(&h, "Budget exhaustion run").await;

    let mut completed = 0;
    let mut limit_failures = 0;
    for event in &events {
        if let EventPayload::ToolResult {
            tool_name,
            status,
            result,
            agent_id,
            ..
        } = &event.payload
            && tool_name == "web_search"
            && agent_id == "agent_1"
        {
            if status == "completed" {
                completed += 1;
            } else {
                let code = result
                    .as_ref()
                    .and_then(|r| r["errorCode"].as_str())
                    .unwrap_or_default();
                assert_eq!(code, "TOOL_CALL_LIMIT_REACHED");
                let can_retry = result
                    .as_ref()
                    .and_then(|r| r["canRetry"].as_bool())
                    .unwrap_or(true);
                assert!(!can_retry);
                limit_failures += 1;
            }
        }
    }
    assert_eq!(completed, 20, "first 20 searches succeed");
    assert_eq!(limit_failures, 5, "calls 21-25 are rejected");

    // The agent still wrote a valid results file and completed.
    let status = h
        .engine
        .status(&session_id)
        .unwrap_or_else(|e| panic!("status failed: {e}"));
    let agent = status
        .agents
        .iter()
        .find(|a| a.agent_id == "agent_1")
        .unwrap_or_else(|| panic!("agent_1 missing"));
    assert_eq!(agent.status.to_string(), "completed");
}

// ---------------------------------------------------------------------------
// Scenario C: rate-limit retry through the gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_c_search_rate_limit_retries_to_success() {
    // First three dispatches return 429; the rate gate retries with
    // backoff and the tool sees exactly one completed result.
    let h = harness(vec!["single task"], 3);
    let started = std::time::Instant::now();
    let (_session_id, events) = run_to_completion(&h, "Rate limited run").await;
    let elapsed = started.elapsed();

    let completed: Vec<_> = events
        .iter()
        .filter(|e| {
            matches!(
                &e.payload,
                EventPayload::ToolResult { tool_name, status, .. }
                    if tool_name == "web_search" && status == "completed"
            )
        })
        .collect();
    assert_eq!(completed.len(), 1);
    // Backoff schedule for 429s: 2 s + 4 s + 8 s before the fourth dispatch.
    assert!(
        elapsed >= Duration::from_secs(14),
        "expected >= 14 s of backoff, saw {elapsed:?}"
    );
}

// ---------------------------------------------------------------------------
// Scenario D: path traversal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_d_path_traversal_denied() {
    let h = harness(vec!["traversal probe"], 0);
    let (session_id, events) = run_to_completion(&h, "Traversal run").await;

    let denied = events.iter().any(|e| {
        matches!(
            &e.payload,
            EventPayload::ToolResult { tool_name, status, result: Some(result), .. }
                if tool_name == "file"
                    && status == "failed"
                    && result["errorCode"] == "FILE_ACCESS_DENIED"
        )
    });
    assert!(denied, "expected a FILE_ACCESS_DENIED tool result");

    // Nothing was written outside the agent directory.
    let status = h
        .engine
        .status(&session_id)
        .unwrap_or_else(|e| panic!("status failed: {e}"));
    assert_eq!(status.status, SessionStatus::Completed);
    assert!(!std::path::Path::new("/etc/passwd-x").exists());
    let escaped = h._reports.path().join("etc/passwd");
    assert!(!escaped.exists(), "traversal must not create files");
}

// ---------------------------------------------------------------------------
// Scenario E: cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_e_cancellation_propagates() {
    let h = harness(vec!["hang forever"], 0);
    let session_id = h
        .engine
        .create_session(SessionRequest {
            query: "Cancellation run".to_string(),
            clarification: None,
            models: models(),
            api_keys: keys(),
        })
        .await
        .unwrap_or_else(|e| panic!("create_session failed: {e}"));

    let mut stream = h
        .engine
        .subscribe(&session_id)
        .unwrap_or_else(|e| panic!("subscribe failed: {e}"));

    // Let the orchestrator spawn the hanging agent, then cancel.
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.engine
        .cancel(&session_id)
        .unwrap_or_else(|e| panic!("cancel failed: {e}"));
    // Idempotent.
    h.engine
        .cancel(&session_id)
        .unwrap_or_else(|e| panic!("second cancel failed: {e}"));

    let events = tokio::time::timeout(Duration::from_secs(10), async {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    })
    .await
    .unwrap_or_else(|_| panic!("stream did not close after cancellation"));

    let status = h
        .engine
        .status(&session_id)
        .unwrap_or_else(|e| panic!("status failed: {e}"));
    assert_eq!(status.status, SessionStatus::Failed);

    let agent = status
        .agents
        .iter()
        .find(|a| a.agent_id == "agent_1")
        .unwrap_or_else(|| panic!("agent_1 missing"));
    assert_eq!(agent.status.to_string(), "failed");
    assert_eq!(agent.error.as_deref(), Some("cancelled"));

    assert!(events.iter().any(|e| {
        matches!(
            &e.payload,
            EventPayload::Error { error, .. } if error == "cancelled"
        )
    }));
    assert!(
        matches!(
            &events.last().unwrap_or_else(|| panic!("no events")).payload,
            EventPayload::SessionStatusChange { status } if status == "failed"
        ),
        "terminal status change must be the final frame"
    );
}

// ---------------------------------------------------------------------------
// Scenario F: late subscribers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_f_late_subscribers_see_identical_history() {
    let h = harness(vec!["alpha", "beta"], 0);
    let (session_id, _events) = run_to_completion(&h, "Late subscriber run").await;

    let collect = |mut stream: delver::session::EventStream| async move {
        let mut out = Vec::new();
        while let Some(event) = stream.next().await {
            out.push((
                event.payload.type_name().to_string(),
                serde_json::to_value(&event.payload).unwrap_or_default(),
            ));
        }
        out
    };

    let a = collect(
        h.engine
            .subscribe(&session_id)
            .unwrap_or_else(|e| panic!("subscribe failed: {e}")),
    )
    .await;
    let b = collect(
        h.engine
            .subscribe(&session_id)
            .unwrap_or_else(|e| panic!("subscribe failed: {e}")),
    )
    .await;

    assert!(!a.is_empty());
    assert_eq!(a, b, "late subscribers must see identical sequences");
    assert_eq!(a[0].0, "connected");
    assert_eq!(
        a.last().unwrap_or_else(|| panic!("empty")).0,
        "session_status_change"
    );

    // No duplicates: exactly one terminal status change.
    let terminal = a
        .iter()
        .filter(|(t, v)| t == "session_status_change" && v["data"]["status"] == "completed")
        .count();
    assert_eq!(terminal, 1);
}

// ---------------------------------------------------------------------------
// Disconnect grace period
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnecting_all_subscribers_cancels_after_grace() {
    let reports = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
    let config = EngineConfig::builder()
        .reports_dir(reports.path())
        .min_search_spacing(Duration::from_millis(1))
        .abort_grace_period(Duration::from_millis(100))
        .session_cleanup_delay(None)
        .build();
    let factory = Arc::new(MockFactory {
        llm: Arc::new(ScriptedLlm::new(vec!["hang forever"])),
        search_rate_limit_first: 0,
    });
    let engine = Engine::with_factory(config, factory);

    let session_id = engine
        .create_session(SessionRequest {
            query: "Grace period run".to_string(),
            clarification: None,
            models: models(),
            api_keys: keys(),
        })
        .await
        .unwrap_or_else(|e| panic!("create_session failed: {e}"));

    let stream = engine
        .subscribe(&session_id)
        .unwrap_or_else(|e| panic!("subscribe failed: {e}"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(stream);

    // Wait out the grace period plus scheduling slack.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = engine
            .status(&session_id)
            .unwrap_or_else(|e| panic!("status failed: {e}"));
        if status.status == SessionStatus::Failed {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "session was not cancelled after subscribers disconnected"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
