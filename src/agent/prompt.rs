//! System prompts and message builders for the five LLM roles.
//!
//! Prompts are the core instructions that define each role's behavior.
//! Builders format user messages with query context, search text, and
//! collected agent results.

use std::fmt::Write;

use crate::search::SearchDocument;

/// System prompt for the orchestrator loop.
pub const ORCHESTRATOR_SYSTEM_PROMPT: &str = r"You are a research orchestrator. You coordinate a team of research agents to answer a user's query in depth, then deliver a final report.

## Mandatory workflow

1. Call generate_plan once to obtain a strategic perspective on the query.
2. Call update_plan to publish a concise step list for the user.
3. Decompose the research into 2-4 independent subtasks and call spawn_agent for each. Every task must be self-contained: the agent sees only its task text, not the conversation.
4. Call wait_for_agents with all spawned agent ids.
5. Call get_agent_result for each agent, including failed ones (partial output is still useful).
6. Call write_report exactly once, listing every agent whose results you collected.

## Rules

- Never answer the query yourself; the report-writing model does that through write_report.
- If an agent fails, continue with the agents that succeeded. Only give up if every agent failed.
- Tool failures come back as structured JSON with an errorCode and a suggestedAction. Read them and adapt.
- Do not spawn more agents after calling write_report.
- When you have called write_report and received its confirmation, respond with a short closing message and no further tool calls.";

/// System prompt for the planner role.
pub const PLANNER_SYSTEM_PROMPT: &str = r"You are a research strategist. Given a research query (and optional clarification from the user), produce a strategic perspective: what the question is really asking, which angles matter most, what data would settle it, and which pitfalls to avoid.

Write 2-4 tight paragraphs of prose. No headings, no bullet lists, no tool calls. This text is handed verbatim to a research orchestrator as its strategy brief.";

/// System prompt for the search summarizer role.
///
/// The summarizer is the only model that ever sees raw page text; its
/// output replaces that text in everything downstream, so losing a number
/// here loses it for the whole session.
pub const SUMMARIZER_SYSTEM_PROMPT: &str = r"You summarize web search results for a research agent.

You receive the extracted text of several pages, delimited and numbered. Produce one consolidated summary that:

- Preserves EVERY numerical figure: statistics, prices, dates, percentages, counts, rankings, units. Never round, approximate, or drop a number.
- Attributes claims to their source by result number, e.g. [2].
- Keeps direct quotes short and marked.
- Notes disagreements between sources instead of averaging them away.
- Skips navigation text, ads, and boilerplate.

Output plain prose (a few paragraphs, no headings). Do not add information that is not in the sources.";

/// System prompt for the report writer role.
pub const REPORT_WRITER_SYSTEM_PROMPT: &str = r"You are a research report writer. You receive the user's query, a chart reference guide, the charts themselves, and the collected findings of several research agents. Write the definitive markdown report.

Requirements:

- Structure: title, executive summary, thematic sections, conclusion. Use markdown headings.
- Embed every chart exactly once where it supports the narrative, using the exact relative path from the chart reference guide: ![description](artifacts/agent_N/chart.png)
- Preserve concrete figures from the findings; cite sources inline when the findings name them.
- Reconcile or flag contradictions between agents; do not silently pick one side.
- No meta-commentary about agents, tools, or the research process.

Return only the markdown report.";

/// System prompt for sub-agents.
pub const SUB_AGENT_SYSTEM_PROMPT: &str = r"You are a research agent executing one specific task. You work alone; nobody else sees your conversation, only your results file.

## Method

1. Break the task into the facts you need, then use web_search to gather them. Prefer several focused searches over one broad one.
2. Record raw notes in worklog.md as you go (file tool, append).
3. If the task benefits from a chart or computation, use code_interpreter (Python, matplotlib). Verify charts with view_image before relying on them.
4. Write your final findings to results.md: a markdown document with concrete figures, sources, and any chart paths. This file is your entire output - an empty or thin results.md means the task failed.

## Rules

- results.md must contain your substantive findings, not a promise of them. Write it before you stop.
- Tool budgets are limited; when a tool reports TOOL_CALL_LIMIT_REACHED, wrap up with what you have.
- Tool failures come back as structured JSON with an errorCode and suggestedAction. Read them and adapt.
- Reference charts by the relative path the code_interpreter returned, e.g. charts/revenue.png.";

/// Placeholder seeded into `results.md` before the agent runs.
pub const RESULTS_PLACEHOLDER: &str =
    "# Results\n\n_No results written yet. The agent replaces this file with its findings._\n";

/// Builds the orchestrator's opening user message.
#[must_use]
pub fn build_orchestrator_user_message(query: &str, clarification: Option<&str>) -> String {
    let mut msg = format!("Research query: {query}\n");
    if let Some(context) = clarification {
        let _ = write!(msg, "\nClarification context from the user:\n{context}\n");
    }
    msg.push_str("\nBegin with generate_plan.");
    msg
}

/// Builds the planner's user message.
#[must_use]
pub fn build_planner_user_message(query: &str, clarification: Option<&str>) -> String {
    let mut msg = format!("Query: {query}\n");
    if let Some(context) = clarification {
        let _ = write!(msg, "\nClarification context:\n{context}\n");
    }
    msg
}

/// Concatenates search result texts for the summarizer, with per-result
/// delimiters and 1-based indices.
#[must_use]
pub fn build_summarizer_input(query: &str, results: &[SearchDocument]) -> String {
    let mut input = format!("Search query: {query}\n");
    for (i, doc) in results.iter().enumerate() {
        let _ = write!(
            input,
            "\n--- Result {} ---\nTitle: {}\nURL: {}\n\n{}\n",
            i + 1,
            doc.title,
            doc.url,
            doc.text
        );
    }
    input
}

/// Builds the sub-agent's task message.
#[must_use]
pub fn build_sub_agent_task_message(task: &str) -> String {
    format!("Your research task:\n\n{task}\n\nWhen finished, ensure results.md holds your complete findings.")
}

/// Builds the system-role message prepended when context files are supplied.
#[must_use]
pub fn build_context_files_message(files: &[(String, String)]) -> String {
    let mut msg = String::from("Context files provided for this task:\n");
    for (path, content) in files {
        let _ = write!(msg, "\n--- {path} ---\n{content}\n");
    }
    msg
}

/// Builds the validation-failure message injected before a retry attempt.
#[must_use]
pub fn build_validation_failed_message(attempt: u32, min_chars: usize) -> String {
    format!(
        "VALIDATION FAILED: results.md is still empty or contains fewer than {min_chars} characters \
         of findings (attempt {attempt}). You must write your actual research findings to results.md \
         using the file tool before finishing. Summarize everything you have learned so far, with \
         concrete figures and sources, even if incomplete."
    )
}

/// Builds the chart reference guide for the report writer.
#[must_use]
pub fn build_chart_reference_guide(chart_paths: &[String]) -> String {
    if chart_paths.is_empty() {
        return "No charts were produced in this session.".to_string();
    }
    let mut guide = String::from(
        "Chart reference guide. Embed each chart with its exact path, e.g. ![label](path):\n",
    );
    for (i, path) in chart_paths.iter().enumerate() {
        let _ = write!(guide, "{}. {path}\n", i + 1);
    }
    guide
}

/// Builds the concatenated agent findings section for the report writer.
#[must_use]
pub fn build_agent_results_section(results: &[(String, String, String)]) -> String {
    let mut section = String::new();
    for (agent_id, task, text) in results {
        let _ = write!(
            section,
            "\n=== Findings from {agent_id} ===\nTask: {task}\n\n{text}\n"
        );
    }
    section
}

/// Final instruction block for the report writer message.
#[must_use]
pub fn build_report_instructions(query: &str, clarification: Option<&str>) -> String {
    let mut msg = format!(
        "Write the final markdown report answering this query:\n\n{query}\n"
    );
    if let Some(context) = clarification {
        let _ = write!(msg, "\nThe user added this clarification:\n{context}\n");
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarizer_input_indices_and_delimiters() {
        let results = vec![
            SearchDocument {
                title: "A".to_string(),
                url: "https://a".to_string(),
                text: "alpha body".to_string(),
                author: None,
                published_date: None,
                score: None,
            },
            SearchDocument {
                title: "B".to_string(),
                url: "https://b".to_string(),
                text: "beta body".to_string(),
                author: None,
                published_date: None,
                score: None,
            },
        ];
        let input = build_summarizer_input("q", &results);
        assert!(input.contains("--- Result 1 ---"));
        assert!(input.contains("--- Result 2 ---"));
        assert!(input.contains("alpha body"));
        assert!(input.contains("beta body"));
    }

    #[test]
    fn test_orchestrator_message_with_clarification() {
        let msg = build_orchestrator_user_message("market size", Some("focus on Europe"));
        assert!(msg.contains("market size"));
        assert!(msg.contains("focus on Europe"));

        let bare = build_orchestrator_user_message("market size", None);
        assert!(!bare.contains("Clarification"));
    }

    #[test]
    fn test_chart_guide_empty_and_filled() {
        assert!(build_chart_reference_guide(&[]).contains("No charts"));
        let guide =
            build_chart_reference_guide(&["artifacts/agent_1/revenue.png".to_string()]);
        assert!(guide.contains("1. artifacts/agent_1/revenue.png"));
    }

    #[test]
    fn test_validation_message_mentions_threshold() {
        let msg = build_validation_failed_message(2, 100);
        assert!(msg.starts_with("VALIDATION FAILED"));
        assert!(msg.contains("100 characters"));
        assert!(msg.contains("attempt 2"));
    }
}
