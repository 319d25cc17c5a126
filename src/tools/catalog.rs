//! Tool definitions exposed to the LLMs.
//!
//! Two families: the orchestrator's coordination tools and the sub-agent's
//! research tools. Each definition carries a JSON Schema the provider
//! forwards to the model for function-calling.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// A tool definition that can be sent to an LLM for function-calling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (must match the dispatch table in the executors).
    pub name: String,
    /// Human-readable description of what the tool does.
    pub description: String,
    /// JSON Schema object describing the tool's parameters.
    pub parameters: serde_json::Value,
}

/// Tool catalog for the orchestrator LLM.
#[must_use]
pub fn orchestrator_tools() -> Vec<ToolDefinition> {
    vec![
        def_generate_plan(),
        def_spawn_agent(),
        def_wait_for_agents(),
        def_get_agent_result(),
        def_update_plan(),
        def_write_report(),
        def_orchestrator_file(),
    ]
}

/// Tool catalog for sub-agent LLMs.
#[must_use]
pub fn sub_agent_tools() -> Vec<ToolDefinition> {
    vec![
        def_web_search(),
        def_sub_agent_file(),
        def_code_interpreter(),
        def_view_image(),
    ]
}

// ---------------------------------------------------------------------------
// Orchestrator tool schemas
// ---------------------------------------------------------------------------

fn def_generate_plan() -> ToolDefinition {
    ToolDefinition {
        name: "generate_plan".to_string(),
        description: "Invoke the planning model to produce a strategic research perspective \
                       for the query. Call this once, before spawning any agents."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        }),
    }
}

fn def_spawn_agent() -> ToolDefinition {
    ToolDefinition {
        name: "spawn_agent".to_string(),
        description: "Spawn a research sub-agent with a specific task. The agent runs in the \
                       background; use wait_for_agents to await it and get_agent_result to \
                       collect its output."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Complete, self-contained description of what the agent should research."
                },
                "description": {
                    "type": "string",
                    "description": "Short label for display (3-6 words)."
                },
                "context_files": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Session-relative paths of files whose contents the agent should see before starting."
                }
            },
            "required": ["task"],
            "additionalProperties": false
        }),
    }
}

fn def_wait_for_agents() -> ToolDefinition {
    ToolDefinition {
        name: "wait_for_agents".to_string(),
        description: "Block until all named agents finish (completed or failed) or the timeout \
                       elapses. Returns each agent's status either way."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "agent_ids": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 1,
                    "description": "Agent IDs to wait for."
                },
                "timeout_seconds": {
                    "type": "integer",
                    "description": "Maximum seconds to wait. Defaults to 180.",
                    "default": 180
                }
            },
            "required": ["agent_ids"],
            "additionalProperties": false
        }),
    }
}

fn def_get_agent_result() -> ToolDefinition {
    ToolDefinition {
        name: "get_agent_result".to_string(),
        description: "Read a finished agent's results file and collect its chart artifacts \
                       into the shared artifacts directory. Fails if the agent is still running."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "agent_id": {
                    "type": "string",
                    "description": "The agent to collect results from."
                }
            },
            "required": ["agent_id"],
            "additionalProperties": false
        }),
    }
}

fn def_update_plan() -> ToolDefinition {
    ToolDefinition {
        name: "update_plan".to_string(),
        description: "Rewrite or extend the research plan shown to the user.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "steps": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 1,
                    "description": "Plan step descriptions, in order."
                },
                "mode": {
                    "type": "string",
                    "enum": ["replace", "append"],
                    "description": "Replace the whole plan or append to it. Defaults to replace.",
                    "default": "replace"
                }
            },
            "required": ["steps"],
            "additionalProperties": false
        }),
    }
}

fn def_write_report() -> ToolDefinition {
    ToolDefinition {
        name: "write_report".to_string(),
        description: "Invoke the report-writing model with all collected agent results and \
                       chart artifacts, and persist the final markdown report. Call this last, \
                       after collecting every agent result."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The original research query."
                },
                "clarification": {
                    "type": "string",
                    "description": "Clarification context gathered before the session, if any."
                },
                "agent_results": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "agent_id": { "type": "string" },
                            "task": { "type": "string" }
                        },
                        "required": ["agent_id", "task"]
                    },
                    "minItems": 1,
                    "description": "The agents whose collected results feed the report."
                }
            },
            "required": ["query", "agent_results"],
            "additionalProperties": false
        }),
    }
}

fn def_orchestrator_file() -> ToolDefinition {
    ToolDefinition {
        name: "file".to_string(),
        description: "Read, write, or append a file within the session workspace.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["read", "write", "append"]
                },
                "path": {
                    "type": "string",
                    "description": "Path relative to the session directory."
                },
                "content": {
                    "type": "string",
                    "description": "Content for write/append operations."
                }
            },
            "required": ["operation", "path"],
            "additionalProperties": false
        }),
    }
}

// ---------------------------------------------------------------------------
// Sub-agent tool schemas
// ---------------------------------------------------------------------------

fn def_web_search() -> ToolDefinition {
    ToolDefinition {
        name: "web_search".to_string(),
        description: "Search the web. Returns a summary of the retrieved pages plus per-result \
                       metadata (title, URL, author, date, score). Raw page text is not returned."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query."
                },
                "num_results": {
                    "type": "integer",
                    "description": "How many results to retrieve (1-10). Defaults to 5.",
                    "default": 5
                },
                "search_type": {
                    "type": "string",
                    "enum": ["neural", "keyword", "auto"],
                    "description": "Search mode. Defaults to auto."
                },
                "use_autoprompt": {
                    "type": "boolean",
                    "description": "Let the provider rewrite the query for better recall."
                },
                "start_published_date": {
                    "type": "string",
                    "description": "ISO date lower bound for publication, e.g. 2024-01-01."
                },
                "description": {
                    "type": "string",
                    "description": "One line on why this search is needed."
                }
            },
            "required": ["query"],
            "additionalProperties": false
        }),
    }
}

fn def_sub_agent_file() -> ToolDefinition {
    ToolDefinition {
        name: "file".to_string(),
        description: "Read, write, or append your worklog.md or results.md. No other paths \
                       are accessible. Write your findings to results.md before finishing."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["read", "write", "append"]
                },
                "path": {
                    "type": "string",
                    "enum": ["worklog.md", "results.md"]
                },
                "content": {
                    "type": "string",
                    "description": "Content for write/append operations."
                },
                "description": {
                    "type": "string",
                    "description": "One line on what is being recorded."
                }
            },
            "required": ["operation", "path"],
            "additionalProperties": false
        }),
    }
}

fn def_code_interpreter() -> ToolDefinition {
    ToolDefinition {
        name: "code_interpreter".to_string(),
        description: "Execute Python in a sandbox. matplotlib charts are captured and saved \
                       to your charts/ directory; reference them by the returned relative path. \
                       Python only."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Python source to execute."
                },
                "purpose": {
                    "type": "string",
                    "description": "What the code computes or draws."
                },
                "outputFile": {
                    "type": "string",
                    "description": "Preferred file name for a produced chart, e.g. revenue.png."
                },
                "description": {
                    "type": "string",
                    "description": "One line on why this execution is needed."
                }
            },
            "required": ["code"],
            "additionalProperties": false
        }),
    }
}

fn def_view_image() -> ToolDefinition {
    ToolDefinition {
        name: "view_image".to_string(),
        description: "Load an image from your workspace (e.g. a generated chart) into the \
                       conversation so you can inspect it."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "imagePath": {
                    "type": "string",
                    "description": "Path relative to your agent directory, e.g. charts/revenue.png."
                },
                "question": {
                    "type": "string",
                    "description": "What to check in the image."
                },
                "description": {
                    "type": "string",
                    "description": "One line on why the image is being inspected."
                }
            },
            "required": ["imagePath"],
            "additionalProperties": false
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestrator_catalog() {
        let tools = orchestrator_tools();
        assert_eq!(tools.len(), 7);
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        for expected in [
            "generate_plan",
            "spawn_agent",
            "wait_for_agents",
            "get_agent_result",
            "update_plan",
            "write_report",
            "file",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn test_sub_agent_catalog() {
        let tools = sub_agent_tools();
        assert_eq!(tools.len(), 4);
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        for expected in ["web_search", "file", "code_interpreter", "view_image"] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn test_all_schemas_are_objects() {
        for def in orchestrator_tools().iter().chain(sub_agent_tools().iter()) {
            assert!(!def.name.is_empty());
            assert!(!def.description.is_empty());
            assert_eq!(def.parameters["type"], "object");
        }
    }

    #[test]
    fn test_sub_agent_file_paths_restricted_in_schema() {
        let tools = sub_agent_tools();
        let file = tools
            .iter()
            .find(|t| t.name == "file")
            .unwrap_or_else(|| unreachable!());
        let allowed = &file.parameters["properties"]["path"]["enum"];
        assert_eq!(allowed[0], "worklog.md");
        assert_eq!(allowed[1], "results.md");
    }
}
