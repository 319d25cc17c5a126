//! Session-oriented deep-research engine.
//!
//! An LLM orchestrator coordinates a dynamically-sized pool of LLM
//! sub-agents, each invoking external tools (web search, sandboxed Python,
//! scoped file I/O). Clients submit a query, receive a session ID,
//! subscribe to an ordered event stream, and retrieve a rendered markdown
//! report.
//!
//! # Architecture
//!
//! ```text
//! Client → Engine
//!   ├── SessionStore (state + event log + subscriber fan-out)
//!   └── Orchestrator task (per session)
//!        ├── generate_plan / update_plan / write_report  → LLM roles
//!        ├── spawn_agent → N concurrent SubAgent tasks
//!        │     └── web_search / file / code_interpreter / view_image
//!        │           └── RateGate → SearchProvider
//!        │           └── SandboxProvider
//!        └── wait_for_agents / get_agent_result → artifacts
//! ```
//!
//! External capabilities are consumed through three traits —
//! [`agent::LlmProvider`], [`search::SearchProvider`], and
//! [`sandbox::SandboxProvider`] — so the engine never depends on a
//! concrete vendor.

pub mod agent;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod rate_gate;
pub mod sandbox;
pub mod search;
pub mod session;
pub mod tools;
pub mod workspace;

pub use config::{ApiKeys, EngineConfig, ModelSelection};
pub use engine::{Engine, ProviderFactory, SessionRequest, StatusSnapshot};
pub use error::{EngineError, ErrorClass, ToolErrorCode, ToolFailure};
pub use session::{Event, EventPayload, EventStream, SessionStatus};
