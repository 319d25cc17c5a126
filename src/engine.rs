//! Engine front door.
//!
//! `create_session` validates the request, builds the per-session context
//! (workspace, providers, rate gate), starts the orchestrator task, and
//! returns the session ID. The other operations are thin views over the
//! [`SessionStore`]: subscribe, status, report, file serving, and
//! idempotent cancellation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::orchestrator::run_session;
use crate::agent::provider::LlmProvider;
use crate::agent::providers::OpenAiProvider;
use crate::config::{ApiKeys, EngineConfig, ModelSelection};
use crate::context::SessionContext;
use crate::error::EngineError;
use crate::rate_gate::RateGate;
use crate::sandbox::{HttpSandboxProvider, SandboxProvider};
use crate::search::{ExaSearchProvider, SearchProvider};
use crate::session::model::ORCHESTRATOR_AGENT_ID;
use crate::session::{
    AgentRecord, EventStream, FlowGraph, PlanStep, SessionStatus, SessionStore,
};
use crate::workspace::{ORCHESTRATOR_WORKLOG, REPORT_FILE, Workspace, content_type_for};

/// Maximum query length accepted by `create_session`.
const MAX_QUERY_CHARS: usize = 10_000;
/// Interval between store retention sweeps.
const CLEANUP_SWEEP_INTERVAL: Duration = Duration::from_secs(600);
/// Placeholder returned when no report exists yet.
const NO_REPORT_PLACEHOLDER: &str = "No report generated yet.";

/// Builds the three capability providers for a session.
///
/// The default factory wires the real adapters; tests inject mocks.
pub trait ProviderFactory: Send + Sync {
    /// LLM provider for all five roles.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the provider cannot be constructed.
    fn llm(
        &self,
        keys: &ApiKeys,
        base_url: Option<&str>,
    ) -> Result<Arc<dyn LlmProvider>, EngineError>;

    /// Web search provider.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the provider cannot be constructed.
    fn search(&self, keys: &ApiKeys) -> Result<Arc<dyn SearchProvider>, EngineError>;

    /// Python sandbox provider.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the provider cannot be constructed.
    fn sandbox(&self, keys: &ApiKeys) -> Result<Arc<dyn SandboxProvider>, EngineError>;
}

/// Wires the production adapters.
pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn llm(
        &self,
        keys: &ApiKeys,
        base_url: Option<&str>,
    ) -> Result<Arc<dyn LlmProvider>, EngineError> {
        Ok(Arc::new(OpenAiProvider::new(&keys.llm, base_url)))
    }

    fn search(&self, keys: &ApiKeys) -> Result<Arc<dyn SearchProvider>, EngineError> {
        Ok(Arc::new(ExaSearchProvider::new(keys.search.clone())))
    }

    fn sandbox(&self, keys: &ApiKeys) -> Result<Arc<dyn SandboxProvider>, EngineError> {
        Ok(Arc::new(HttpSandboxProvider::new(keys.sandbox.clone())))
    }
}

/// Parameters for `create_session`.
pub struct SessionRequest {
    /// The research query.
    pub query: String,
    /// Opaque clarification context from the disambiguation step.
    pub clarification: Option<String>,
    /// Models for the five LLM roles.
    pub models: ModelSelection,
    /// Keys for the three capability providers.
    pub api_keys: ApiKeys,
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub query: String,
    pub agents: Vec<AgentRecord>,
    pub plan: Vec<PlanStep>,
    pub flow: FlowGraph,
    pub event_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The research engine.
pub struct Engine {
    config: EngineConfig,
    store: Arc<SessionStore>,
    factory: Arc<dyn ProviderFactory>,
    orchestrator_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Engine {
    /// Creates an engine with the production provider adapters.
    ///
    /// Must be called within a tokio runtime; spawns the retention sweeper.
    #[must_use]
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::with_factory(config, Arc::new(DefaultProviderFactory))
    }

    /// Creates an engine with an injected provider factory.
    #[must_use]
    pub fn with_factory(config: EngineConfig, factory: Arc<dyn ProviderFactory>) -> Arc<Self> {
        let engine = Arc::new(Self {
            config,
            store: Arc::new(SessionStore::new()),
            factory,
            orchestrator_tasks: Mutex::new(HashMap::new()),
        });

        let store = Arc::clone(&engine.store);
        let retention = engine.config.session_retention;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CLEANUP_SWEEP_INTERVAL).await;
                let removed = store.cleanup_old(retention);
                if removed > 0 {
                    debug!(removed, "retention sweep removed terminal sessions");
                }
            }
        });

        engine
    }

    /// Creates a session and starts its orchestrator task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidQuery`] for an empty or oversized
    /// query, [`EngineError::ApiKeyMissing`] when a provider key is
    /// absent, and propagates workspace/provider construction failures.
    pub async fn create_session(self: &Arc<Self>, request: SessionRequest) -> Result<String, EngineError> {
        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Err(EngineError::InvalidQuery {
                message: "query must not be empty".to_string(),
            });
        }
        if query.chars().count() > MAX_QUERY_CHARS {
            return Err(EngineError::InvalidQuery {
                message: format!("query exceeds {MAX_QUERY_CHARS} characters"),
            });
        }
        request.api_keys.validate()?;

        let llm = self
            .factory
            .llm(&request.api_keys, self.config.llm_base_url.as_deref())?;
        let search = self.factory.search(&request.api_keys)?;
        let sandbox = self.factory.sandbox(&request.api_keys)?;

        let handle = self.store.create(
            query.clone(),
            request.clarification.clone(),
            request.models.clone(),
        );
        let session_id = handle.session_id().to_string();
        let workspace = Workspace::create(&self.config.reports_dir, &session_id).await?;

        let rate_gate = RateGate::start(
            search,
            self.config.min_search_spacing,
            self.config.search_max_retries,
        );

        let ctx = Arc::new(SessionContext {
            handle: Arc::clone(&handle),
            workspace,
            config: self.config.clone(),
            models: request.models,
            llm,
            rate_gate,
            sandbox,
            query,
            clarification: request.clarification,
            agent_tasks: Mutex::new(Vec::new()),
        });

        let task = tokio::spawn(run_session(Arc::clone(&ctx)));
        self.orchestrator_tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(session_id.clone(), task);

        self.spawn_disconnect_watcher(Arc::clone(&handle));

        info!(%session_id, "session created");
        Ok(session_id)
    }

    /// Cancels a running session after a grace period once every subscriber
    /// has disconnected, so a reconnecting client does not kill its work.
    /// Armed only after the first subscriber attaches.
    fn spawn_disconnect_watcher(&self, handle: Arc<crate::session::SessionHandle>) {
        let grace = self.config.abort_grace_period;
        tokio::spawn(async move {
            let mut watch = handle.subscriber_watch();
            // Wait for the first subscriber.
            while *watch.borrow() == 0 {
                if watch.changed().await.is_err() {
                    return;
                }
            }
            loop {
                if handle.snapshot().status.is_terminal() {
                    return;
                }
                if *watch.borrow() > 0 {
                    if watch.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
                // All subscribers gone: give them the grace period.
                tokio::select! {
                    () = tokio::time::sleep(grace) => {
                        if *watch.borrow() == 0 && !handle.snapshot().status.is_terminal() {
                            warn!(
                                session_id = handle.session_id(),
                                "all subscribers disconnected; cancelling session"
                            );
                            handle.cancel_token().cancel();
                        }
                        return;
                    }
                    changed = watch.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Subscribes to a session's event stream.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SessionNotFound`] for unknown IDs.
    pub fn subscribe(&self, session_id: &str) -> Result<EventStream, EngineError> {
        Ok(self.store.get(session_id)?.subscribe())
    }

    /// Returns a status snapshot of the session.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SessionNotFound`] for unknown IDs.
    pub fn status(&self, session_id: &str) -> Result<StatusSnapshot, EngineError> {
        let handle = self.store.get(session_id)?;
        let snapshot = handle.snapshot();
        let mut agents: Vec<AgentRecord> = snapshot.agents.values().cloned().collect();
        agents.sort_by(|a, b| {
            // Orchestrator first, then agent_N in spawn order.
            let rank = |id: &str| {
                if id == ORCHESTRATOR_AGENT_ID {
                    0
                } else {
                    1
                }
            };
            rank(&a.agent_id)
                .cmp(&rank(&b.agent_id))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        let plan = snapshot.ordered_plan();
        Ok(StatusSnapshot {
            session_id: snapshot.session_id,
            status: snapshot.status,
            query: snapshot.query,
            agents,
            plan,
            flow: handle.flow_data(),
            event_count: handle.event_count(),
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        })
    }

    /// Returns the session's report markdown.
    ///
    /// Falls back to the largest non-worklog markdown file for a completed
    /// session whose `final_report.md` is missing, and to a placeholder
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SessionNotFound`] for unknown IDs.
    pub async fn report(&self, session_id: &str) -> Result<String, EngineError> {
        let handle = self.store.get(session_id)?;
        let workspace = Workspace::open(&self.config.reports_dir, session_id);

        let report_path = workspace.session_dir().join(REPORT_FILE);
        if let Ok(report) = tokio::fs::read_to_string(&report_path).await {
            if !report.trim().is_empty() {
                return Ok(report);
            }
        }

        if handle.snapshot().status == SessionStatus::Completed {
            if let Some(path) = largest_markdown(workspace.session_dir().to_path_buf()).await {
                if let Ok(fallback) = tokio::fs::read_to_string(&path).await {
                    return Ok(fallback);
                }
            }
        }

        Ok(NO_REPORT_PLACEHOLDER.to_string())
    }

    /// Serves a file from under the session directory.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SessionNotFound`] for unknown sessions,
    /// [`EngineError::Workspace`] for paths escaping the session directory,
    /// and [`EngineError::Io`] when the file does not exist.
    pub async fn files(
        &self,
        session_id: &str,
        relative_path: &str,
    ) -> Result<(Vec<u8>, &'static str), EngineError> {
        self.store.get(session_id)?;
        let workspace = Workspace::open(&self.config.reports_dir, session_id);
        let path = workspace.resolve_under(workspace.session_dir(), relative_path)?;
        let bytes = tokio::fs::read(&path).await?;
        Ok((bytes, content_type_for(&path)))
    }

    /// Cancels a session. Idempotent: cancelling a terminal or already
    /// cancelled session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SessionNotFound`] for unknown IDs.
    pub fn cancel(&self, session_id: &str) -> Result<(), EngineError> {
        let handle = self.store.get(session_id)?;
        if handle.snapshot().status.is_terminal() {
            return Ok(());
        }
        info!(session_id, "cancellation requested");
        handle.cancel_token().cancel();
        Ok(())
    }

    /// Cancels every live session and waits for their orchestrator tasks.
    pub async fn shutdown(&self) {
        for session_id in self.store.session_ids() {
            if let Ok(handle) = self.store.get(&session_id) {
                handle.cancel_token().cancel();
            }
        }
        let tasks: Vec<(String, JoinHandle<()>)> = self
            .orchestrator_tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain()
            .collect();
        for (session_id, task) in tasks {
            if let Err(e) = task.await {
                warn!(%session_id, error = %e, "orchestrator task join failed");
            }
        }
    }

    /// The underlying store (used by transports serving multiple views).
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }
}

/// Finds the largest `.md` file under `root` whose name does not mention
/// a worklog.
async fn largest_markdown(root: PathBuf) -> Option<PathBuf> {
    let mut stack = vec![root];
    let mut best: Option<(u64, PathBuf)> = None;
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            if !name.ends_with(".md")
                || name.contains("worklog")
                || name == ORCHESTRATOR_WORKLOG
            {
                continue;
            }
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            if best.as_ref().is_none_or(|(b, _)| size > *b) {
                best = Some((size, path));
            }
        }
    }
    best.map(|(_, path)| path)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_largest_markdown_skips_worklogs() {
        let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
        let root = tmp.path().to_path_buf();
        tokio::fs::create_dir_all(root.join("agents/agent_1"))
            .await
            .unwrap_or_else(|e| panic!("mkdir failed: {e}"));
        tokio::fs::write(root.join(ORCHESTRATOR_WORKLOG), "x".repeat(500))
            .await
            .unwrap_or_else(|e| panic!("write failed: {e}"));
        tokio::fs::write(root.join("agents/agent_1/worklog.md"), "y".repeat(400))
            .await
            .unwrap_or_else(|e| panic!("write failed: {e}"));
        tokio::fs::write(root.join("agents/agent_1/results.md"), "z".repeat(300))
            .await
            .unwrap_or_else(|e| panic!("write failed: {e}"));
        tokio::fs::write(root.join("notes.md"), "n".repeat(100))
            .await
            .unwrap_or_else(|e| panic!("write failed: {e}"));

        let best = largest_markdown(root.clone()).await;
        assert_eq!(best, Some(root.join("agents/agent_1/results.md")));
    }

    #[tokio::test]
    async fn test_create_session_validation() {
        let engine = Engine::new(EngineConfig::builder().reports_dir("/tmp/delver-test").build());
        let keys = ApiKeys {
            llm: "k1".to_string(),
            search: "k2".to_string(),
            sandbox: "k3".to_string(),
        };

        let empty = engine
            .create_session(SessionRequest {
                query: "   ".to_string(),
                clarification: None,
                models: ModelSelection::default(),
                api_keys: keys.clone(),
            })
            .await;
        assert!(matches!(empty, Err(EngineError::InvalidQuery { .. })));

        let oversized = engine
            .create_session(SessionRequest {
                query: "q".repeat(10_001),
                clarification: None,
                models: ModelSelection::default(),
                api_keys: keys.clone(),
            })
            .await;
        assert!(matches!(oversized, Err(EngineError::InvalidQuery { .. })));

        let missing_key = engine
            .create_session(SessionRequest {
                query: "valid query".to_string(),
                clarification: None,
                models: ModelSelection::default(),
                api_keys: ApiKeys::default(),
            })
            .await;
        assert!(matches!(missing_key, Err(EngineError::ApiKeyMissing { .. })));
    }

    #[tokio::test]
    async fn test_unknown_session_operations() {
        let engine = Engine::new(EngineConfig::builder().reports_dir("/tmp/delver-test").build());
        assert!(engine.status("nope").is_err());
        assert!(engine.subscribe("nope").is_err());
        assert!(engine.cancel("nope").is_err());
        assert!(engine.report("nope").await.is_err());
        assert!(engine.files("nope", "final_report.md").await.is_err());
    }
}
