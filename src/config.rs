//! Engine configuration with builder pattern and environment variable support.
//!
//! Configuration is resolved in order: explicit values → environment variables → defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Default minimum gap between search-provider dispatches.
const DEFAULT_MIN_SEARCH_SPACING_MS: u64 = 350;
/// Default per-session concurrent agent cap.
const DEFAULT_MAX_AGENTS: usize = 10;
/// Default orchestrator outer-loop turn cap.
const DEFAULT_ORCHESTRATOR_STEP_CAP: usize = 100;
/// Default sub-agent inner-loop turn cap per attempt.
const DEFAULT_SUB_AGENT_STEP_CAP: usize = 25;
/// Default sub-agent validation attempts.
const DEFAULT_SUB_AGENT_MAX_ATTEMPTS: u32 = 3;
/// Default `wait_for_agents` timeout.
const DEFAULT_WAIT_FOR_AGENTS_TIMEOUT_SEC: u64 = 180;
/// Default sandbox-side execution timeout.
const DEFAULT_SANDBOX_TIMEOUT_MS: u64 = 30_000;
/// Default grace period before cancellation when all subscribers disconnect.
const DEFAULT_ABORT_GRACE_PERIOD_MS: u64 = 5_000;
/// Default delay before a completed session's workspace is deleted.
const DEFAULT_SESSION_CLEANUP_DELAY_MS: u64 = 600_000;
/// Default retention for terminal sessions in the store.
const DEFAULT_SESSION_RETENTION_SECS: u64 = 24 * 60 * 60;
/// Default minimum content length (beyond the header) for a valid results file.
const DEFAULT_RESULTS_MIN_CHARS: usize = 100;
/// Default search-queue retry cap.
const DEFAULT_SEARCH_MAX_RETRIES: u32 = 3;

/// Model identifiers for the five LLM roles in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSelection {
    /// Drives the top-level tool-calling loop.
    pub orchestrator: String,
    /// Produces the strategic perspective for `generate_plan`.
    pub planner: String,
    /// Compresses raw search text before it reaches an agent.
    pub summarizer: String,
    /// Writes the final markdown report.
    pub report_writer: String,
    /// Drives each sub-agent's tool-calling loop.
    pub sub_agent: String,
}

impl Default for ModelSelection {
    fn default() -> Self {
        Self {
            orchestrator: "gpt-5.2-2025-12-11".to_string(),
            planner: "gpt-5.2-2025-12-11".to_string(),
            summarizer: "gpt-5-mini-2025-08-07".to_string(),
            report_writer: "gpt-5.2-2025-12-11".to_string(),
            sub_agent: "gpt-5-mini-2025-08-07".to_string(),
        }
    }
}

/// API keys for the three external capability providers.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// Key for the LLM provider.
    pub llm: String,
    /// Key for the web search provider.
    pub search: String,
    /// Key for the code execution sandbox.
    pub sandbox: String,
}

impl ApiKeys {
    /// Verifies all three keys are present.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ApiKeyMissing`] naming the first absent provider.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.llm.trim().is_empty() {
            return Err(EngineError::ApiKeyMissing { provider: "llm" });
        }
        if self.search.trim().is_empty() {
            return Err(EngineError::ApiKeyMissing { provider: "search" });
        }
        if self.sandbox.trim().is_empty() {
            return Err(EngineError::ApiKeyMissing { provider: "sandbox" });
        }
        Ok(())
    }
}

/// Configuration for the research engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for per-session workspaces.
    pub reports_dir: std::path::PathBuf,
    /// Optional base URL override for the LLM provider.
    pub llm_base_url: Option<String>,
    /// Minimum gap between search-provider dispatches.
    pub min_search_spacing: Duration,
    /// Maximum retries per search queue item.
    pub search_max_retries: u32,
    /// Per-session concurrent agent cap.
    pub max_agents: usize,
    /// LLM outer-loop turn cap for the orchestrator.
    pub orchestrator_step_cap: usize,
    /// LLM inner-loop turn cap per sub-agent attempt.
    pub sub_agent_step_cap: usize,
    /// Sub-agent validation attempts before failing.
    pub sub_agent_max_attempts: u32,
    /// Default timeout for `wait_for_agents`.
    pub wait_for_agents_timeout: Duration,
    /// Sandbox-side execution timeout.
    pub sandbox_timeout: Duration,
    /// Grace period before cancellation when all subscribers disconnect.
    pub abort_grace_period: Duration,
    /// Delay before a terminal session's workspace is deleted.
    /// `None` disables workspace cleanup.
    pub session_cleanup_delay: Option<Duration>,
    /// Retention for terminal sessions in the store.
    pub session_retention: Duration,
    /// Minimum content length (beyond the header) for a valid results file.
    pub results_min_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reports_dir: std::path::PathBuf::from("reports"),
            llm_base_url: None,
            min_search_spacing: Duration::from_millis(DEFAULT_MIN_SEARCH_SPACING_MS),
            search_max_retries: DEFAULT_SEARCH_MAX_RETRIES,
            max_agents: DEFAULT_MAX_AGENTS,
            orchestrator_step_cap: DEFAULT_ORCHESTRATOR_STEP_CAP,
            sub_agent_step_cap: DEFAULT_SUB_AGENT_STEP_CAP,
            sub_agent_max_attempts: DEFAULT_SUB_AGENT_MAX_ATTEMPTS,
            wait_for_agents_timeout: Duration::from_secs(DEFAULT_WAIT_FOR_AGENTS_TIMEOUT_SEC),
            sandbox_timeout: Duration::from_millis(DEFAULT_SANDBOX_TIMEOUT_MS),
            abort_grace_period: Duration::from_millis(DEFAULT_ABORT_GRACE_PERIOD_MS),
            session_cleanup_delay: Some(Duration::from_millis(DEFAULT_SESSION_CLEANUP_DELAY_MS)),
            session_retention: Duration::from_secs(DEFAULT_SESSION_RETENTION_SECS),
            results_min_chars: DEFAULT_RESULTS_MIN_CHARS,
        }
    }
}

impl EngineConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Creates configuration from environment variables with defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::builder().from_env().build()
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    reports_dir: Option<std::path::PathBuf>,
    llm_base_url: Option<String>,
    min_search_spacing: Option<Duration>,
    search_max_retries: Option<u32>,
    max_agents: Option<usize>,
    orchestrator_step_cap: Option<usize>,
    sub_agent_step_cap: Option<usize>,
    sub_agent_max_attempts: Option<u32>,
    wait_for_agents_timeout: Option<Duration>,
    sandbox_timeout: Option<Duration>,
    abort_grace_period: Option<Duration>,
    session_cleanup_delay: Option<Option<Duration>>,
    session_retention: Option<Duration>,
    results_min_chars: Option<usize>,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl EngineConfigBuilder {
    /// Populates unset fields from `DELVER_*` environment variables.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if self.reports_dir.is_none() {
            self.reports_dir = std::env::var("DELVER_REPORTS_DIR")
                .ok()
                .map(std::path::PathBuf::from);
        }
        if self.llm_base_url.is_none() {
            self.llm_base_url = std::env::var("OPENAI_BASE_URL")
                .or_else(|_| std::env::var("DELVER_LLM_BASE_URL"))
                .ok();
        }
        if self.min_search_spacing.is_none() {
            self.min_search_spacing =
                env_parse("DELVER_MIN_SEARCH_SPACING_MS").map(Duration::from_millis);
        }
        if self.max_agents.is_none() {
            self.max_agents = env_parse("DELVER_MAX_AGENTS");
        }
        if self.orchestrator_step_cap.is_none() {
            self.orchestrator_step_cap = env_parse("DELVER_ORCHESTRATOR_STEP_CAP");
        }
        if self.sub_agent_step_cap.is_none() {
            self.sub_agent_step_cap = env_parse("DELVER_SUB_AGENT_STEP_CAP");
        }
        if self.sub_agent_max_attempts.is_none() {
            self.sub_agent_max_attempts = env_parse("DELVER_SUB_AGENT_MAX_ATTEMPTS");
        }
        if self.wait_for_agents_timeout.is_none() {
            self.wait_for_agents_timeout =
                env_parse("DELVER_WAIT_FOR_AGENTS_TIMEOUT_SEC").map(Duration::from_secs);
        }
        if self.sandbox_timeout.is_none() {
            self.sandbox_timeout = env_parse("DELVER_SANDBOX_TIMEOUT_MS").map(Duration::from_millis);
        }
        if self.abort_grace_period.is_none() {
            self.abort_grace_period =
                env_parse("DELVER_ABORT_GRACE_PERIOD_MS").map(Duration::from_millis);
        }
        if self.session_cleanup_delay.is_none() {
            self.session_cleanup_delay = env_parse("DELVER_SESSION_CLEANUP_DELAY_MS")
                .map(|ms: u64| Some(Duration::from_millis(ms)));
        }
        if self.session_retention.is_none() {
            self.session_retention =
                env_parse("DELVER_SESSION_RETENTION_SECS").map(Duration::from_secs);
        }
        if self.results_min_chars.is_none() {
            self.results_min_chars = env_parse("DELVER_RESULTS_MIN_CHARS");
        }
        self
    }

    /// Sets the workspace root directory.
    #[must_use]
    pub fn reports_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    /// Sets the LLM base URL override.
    #[must_use]
    pub fn llm_base_url(mut self, url: impl Into<String>) -> Self {
        self.llm_base_url = Some(url.into());
        self
    }

    /// Sets the minimum search dispatch spacing.
    #[must_use]
    pub const fn min_search_spacing(mut self, spacing: Duration) -> Self {
        self.min_search_spacing = Some(spacing);
        self
    }

    /// Sets the search-queue retry cap.
    #[must_use]
    pub const fn search_max_retries(mut self, n: u32) -> Self {
        self.search_max_retries = Some(n);
        self
    }

    /// Sets the per-session agent cap.
    #[must_use]
    pub const fn max_agents(mut self, n: usize) -> Self {
        self.max_agents = Some(n);
        self
    }

    /// Sets the orchestrator turn cap.
    #[must_use]
    pub const fn orchestrator_step_cap(mut self, n: usize) -> Self {
        self.orchestrator_step_cap = Some(n);
        self
    }

    /// Sets the sub-agent turn cap per attempt.
    #[must_use]
    pub const fn sub_agent_step_cap(mut self, n: usize) -> Self {
        self.sub_agent_step_cap = Some(n);
        self
    }

    /// Sets the sub-agent validation attempt cap.
    #[must_use]
    pub const fn sub_agent_max_attempts(mut self, n: u32) -> Self {
        self.sub_agent_max_attempts = Some(n);
        self
    }

    /// Sets the `wait_for_agents` default timeout.
    #[must_use]
    pub const fn wait_for_agents_timeout(mut self, timeout: Duration) -> Self {
        self.wait_for_agents_timeout = Some(timeout);
        self
    }

    /// Sets the sandbox execution timeout.
    #[must_use]
    pub const fn sandbox_timeout(mut self, timeout: Duration) -> Self {
        self.sandbox_timeout = Some(timeout);
        self
    }

    /// Sets the abort grace period.
    #[must_use]
    pub const fn abort_grace_period(mut self, period: Duration) -> Self {
        self.abort_grace_period = Some(period);
        self
    }

    /// Sets the workspace cleanup delay. `None` disables cleanup.
    #[must_use]
    pub const fn session_cleanup_delay(mut self, delay: Option<Duration>) -> Self {
        self.session_cleanup_delay = Some(delay);
        self
    }

    /// Sets the terminal-session retention.
    #[must_use]
    pub const fn session_retention(mut self, retention: Duration) -> Self {
        self.session_retention = Some(retention);
        self
    }

    /// Sets the minimum valid results-file content length.
    #[must_use]
    pub const fn results_min_chars(mut self, n: usize) -> Self {
        self.results_min_chars = Some(n);
        self
    }

    /// Builds the [`EngineConfig`], filling unset fields with defaults.
    #[must_use]
    pub fn build(self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            reports_dir: self.reports_dir.unwrap_or(defaults.reports_dir),
            llm_base_url: self.llm_base_url,
            min_search_spacing: self.min_search_spacing.unwrap_or(defaults.min_search_spacing),
            search_max_retries: self.search_max_retries.unwrap_or(defaults.search_max_retries),
            max_agents: self.max_agents.unwrap_or(defaults.max_agents),
            orchestrator_step_cap: self
                .orchestrator_step_cap
                .unwrap_or(defaults.orchestrator_step_cap),
            sub_agent_step_cap: self.sub_agent_step_cap.unwrap_or(defaults.sub_agent_step_cap),
            sub_agent_max_attempts: self
                .sub_agent_max_attempts
                .unwrap_or(defaults.sub_agent_max_attempts),
            wait_for_agents_timeout: self
                .wait_for_agents_timeout
                .unwrap_or(defaults.wait_for_agents_timeout),
            sandbox_timeout: self.sandbox_timeout.unwrap_or(defaults.sandbox_timeout),
            abort_grace_period: self.abort_grace_period.unwrap_or(defaults.abort_grace_period),
            session_cleanup_delay: self
                .session_cleanup_delay
                .unwrap_or(defaults.session_cleanup_delay),
            session_retention: self.session_retention.unwrap_or(defaults.session_retention),
            results_min_chars: self.results_min_chars.unwrap_or(defaults.results_min_chars),
        }
    }
}
