//! Per-session workspace directories and path containment.
//!
//! Layout: `reports/<sessionId>/` holding the orchestrator plan and worklog,
//! `agents/<agentId>/{worklog.md, results.md, status.json, charts/}`, a
//! shared `artifacts/` tree, and eventually `final_report.md`.
//!
//! Every model-supplied path is resolved through [`Workspace::resolve_under`],
//! which rejects absolute paths, traversal above the base, and symlinks.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::EngineError;

/// Plan document file name.
pub const PLAN_FILE: &str = "orchestrator_plan.json";
/// Orchestrator worklog file name.
pub const ORCHESTRATOR_WORKLOG: &str = "orchestrator_worklog.md";
/// Final report file name.
pub const REPORT_FILE: &str = "final_report.md";
/// Per-agent results file name.
pub const RESULTS_FILE: &str = "results.md";
/// Per-agent worklog file name.
pub const WORKLOG_FILE: &str = "worklog.md";
/// Per-agent status file name.
pub const STATUS_FILE: &str = "status.json";
/// Per-agent chart directory name.
pub const CHARTS_DIR: &str = "charts";

/// Handle to one session's directory tree.
#[derive(Debug, Clone)]
pub struct Workspace {
    session_dir: PathBuf,
}

impl Workspace {
    /// Creates the session directory tree under `reports_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] on filesystem failures.
    pub async fn create(reports_dir: &Path, session_id: &str) -> Result<Self, EngineError> {
        let session_dir = reports_dir.join(session_id);
        tokio::fs::create_dir_all(session_dir.join("agents")).await?;
        tokio::fs::create_dir_all(session_dir.join("artifacts")).await?;
        debug!(session_id, dir = %session_dir.display(), "workspace created");
        Ok(Self { session_dir })
    }

    /// Opens an existing session directory without creating anything.
    #[must_use]
    pub fn open(reports_dir: &Path, session_id: &str) -> Self {
        Self {
            session_dir: reports_dir.join(session_id),
        }
    }

    /// The session root directory.
    #[must_use]
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// The directory of one agent.
    #[must_use]
    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.session_dir.join("agents").join(agent_id)
    }

    /// The shared artifacts directory for one agent.
    #[must_use]
    pub fn artifacts_dir(&self, agent_id: &str) -> PathBuf {
        self.session_dir.join("artifacts").join(agent_id)
    }

    /// Creates one agent's directory tree (`worklog`, `results`, `charts/`).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] on filesystem failures.
    pub async fn create_agent_dirs(&self, agent_id: &str) -> Result<PathBuf, EngineError> {
        let agent_dir = self.agent_dir(agent_id);
        tokio::fs::create_dir_all(agent_dir.join(CHARTS_DIR)).await?;
        Ok(agent_dir)
    }

    /// Resolves a model-supplied relative path under `base`, refusing
    /// anything that would escape it.
    ///
    /// Absolute paths, `..` traversal above the base, and symlinked
    /// components are all rejected. `base` must itself be inside this
    /// session's directory.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Workspace`] on containment violations.
    pub fn resolve_under(&self, base: &Path, relative: &str) -> Result<PathBuf, EngineError> {
        let supplied = Path::new(relative);
        if supplied.is_absolute() {
            return Err(EngineError::Workspace {
                message: format!("absolute paths are not allowed: {relative}"),
            });
        }

        let mut resolved = base.to_path_buf();
        let mut depth: usize = 0;
        for component in supplied.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(EngineError::Workspace {
                            message: format!("path escapes its sandbox: {relative}"),
                        });
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(EngineError::Workspace {
                        message: format!("invalid path component in {relative}"),
                    });
                }
            }
        }

        if !resolved.starts_with(&self.session_dir) || !resolved.starts_with(base) {
            return Err(EngineError::Workspace {
                message: format!("path escapes its sandbox: {relative}"),
            });
        }

        // Refuse symlinks anywhere along the resolved path below the base.
        let mut probe = base.to_path_buf();
        for component in resolved.strip_prefix(base).into_iter().flatten() {
            probe.push(component);
            if let Ok(meta) = std::fs::symlink_metadata(&probe)
                && meta.file_type().is_symlink()
            {
                return Err(EngineError::Workspace {
                    message: format!("symlinks are not allowed: {relative}"),
                });
            }
        }

        Ok(resolved)
    }

    /// Copies a set of files into the artifacts directory for `agent_id`.
    ///
    /// Each file is written to a temporary name and renamed into place, so
    /// readers never observe partial copies.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] on filesystem failures.
    pub async fn copy_artifacts(
        &self,
        agent_id: &str,
        files: &[PathBuf],
    ) -> Result<Vec<String>, EngineError> {
        let dest_dir = self.artifacts_dir(agent_id);
        tokio::fs::create_dir_all(&dest_dir).await?;

        let mut relative_paths = Vec::with_capacity(files.len());
        for source in files {
            let Some(name) = source.file_name() else {
                continue;
            };
            let dest = dest_dir.join(name);
            let tmp = dest_dir.join(format!(
                ".{}.tmp",
                name.to_string_lossy()
            ));
            tokio::fs::copy(source, &tmp).await?;
            tokio::fs::rename(&tmp, &dest).await?;
            relative_paths.push(format!(
                "artifacts/{agent_id}/{}",
                name.to_string_lossy()
            ));
        }
        Ok(relative_paths)
    }

    /// Schedules deletion of the whole session tree after `delay`.
    pub fn schedule_cleanup(&self, delay: Duration) {
        let dir = self.session_dir.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(dir = %dir.display(), error = %e, "workspace cleanup failed");
            } else {
                debug!(dir = %dir.display(), "workspace removed");
            }
        });
    }
}

/// Content type for a served workspace file, derived from its extension.
#[must_use]
pub fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("md") => "text/markdown; charset=utf-8",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("txt") => "text/plain; charset=utf-8",
        Some("html") => "text/html; charset=utf-8",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    async fn workspace() -> (tempfile::TempDir, Workspace) {
        let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
        let ws = Workspace::create(tmp.path(), "session-1")
            .await
            .unwrap_or_else(|e| panic!("create failed: {e}"));
        (tmp, ws)
    }

    #[tokio::test]
    async fn test_create_layout() {
        let (_tmp, ws) = workspace().await;
        assert!(ws.session_dir().join("agents").is_dir());
        assert!(ws.session_dir().join("artifacts").is_dir());
        let agent_dir = ws
            .create_agent_dirs("agent_1")
            .await
            .unwrap_or_else(|e| panic!("agent dirs failed: {e}"));
        assert!(agent_dir.join(CHARTS_DIR).is_dir());
    }

    #[tokio::test]
    async fn test_resolve_rejects_traversal() {
        let (_tmp, ws) = workspace().await;
        let base = ws.agent_dir("agent_1");
        assert!(ws.resolve_under(&base, "../../etc/passwd").is_err());
        assert!(ws.resolve_under(&base, "../agent_2/results.md").is_err());
        assert!(ws.resolve_under(&base, "/etc/passwd").is_err());
        assert!(ws.resolve_under(&base, "charts/../../x").is_err());
    }

    #[tokio::test]
    async fn test_resolve_accepts_contained() {
        let (_tmp, ws) = workspace().await;
        let base = ws.agent_dir("agent_1");
        let resolved = ws
            .resolve_under(&base, "charts/./plot.png")
            .unwrap_or_else(|e| panic!("resolve failed: {e}"));
        assert_eq!(resolved, base.join("charts").join("plot.png"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_rejects_symlink() {
        let (tmp, ws) = workspace().await;
        let base = ws
            .create_agent_dirs("agent_1")
            .await
            .unwrap_or_else(|e| panic!("agent dirs failed: {e}"));
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap_or_else(|e| panic!("mkdir failed: {e}"));
        std::os::unix::fs::symlink(&outside, base.join("link"))
            .unwrap_or_else(|e| panic!("symlink failed: {e}"));
        assert!(ws.resolve_under(&base, "link/file.md").is_err());
    }

    #[tokio::test]
    async fn test_copy_artifacts() {
        let (_tmp, ws) = workspace().await;
        let agent_dir = ws
            .create_agent_dirs("agent_1")
            .await
            .unwrap_or_else(|e| panic!("agent dirs failed: {e}"));
        let results = agent_dir.join(RESULTS_FILE);
        tokio::fs::write(&results, "# Results\ndata")
            .await
            .unwrap_or_else(|e| panic!("write failed: {e}"));
        let chart = agent_dir.join(CHARTS_DIR).join("c.png");
        tokio::fs::write(&chart, b"\x89PNG")
            .await
            .unwrap_or_else(|e| panic!("write failed: {e}"));

        let copied = ws
            .copy_artifacts("agent_1", &[results, chart])
            .await
            .unwrap_or_else(|e| panic!("copy failed: {e}"));
        assert_eq!(
            copied,
            vec![
                "artifacts/agent_1/results.md".to_string(),
                "artifacts/agent_1/c.png".to_string()
            ]
        );
        assert!(ws.artifacts_dir("agent_1").join("c.png").is_file());
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("a.PNG")), "image/png");
        assert_eq!(
            content_type_for(Path::new("final_report.md")),
            "text/markdown; charset=utf-8"
        );
        assert_eq!(
            content_type_for(Path::new("mystery.bin")),
            "application/octet-stream"
        );
    }
}
