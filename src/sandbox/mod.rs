//! Sandboxed code execution capability interface.
//!
//! The engine consumes code execution through [`SandboxProvider`]; the
//! concrete HTTP adapter lives in [`http`]. Executions run Python with
//! stdout/stderr capture and ordered output capture (matplotlib images
//! arrive as base64 payloads).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub mod http;

pub use http::HttpSandboxProvider;

/// One captured output from an execution, in emission order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxOutput {
    /// Base64 PNG payload, when the output is a PNG image.
    #[serde(default)]
    pub png: Option<String>,
    /// Base64 JPEG payload, when the output is a JPEG image.
    #[serde(default)]
    pub jpeg: Option<String>,
    /// Text representation, when available.
    #[serde(default)]
    pub text: Option<String>,
    /// HTML representation, when available.
    #[serde(default)]
    pub html: Option<String>,
}

/// stdout/stderr captured during an execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxLogs {
    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default)]
    pub stderr: Vec<String>,
}

/// A runtime error raised inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxError {
    /// Exception class name.
    pub name: String,
    /// Exception message.
    pub value: String,
}

/// Result of one sandbox execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxResult {
    #[serde(default)]
    pub results: Vec<SandboxOutput>,
    #[serde(default)]
    pub logs: SandboxLogs,
    /// Present when the code raised.
    #[serde(default)]
    pub error: Option<SandboxError>,
}

/// Trait for Python execution backends.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &'static str;

    /// Runs Python source with the given wall-clock timeout.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Sandbox`] when the sandbox itself is
    /// unreachable or misbehaves. In-code exceptions are reported through
    /// [`SandboxResult::error`], not as an `Err`.
    async fn run_python(&self, code: &str, timeout_ms: u64) -> Result<SandboxResult, EngineError>;
}
