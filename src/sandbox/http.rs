//! HTTP sandbox adapter.
//!
//! Posts code to an E2B-style execution endpoint and maps the JSON body
//! straight onto [`SandboxResult`]. Transport failures and non-2xx
//! statuses become [`EngineError::Sandbox`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::{SandboxProvider, SandboxResult};
use crate::error::EngineError;

const DEFAULT_ENDPOINT: &str = "https://api.e2b.dev/v1/execute";

/// HTTP-backed [`SandboxProvider`].
pub struct HttpSandboxProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    language: &'static str,
    code: &'a str,
    #[serde(rename = "timeoutMs")]
    timeout_ms: u64,
}

impl HttpSandboxProvider {
    /// Creates a provider with the default endpoint.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_endpoint(api_key, DEFAULT_ENDPOINT)
    }

    /// Creates a provider against a custom endpoint (tests, proxies).
    #[must_use]
    pub fn with_endpoint(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    fn name(&self) -> &'static str {
        "e2b"
    }

    async fn run_python(&self, code: &str, timeout_ms: u64) -> Result<SandboxResult, EngineError> {
        // The HTTP timeout gets headroom over the sandbox-side limit so the
        // sandbox's own timeout error reaches us instead of a cut connection.
        let http_timeout = Duration::from_millis(timeout_ms.saturating_add(10_000));

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(http_timeout)
            .json(&ExecuteRequest {
                language: "python",
                code,
                timeout_ms,
            })
            .send()
            .await
            .map_err(|e| EngineError::Sandbox {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Sandbox {
                message: format!(
                    "HTTP {status}: {}",
                    text.chars().take(300).collect::<String>()
                ),
            });
        }

        response.json().await.map_err(|e| EngineError::Sandbox {
            message: format!("malformed response: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_parsing() {
        let raw = r#"{
            "results": [{"png": "aGVsbG8=", "text": "<Figure>"}],
            "logs": {"stdout": ["42"], "stderr": []},
            "error": null
        }"#;
        let parsed: SandboxResult = serde_json::from_str(raw).unwrap_or_else(|_| unreachable!());
        assert_eq!(parsed.results.len(), 1);
        assert_eq!(parsed.results[0].png.as_deref(), Some("aGVsbG8="));
        assert_eq!(parsed.logs.stdout, vec!["42"]);
        assert!(parsed.error.is_none());
    }

    #[test]
    fn test_error_parsing() {
        let raw = r#"{"results": [], "logs": {"stdout": [], "stderr": ["boom"]},
                      "error": {"name": "TimeoutError", "value": "execution exceeded 30s"}}"#;
        let parsed: SandboxResult = serde_json::from_str(raw).unwrap_or_else(|_| unreachable!());
        let error = parsed.error.unwrap_or_else(|| unreachable!());
        assert_eq!(error.name, "TimeoutError");
    }
}
