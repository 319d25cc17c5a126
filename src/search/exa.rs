//! Exa search adapter.
//!
//! Talks to the Exa `/search` endpoint with content extraction enabled.
//! Transport and HTTP-status failures map to [`EngineError::Search`] with
//! enough detail for the rate gate's retry classification.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{SearchDocument, SearchOptions, SearchProvider, SearchResponse};
use crate::error::EngineError;

const DEFAULT_ENDPOINT: &str = "https://api.exa.ai/search";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Exa-backed [`SearchProvider`].
pub struct ExaSearchProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

#[derive(Serialize)]
struct ExaRequest<'a> {
    query: &'a str,
    #[serde(rename = "numResults")]
    num_results: usize,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    search_type: Option<&'a str>,
    #[serde(rename = "useAutoprompt")]
    use_autoprompt: bool,
    #[serde(rename = "startPublishedDate", skip_serializing_if = "Option::is_none")]
    start_published_date: Option<&'a str>,
    contents: ExaContents,
}

#[derive(Serialize)]
struct ExaContents {
    text: bool,
}

#[derive(Deserialize)]
struct ExaResponse {
    #[serde(default)]
    results: Vec<ExaResult>,
    #[serde(rename = "autopromptString", default)]
    autoprompt: Option<String>,
}

#[derive(Deserialize)]
struct ExaResult {
    #[serde(default)]
    title: Option<String>,
    url: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(rename = "publishedDate", default)]
    published_date: Option<String>,
    #[serde(default)]
    score: Option<f64>,
}

impl ExaSearchProvider {
    /// Creates a provider with the default endpoint.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_endpoint(api_key, DEFAULT_ENDPOINT)
    }

    /// Creates a provider against a custom endpoint (tests, proxies).
    #[must_use]
    pub fn with_endpoint(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            endpoint: endpoint.into(),
        }
    }

    fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
        response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

#[async_trait]
impl SearchProvider for ExaSearchProvider {
    fn name(&self) -> &'static str {
        "exa"
    }

    async fn search_with_contents(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<SearchResponse, EngineError> {
        let body = ExaRequest {
            query,
            num_results: opts.num_results.clamp(1, 10),
            search_type: opts
                .search_type
                .as_deref()
                .filter(|t| *t == "neural" || *t == "keyword"),
            use_autoprompt: opts.use_autoprompt,
            start_published_date: opts.start_published_date.as_deref(),
            contents: ExaContents { text: true },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Search {
                message: e.to_string(),
                status: e.status().map(|s| s.as_u16()),
                retry_after: None,
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = Self::parse_retry_after(&response);
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Search {
                message: format!("HTTP {status}: {}", text.chars().take(300).collect::<String>()),
                status: Some(status.as_u16()),
                retry_after,
            });
        }

        let parsed: ExaResponse = response.json().await.map_err(|e| EngineError::Search {
            message: format!("malformed response: {e}"),
            status: None,
            retry_after: None,
        })?;

        debug!(
            query,
            results = parsed.results.len(),
            "search dispatch complete"
        );

        Ok(SearchResponse {
            results: parsed
                .results
                .into_iter()
                .map(|r| SearchDocument {
                    title: r.title.unwrap_or_else(|| r.url.clone()),
                    url: r.url,
                    text: r.text.unwrap_or_default(),
                    author: r.author,
                    published_date: r.published_date,
                    score: r.score,
                })
                .collect(),
            autoprompt: parsed.autoprompt,
        })
    }
}
