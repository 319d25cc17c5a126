//! Web search capability interface.
//!
//! The engine consumes search through [`SearchProvider`]; the concrete
//! HTTP adapter lives in [`exa`]. All calls are routed through the
//! [`RateGate`](crate::rate_gate::RateGate), never made directly by tools.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub mod exa;

pub use exa::ExaSearchProvider;

/// Options for one search dispatch.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Number of results to retrieve.
    pub num_results: usize,
    /// `"neural"`, `"keyword"`, or `"auto"`.
    pub search_type: Option<String>,
    /// Let the provider rewrite the query.
    pub use_autoprompt: bool,
    /// ISO date lower bound for publication.
    pub start_published_date: Option<String>,
}

/// One ranked document with extracted text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchDocument {
    pub title: String,
    pub url: String,
    /// Extracted page text. Stripped before anything reaches an LLM caller;
    /// only the summarizer sees it.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub published_date: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

/// A full search response.
#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    pub results: Vec<SearchDocument>,
    /// The rewritten query, when autoprompt was applied.
    pub autoprompt: Option<String>,
}

/// Trait for web search backends.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &'static str;

    /// Runs a search and returns ranked documents with extracted text.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Search`] carrying the HTTP status (when one
    /// was received) and any provider-supplied retry hint.
    async fn search_with_contents(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<SearchResponse, EngineError>;
}
