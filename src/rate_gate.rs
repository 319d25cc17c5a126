//! Serial-queue rate limiter in front of the search provider.
//!
//! All search calls from all agents funnel through one worker task that
//! enforces a minimum spacing between dispatches. A dispatched call that
//! fails retryably (HTTP 429, 5xx, or a transport error) is retried at the
//! head of the queue with exponential backoff before any other queued item
//! runs; non-retryable failures surface to the caller immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::search::{SearchOptions, SearchProvider, SearchResponse};

/// Queue depth before senders start awaiting.
const QUEUE_CAPACITY: usize = 64;

struct Job {
    query: String,
    opts: SearchOptions,
    reply: oneshot::Sender<Result<SearchResponse, EngineError>>,
}

/// Handle to the shared search queue.
#[derive(Clone)]
pub struct RateGate {
    tx: mpsc::Sender<Job>,
}

impl RateGate {
    /// Starts the worker task and returns its handle.
    ///
    /// `min_spacing` is the smallest allowed gap between two dispatches to
    /// the provider; `max_retries` bounds retry attempts per item.
    #[must_use]
    pub fn start(
        provider: Arc<dyn SearchProvider>,
        min_spacing: Duration,
        max_retries: u32,
    ) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(run_worker(provider, rx, min_spacing, max_retries));
        Self { tx }
    }

    /// Enqueues a search and waits for its result.
    ///
    /// # Errors
    ///
    /// Returns the provider error after retries are exhausted, a
    /// non-retryable provider error immediately, or
    /// [`EngineError::Search`] if the worker has shut down.
    pub async fn search(
        &self,
        query: String,
        opts: SearchOptions,
    ) -> Result<SearchResponse, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Job {
                query,
                opts,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::Search {
                message: "search queue is closed".to_string(),
                status: None,
                retry_after: None,
            })?;
        reply_rx.await.map_err(|_| EngineError::Search {
            message: "search worker dropped the request".to_string(),
            status: None,
            retry_after: None,
        })?
    }
}

/// Backoff for the `attempt`-th retry (1-based): 1 s, 2 s, 4 s… normally,
/// 2 s, 4 s, 8 s… for rate limits, overridden by a `Retry-After` hint.
fn retry_delay(error: &EngineError, attempt: u32) -> Duration {
    if let EngineError::Search {
        retry_after: Some(hint),
        ..
    } = error
    {
        return *hint;
    }
    let rate_limited = matches!(
        error,
        EngineError::Search {
            status: Some(429),
            ..
        }
    );
    let base = if rate_limited { 2 } else { 1 };
    Duration::from_secs(base << (attempt.saturating_sub(1)).min(6))
}

async fn run_worker(
    provider: Arc<dyn SearchProvider>,
    mut rx: mpsc::Receiver<Job>,
    min_spacing: Duration,
    max_retries: u32,
) {
    let mut last_dispatch: Option<Instant> = None;

    while let Some(job) = rx.recv().await {
        let mut attempt: u32 = 0;
        let result = loop {
            if let Some(last) = last_dispatch {
                let elapsed = last.elapsed();
                if elapsed < min_spacing {
                    tokio::time::sleep(min_spacing - elapsed).await;
                }
            }
            last_dispatch = Some(Instant::now());

            match provider.search_with_contents(&job.query, &job.opts).await {
                Ok(response) => break Ok(response),
                Err(e) if e.is_retryable_search() && attempt < max_retries => {
                    attempt += 1;
                    let delay = retry_delay(&e, attempt);
                    warn!(
                        query = %job.query,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "search dispatch failed, re-queueing at head"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };
        debug!(query = %job.query, ok = result.is_ok(), "search job done");
        // Caller may have given up; nothing to do then.
        let _ = job.reply.send(result);
    }
}
