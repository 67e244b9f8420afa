//! Bounded exponential backoff.
//!
//! Used by the embedding providers, the completion client and the SQLite
//! vector store. Only [`RagError::Transport`] is retried; anything else is
//! returned immediately. When the attempt ceiling is hit the last transport
//! error is escalated to [`RagError::UpstreamUnavailable`].
//!
//! Backoff: `base`, `2·base`, `4·base`, ... capped at `32·base`.

use std::future::Future;
use std::time::Duration;

use ragline_core::error::{RagError, Result};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << (attempt.saturating_sub(1)).min(5))
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// If `cancel` fires while waiting between attempts, returns
/// [`RagError::Cancelled`].
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    service: &str,
    cancel: Option<&CancellationToken>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;

    for attempt in 0..policy.attempts() {
        if attempt > 0 {
            let delay = policy.delay(attempt);
            let reason = last_err.as_ref().map(ToString::to_string).unwrap_or_default();
            tracing::warn!(
                service,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "transient failure, backing off"
            );
            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(RagError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }

    let err = last_err.unwrap_or_else(|| RagError::transport(service, "no attempt was made"));
    tracing::error!(service, attempts = policy.attempts(), error = %err, "giving up");
    Err(err.exhausted(policy.attempts()))
}

/// Classify a non-success HTTP status: 429 and 5xx are transient, every
/// other status means the request itself was rejected.
pub fn classify_status(service: &str, status: reqwest::StatusCode, body: &str) -> RagError {
    if status.as_u16() == 429 || status.is_server_error() {
        RagError::transport(service, format!("HTTP {status}: {body}"))
    } else {
        RagError::validation(format!("{service} rejected the request (HTTP {status}): {body}"))
    }
}

/// Connection and timeout failures are transient; anything else (bad
/// response body, builder errors) is a processing failure.
pub fn classify_reqwest(service: &str, err: reqwest::Error) -> RagError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        RagError::transport(service, err)
    } else {
        RagError::processing(format!("{service}: {err}"))
    }
}
