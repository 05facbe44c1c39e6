//! Failure classification and bounded retries for remote calls.
//!
//! Every HTTP collaborator maps its failures onto [`RemoteError`] so the caller
//! can tell a flaky network from a revoked credential. Only transient failures
//! are retried; an authentication failure surfaces immediately.

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Credentials were rejected. Rotate the secret; retrying will not help.
    #[error("{service}: credentials rejected: {message}")]
    Unauthorized { service: &'static str, message: String },

    /// Timeout, connection failure, 5xx or rate limiting.
    #[error("{service}: transient failure: {message}")]
    Transient { service: &'static str, message: String },

    /// Any other non-success status. Not retried.
    #[error("{service}: request failed with status {status}: {body}")]
    Rejected {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service}: unexpected response: {message}")]
    InvalidResponse { service: &'static str, message: String },
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient { .. })
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RemoteError::Unauthorized { .. })
    }

    /// Classify a transport-level reqwest failure.
    pub fn from_reqwest(service: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            RemoteError::Transient {
                service,
                message: err.to_string(),
            }
        } else if err.is_decode() || err.is_body() {
            RemoteError::InvalidResponse {
                service,
                message: err.to_string(),
            }
        } else {
            RemoteError::Transient {
                service,
                message: err.to_string(),
            }
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(service: &'static str, status: StatusCode, body: String) -> Self {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            RemoteError::Unauthorized {
                service,
                message: format!("{}: {}", status, body),
            }
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            RemoteError::Transient {
                service,
                message: format!("{}: {}", status, body),
            }
        } else {
            RemoteError::Rejected {
                service,
                status: status.as_u16(),
                body,
            }
        }
    }
}

/// Fixed attempt cap with linear backoff (`step`, `2 * step`, ...).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            step: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, step: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            step,
        }
    }

    /// No retries at all. Used by tests and one-shot diagnostics.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt cap is reached. The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let backoff = self.step * attempt;
                    warn!(%err, attempt, attempts, "{} failed, retrying in {:?}", label, backoff);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    if attempt > 1 {
                        info!(attempt, "{} giving up", label);
                    }
                    return Err(err);
                }
            }
        }
    }
}
