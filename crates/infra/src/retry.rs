//! Rate-limit-aware retry around protocol calls.
//!
//! Only `RateLimited` is retried. The wait is exactly what the server asked
//! for (no jitter, no multiplier), every wait races the cancellation token,
//! and an optional cumulative budget stops a caller from being parked
//! indefinitely by repeated rate limits.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use outreach_protocol::{ProtocolError, ProtocolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Upper bound on the sum of rate-limit waits for one call; `None` means unbounded.
    pub max_total_wait: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_total_wait: Some(Duration::from_secs(60 * 60)),
        }
    }
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_total_wait: None,
        }
    }

    pub fn with_budget(max_total_wait: Duration) -> Self {
        Self {
            max_total_wait: Some(max_total_wait),
        }
    }

    /// Run `op` until it returns something other than a rate-limit signal.
    ///
    /// Cancellation during a wait yields `ProtocolError::Cancelled`. When the
    /// next wait would exceed the budget, the rate-limit error itself is returned.
    pub async fn call<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op_name: &str,
        mut op: F,
    ) -> ProtocolResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProtocolResult<T>>,
    {
        let mut waited = Duration::ZERO;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let Some(wait) = err.rate_limit_wait() else {
                return Err(err);
            };

            if let Some(budget) = self.max_total_wait {
                if waited + wait > budget {
                    warn!(
                        op = op_name,
                        attempt,
                        wait_secs = wait.as_secs(),
                        waited_secs = waited.as_secs(),
                        "rate-limit wait exceeds retry budget; giving up"
                    );
                    return Err(err);
                }
            }

            debug!(op = op_name, attempt, wait_ms = wait.as_millis() as u64, "rate limited, waiting");

            tokio::select! {
                _ = cancel.cancelled() => return Err(ProtocolError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
            waited += wait;
        }
    }
}
