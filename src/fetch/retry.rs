//! # Backoff Retrier
//!
//! ## Purpose
//! Wraps a single network operation with bounded exponential-backoff
//! retry. Only transient errors (per [`PipelineError::is_transient`])
//! consume retry budget; anything else returns immediately.
//!
//! ## Policy
//! Delay before attempt n (1-indexed) = `base_delay * 2^(n-1)`, optionally
//! jittered. Exhausting the budget yields `RetriesExhausted` carrying the
//! last underlying error.

use crate::errors::{PipelineError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy for a single physical request
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            jitter: false,
        }
    }

    /// Delay inserted before attempt `n` (1-indexed; attempt 1 runs
    /// immediately). The unjittered schedule is monotonically
    /// non-decreasing.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(2).min(31);
        let base = self.base_delay.saturating_mul(1u32 << exponent);
        if self.jitter {
            // Bounded deterministic jitter: up to +25%, derived from the
            // attempt number so tests stay reproducible.
            let extra = base.as_millis() as u64 / 4;
            base + Duration::from_millis(extra * u64::from(attempt % 2))
        } else {
            base
        }
    }
}

impl From<&crate::config::FetchConfig> for RetryPolicy {
    fn from(config: &crate::config::FetchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
            jitter: config.jitter,
        }
    }
}

/// Run `op` under the given retry policy. The closure receives the
/// 1-indexed attempt number, mainly for logging.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<PipelineError> = None;

    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            debug!(label, attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
            sleep(delay).await;
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                warn!(label, attempt, error = %e, "transient failure");
                last_error = Some(e);
            }
            // Non-retriable errors fail immediately without consuming
            // the remaining budget.
            Err(e) => return Err(e),
        }
    }

    Err(PipelineError::RetriesExhausted {
        attempts: policy.max_attempts,
        last_error: Box::new(last_error.unwrap_or(PipelineError::Internal {
            message: "retry loop ended without an error".into(),
        })),
    })
}
