//! Classified retry with exponential backoff and jitter
//!
//! Only errors classified as Locked or Transient are retried. Every backoff
//! sleep goes through the call's context, so the loop ends with `Timeout`
//! (carrying the last failure) once the budget is spent.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::classify::classify;
use super::context::{with_last_error, ReconcileContext};
use crate::error::Result;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(rename = "initial_delay_secs", with = "crate::config::duration_secs")]
    pub initial_delay: Duration,
    /// Upper bound for a single backoff sleep
    #[serde(rename = "max_delay_secs", with = "crate::config::duration_secs")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Nominal delay before retry number `attempt` (1-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, reaches
/// `max_attempts` (0 = bounded only by the budget) or the budget runs out.
pub async fn with_retry<T, F, Fut>(
    ctx: &ReconcileContext,
    operation: &str,
    max_attempts: u32,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let policy = &ctx.config().retry;
    let mut attempt = 0u32;
    let mut last_error: Option<String> = None;

    loop {
        ctx.check(operation)
            .map_err(|e| with_last_error(e, &last_error))?;
        attempt += 1;

        let err = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = %operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        let class = classify(&err);
        if !class.is_retryable() {
            return Err(err);
        }
        if max_attempts > 0 && attempt >= max_attempts {
            warn!(operation = %operation, attempt, error = %err, "Giving up after max attempts");
            return Err(err);
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(policy.delay_for(attempt).as_secs_f64() * jitter);

        warn!(
            operation = %operation,
            attempt,
            class = %class,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying"
        );
        last_error = Some(err.to_string());

        ctx.pause(delay, operation)
            .await
            .map_err(|e| with_last_error(e, &last_error))?;
    }
}
