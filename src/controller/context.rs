//! Per-call reconciliation context
//!
//! One context lives for exactly one engine call. It carries the gateway, the
//! engine configuration, the caller's cancellation token and a single deadline
//! derived from the budget of the call's operation category. Every wait in the
//! engine goes through [`ReconcileContext::pause`], so cancellation and the
//! deadline are honoured at each suspension point.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::ObjectGateway;
use crate::config::EngineConfig;
use crate::error::{Error, Result};

pub struct ReconcileContext {
    gateway: Arc<dyn ObjectGateway>,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
    operation: String,
    budget: Duration,
    deadline: Instant,
}

impl ReconcileContext {
    pub fn new(
        gateway: Arc<dyn ObjectGateway>,
        config: Arc<EngineConfig>,
        cancel: CancellationToken,
        operation: impl Into<String>,
        budget: Duration,
    ) -> Self {
        Self {
            gateway,
            config,
            cancel,
            operation: operation.into(),
            budget,
            deadline: Instant::now() + budget,
        }
    }

    pub fn gateway(&self) -> &dyn ObjectGateway {
        self.gateway.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Error for `operation` running out of this call's budget
    pub fn timeout(&self, operation: &str, last_error: Option<String>) -> Error {
        Error::Timeout {
            operation: operation.to_string(),
            budget: self.budget,
            last_error,
        }
    }

    /// Fail fast if the call was cancelled or its deadline has passed
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled {
                operation: operation.to_string(),
            });
        }
        if Instant::now() >= self.deadline {
            return Err(self.timeout(operation, None));
        }
        Ok(())
    }

    /// Suspend for `wait`, clamped to the deadline
    ///
    /// Returns `Cancelled` as soon as the token fires, and `Timeout` when the
    /// deadline is reached before `wait` elapses.
    pub async fn pause(&self, wait: Duration, operation: &str) -> Result<()> {
        self.check(operation)?;
        if wait.is_zero() {
            return Ok(());
        }

        let wanted = Instant::now() + wait;
        let clamped = wanted > self.deadline;
        let until = if clamped { self.deadline } else { wanted };

        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(operation = %operation, "Cancelled while waiting");
                Err(Error::Cancelled { operation: operation.to_string() })
            }
            _ = tokio::time::sleep_until(until) => {
                if clamped {
                    Err(self.timeout(operation, None))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Attach the last retryable failure to a timeout raised by [`ReconcileContext::pause`]
pub(crate) fn with_last_error(err: Error, last: &Option<String>) -> Error {
    match err {
        Error::Timeout {
            operation,
            budget,
            last_error: None,
        } => Error::Timeout {
            operation,
            budget,
            last_error: last.clone(),
        },
        other => other,
    }
}
