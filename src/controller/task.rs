//! Task poller
//!
//! Drives a submitted remote task to a terminal state. A task that is
//! already terminal is returned without another fetch; otherwise the poller
//! waits one interval, re-fetches by id and repeats. Fetch errors go through
//! the classifier: Locked and Transient failures are retried inside the same
//! budget, anything else aborts. A `failed` task is a definitive outcome and
//! becomes [`Error::TaskFailed`] carrying the remote message.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::classify::classify;
use super::context::{with_last_error, ReconcileContext};
use crate::client::types::{Task, TaskState};
use crate::error::{Error, Result};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollPolicy {
    /// Wait between two fetches of the same task or object
    #[serde(rename = "interval_secs", with = "crate::config::duration_secs")]
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Wait for `task` to complete
pub async fn await_task(ctx: &ReconcileContext, task: Task) -> Result<Task> {
    if task.state.is_terminal() {
        return finish(task);
    }

    let operation = format!("await task {}", task.id);
    let interval = ctx.config().poll.interval;
    let started = tokio::time::Instant::now();
    let mut last_error: Option<String> = None;

    debug!(task_id = %task.id, name = %task.name, state = %task.state, "Waiting for task");

    loop {
        ctx.pause(interval, &operation)
            .await
            .map_err(|e| with_last_error(e, &last_error))?;

        match ctx.gateway().get_task(&task.id).await {
            Ok(current) => {
                last_error = None;
                if current.state.is_terminal() {
                    info!(
                        task_id = %current.id,
                        state = %current.state,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Task finished"
                    );
                    return finish(current);
                }
                debug!(task_id = %current.id, state = %current.state, "Task still running");
            }
            Err(e) => {
                let class = classify(&e);
                if !class.is_retryable() {
                    return Err(e.at(format!("fetch task {}", task.id)));
                }
                warn!(task_id = %task.id, class = %class, error = %e, "Task fetch failed, will retry");
                last_error = Some(e.to_string());
            }
        }
    }
}

fn finish(task: Task) -> Result<Task> {
    match task.state {
        TaskState::Failed => Err(Error::TaskFailed {
            task_id: task.id,
            message: task.message,
        }),
        _ => Ok(task),
    }
}

/// Outcome of one readiness probe
#[derive(Debug)]
pub enum Probe<T> {
    Ready(T),
    /// Not there yet; the string says why, for logs and timeout messages
    Pending(String),
}

/// Probe until ready, sleeping one poll interval between probes
///
/// Probe errors that classify as Locked or Transient count as "not yet";
/// anything else aborts.
pub async fn poll_until<T, F, Fut>(
    ctx: &ReconcileContext,
    operation: &str,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>>>,
{
    let interval = ctx.config().poll.interval;
    let mut last: Option<String> = None;

    loop {
        ctx.check(operation).map_err(|e| with_last_error(e, &last))?;

        match probe().await {
            Ok(Probe::Ready(value)) => return Ok(value),
            Ok(Probe::Pending(reason)) => {
                debug!(operation = %operation, reason = %reason, "Not ready yet");
                last = Some(reason);
            }
            Err(e) if classify(&e).is_retryable() => {
                warn!(operation = %operation, error = %e, "Probe failed, will retry");
                last = Some(e.to_string());
            }
            Err(e) => return Err(e),
        }

        ctx.pause(interval, operation)
            .await
            .map_err(|e| with_last_error(e, &last))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{context_with, task, FakeGateway};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_terminal_task_needs_no_fetch() {
        let gateway = Arc::new(FakeGateway::new());
        let ctx = context_with(gateway.clone(), Duration::from_secs(5));

        let done = await_task(&ctx, task("t-1", TaskState::Completed)).await.unwrap();
        assert_eq!(done.id, "t-1");

        let err = await_task(&ctx, {
            let mut t = task("t-2", TaskState::Failed);
            t.message = "Not enough hosts".to_string();
            t
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "task t-2 failed: Not enough hosts");

        assert_eq!(gateway.count("get_task"), 0);
    }

    #[tokio::test]
    async fn test_polls_until_completed() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.script_task(
            "t-1",
            &[TaskState::Running, TaskState::Running, TaskState::Completed],
        );
        let ctx = context_with(gateway.clone(), Duration::from_secs(5));

        let done = await_task(&ctx, task("t-1", TaskState::Pending)).await.unwrap();

        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(gateway.count("get_task"), 3);
    }

    #[tokio::test]
    async fn test_failed_task_carries_remote_message() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.script_task("t-1", &[TaskState::Running, TaskState::Failed]);
        gateway.set_task_message("t-1", "Host 10.0.0.5 is unreachable");
        let ctx = context_with(gateway.clone(), Duration::from_secs(5));

        let err = await_task(&ctx, task("t-1", TaskState::Running)).await.unwrap_err();

        assert!(matches!(err, Error::TaskFailed { .. }));
        assert_eq!(err.remote_message(), Some("Host 10.0.0.5 is unreachable"));
    }

    #[tokio::test]
    async fn test_transient_fetch_errors_are_retried() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.script_task("t-1", &[TaskState::Completed]);
        gateway.fail("get_task", 503, "service unavailable", 2);
        let ctx = context_with(gateway.clone(), Duration::from_secs(5));

        let done = await_task(&ctx, task("t-1", TaskState::Pending)).await.unwrap();

        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(gateway.count("get_task"), 3);
    }

    #[tokio::test]
    async fn test_fatal_fetch_error_aborts() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.fail("get_task", 403, "forbidden", 1);
        let ctx = context_with(gateway.clone(), Duration::from_secs(5));

        let err = await_task(&ctx, task("t-1", TaskState::Pending)).await.unwrap_err();

        assert_eq!(err.to_string(), "fetch task t-1: API error 403: forbidden");
        assert_eq!(gateway.count("get_task"), 1);
    }

    #[tokio::test]
    async fn test_never_finishing_task_times_out() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.script_task("t-1", &[TaskState::Running]);
        let ctx = context_with(gateway.clone(), Duration::from_millis(40));

        let err = await_task(&ctx, task("t-1", TaskState::Pending)).await.unwrap_err();

        assert!(matches!(err, Error::Timeout { ref operation, .. } if operation == "await task t-1"));
    }

    #[tokio::test]
    async fn test_cancellation_between_polls() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.script_task("t-1", &[TaskState::Running]);
        let cancel = CancellationToken::new();
        let ctx = ReconcileContext::new(
            gateway.clone(),
            Arc::new(crate::controller::testing::fast_config()),
            cancel.clone(),
            "test",
            Duration::from_secs(10),
        );

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            trigger.cancel();
        });

        let err = await_task(&ctx, task("t-1", TaskState::Pending)).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_poll_until_ready() {
        let gateway = Arc::new(FakeGateway::new());
        let ctx = context_with(gateway, Duration::from_secs(5));
        let probes = &std::sync::atomic::AtomicU32::new(0);

        let value = poll_until(&ctx, "wait for pool", || async move {
            let n = probes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            match n {
                0 => Ok(Probe::Pending("building".to_string())),
                1 => Err(Error::Connection("reset".to_string())),
                _ => Ok(Probe::Ready(n)),
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_poll_until_timeout_reports_last_reason() {
        let gateway = Arc::new(FakeGateway::new());
        let ctx = context_with(gateway, Duration::from_millis(30));

        let err = poll_until(&ctx, "wait for pool p-1", || async {
            Ok::<Probe<()>, Error>(Probe::Pending("state is deleting".to_string()))
        })
        .await
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "wait for pool p-1 timed out after 0s (last error: state is deleting)"
        );
    }
}
