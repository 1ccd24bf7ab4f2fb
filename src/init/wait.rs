// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tower::BoxError;
use tracing::error;

pub type TaskSet = JoinSet<Result<(), BoxError>>;

// Roughly thirty years, used when a deadline is too far out to represent
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Instant `timeout` from now, clamped to a far but representable point.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Wait for the first task to finish and return its result.
pub async fn wait_for_any_task(tasks: &mut TaskSet) -> Result<(), BoxError> {
    match tasks.join_next().await {
        None => Ok(()), // empty set
        Some(res) => res?,
    }
}

/// Wait for every task, returning the last failure seen or a timeout error.
pub async fn wait_for_tasks_with_timeout(
    tasks: &mut TaskSet,
    timeout: Duration,
) -> Result<(), BoxError> {
    let stop_at = deadline_after(timeout);
    let mut result = Ok(());
    loop {
        match timeout_at(stop_at, tasks.join_next()).await {
            Err(_) => {
                tasks.abort_all();
                result = Err("timed out waiting for tasks to complete".into());
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(Ok(())))) => {}
            Ok(Some(Ok(Err(e)))) => result = Err(e),
            Ok(Some(Err(e))) => {
                error!("Failed to join with task: {:?}", e);
                result = Err(e.into());
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_any_task_returns_first_error() {
        let mut tasks = TaskSet::new();
        tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        tasks.spawn(async { Err("boom".into()) });

        let err = wait_for_any_task(&mut tasks).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_timeout_aborts_stragglers() {
        let mut tasks = TaskSet::new();
        tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        let result = wait_for_tasks_with_timeout(&mut tasks, Duration::from_millis(20)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_deadline_after_clamps_huge_timeouts() {
        let now = Instant::now();
        let far = deadline_after(Duration::MAX);
        assert!(far > now + Duration::from_secs(86400 * 365));

        let near = deadline_after(Duration::from_secs(5));
        assert!(near >= now + Duration::from_secs(5));
        assert!(near < far);
    }

    #[tokio::test]
    async fn test_huge_timeout_waits_for_tasks() {
        let mut tasks = TaskSet::new();
        tasks.spawn(async { Ok(()) });
        assert!(
            wait_for_tasks_with_timeout(&mut tasks, Duration::MAX)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_all_tasks_complete() {
        let mut tasks = TaskSet::new();
        for _ in 0..3 {
            tasks.spawn(async { Ok(()) });
        }
        assert!(
            wait_for_tasks_with_timeout(&mut tasks, Duration::from_secs(1))
                .await
                .is_ok()
        );
    }
}
