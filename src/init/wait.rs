// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tower::BoxError;
use tracing::error;

pub type TaskResult = Result<(), BoxError>;

/// Wait for the first task of `tasks` to finish.
pub async fn wait_for_any_task(tasks: &mut JoinSet<TaskResult>) -> TaskResult {
    match tasks.join_next().await {
        None => Ok(()),
        Some(res) => res?,
    }
}

/// Wait for every task of `tasks`, giving up after `timeout`. The last task
/// error is returned.
pub async fn wait_for_tasks_with_timeout(
    tasks: &mut JoinSet<TaskResult>,
    timeout: Duration,
) -> TaskResult {
    let stop_at = Instant::now() + timeout;
    let mut result = Ok(());
    loop {
        match timeout_at(stop_at, tasks.join_next()).await {
            Err(_) => {
                tasks.abort_all();
                return Err("timed out waiting for tasks to complete".into());
            }
            Ok(None) => break,
            Ok(Some(Ok(Ok(())))) => {}
            Ok(Some(Ok(Err(e)))) => result = Err(e),
            Ok(Some(Err(e))) => error!(error = ?e, "Failed to join with task"),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_returns_task_error() {
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        tasks.spawn(async { Ok(()) });
        tasks.spawn(async { Err("boom".into()) });
        let err = wait_for_tasks_with_timeout(&mut tasks, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!("boom", err.to_string());
    }

    #[tokio::test]
    async fn test_times_out() {
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        assert!(
            wait_for_tasks_with_timeout(&mut tasks, Duration::from_millis(20))
                .await
                .is_err()
        );
    }
}
