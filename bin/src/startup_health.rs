use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::task::JoinHandle;

const STARTUP_STABILIZATION_WINDOW: Duration = Duration::from_millis(300);

/// Fails if `task` finishes, for any reason, before the stabilization window
/// has passed.
pub async fn verify_task_running<T, E>(name: &str, task: &mut JoinHandle<Result<T, E>>) -> Result<()>
where
    E: std::fmt::Display,
{
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(join_res) => match join_res {
            Ok(Ok(_)) => Err(anyhow!("{name} exited during startup stabilization window")),
            Ok(Err(err)) => Err(anyhow!("{name} failed during startup: {err}")),
            Err(err) => Err(anyhow!("{name} panicked during startup: {err}")),
        },
    }
}

pub async fn verify_background_task_running(name: &str, task: &mut JoinHandle<()>) -> Result<()> {
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(join_res) => match join_res {
            Ok(()) => Err(anyhow!("{name} exited during startup stabilization window")),
            Err(err) => Err(anyhow!("{name} panicked during startup: {err}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_long_running_task_passes() {
        let mut task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), anyhow::Error>(())
        });
        assert!(verify_task_running("sleeper", &mut task).await.is_ok());
        task.abort();
    }

    #[tokio::test]
    async fn test_early_exit_fails() {
        let mut task = tokio::spawn(async { Ok::<(), anyhow::Error>(()) });
        let err = verify_task_running("quitter", &mut task).await.unwrap_err();
        assert!(err.to_string().contains("exited during startup"));

        let mut task = tokio::spawn(async { Err::<(), _>(anyhow!("boom")) });
        let err = verify_task_running("failer", &mut task).await.unwrap_err();
        assert!(err.to_string().contains("boom"));

        let mut task = tokio::spawn(async {});
        assert!(verify_background_task_running("bg", &mut task).await.is_err());
    }
}
