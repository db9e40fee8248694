use crate::db::connection::with_conn;
use crate::queue::{store, Task};
use crate::state::AppState;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Enqueues the periodic sweeps on a cron cadence. The sweeps themselves
/// run on the task workers like any other unit.
pub struct SweepScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl SweepScheduler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    /// Registers one job that enqueues both sweeps at every `cron` tick.
    pub async fn schedule_sweeps(&self, cron_expression: &str) -> anyhow::Result<()> {
        let state = self.state.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                for task in [Task::ExecuteSchedules, Task::DeleteExpiredBackups] {
                    let name = task.name();
                    match with_conn(&state.db, move |conn| store::enqueue(conn, task)).await {
                        Ok(task_uuid) => tracing::debug!(task_uuid = %task_uuid, task = name, "Sweep enqueued"),
                        Err(e) => tracing::error!(task = name, error = %e, "Failed to enqueue sweep"),
                    }
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron_expression, "Sweeps scheduled");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
