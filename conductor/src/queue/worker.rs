use super::store::{self, QueuedTask};
use super::{TaskContext, TaskError};
use crate::db::connection::with_conn;
use crate::services::tasks;
use crate::state::AppState;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawns `config.worker_concurrency` workers that poll the queue until
/// cancelled. A worker finishes the task in hand before it stops.
pub fn start_workers(state: Arc<AppState>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    (0..state.config.worker_concurrency.max(1))
        .map(|worker_id| {
            let state = state.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { worker_loop(worker_id, state, cancel).await })
        })
        .collect()
}

async fn worker_loop(worker_id: usize, state: Arc<AppState>, cancel: CancellationToken) {
    tracing::info!(worker_id, "Task worker started");
    let mut interval = tokio::time::interval(state.config.worker_poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                // Keep going while there is work; fall back to the poll
                // interval once the queue is empty.
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match run_once(&state).await {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) => {
                            tracing::error!(worker_id, "Task worker error: {e:#}");
                            break;
                        }
                    }
                }
            }
        }
    }
    tracing::info!(worker_id, "Task worker stopped");
}

/// Claims and executes one task. Returns `false` when nothing was due.
pub async fn run_once(state: &Arc<AppState>) -> anyhow::Result<bool> {
    let lease = state.config.task_lease;
    let claimed = with_conn(&state.db, move |conn| store::claim_next(conn, Utc::now(), lease)).await?;
    let Some(task) = claimed else {
        return Ok(false);
    };

    let ctx = TaskContext {
        task_uuid: task.uuid,
        attempt: u32::try_from(task.attempts).unwrap_or(u32::MAX),
    };
    tracing::debug!(task_uuid = %task.uuid, task = %task.name, attempt = ctx.attempt, "Executing task");

    let outcome = tasks::execute(state, &task.envelope.task, ctx).await;
    settle(state, task, outcome).await?;
    Ok(true)
}

async fn settle(
    state: &Arc<AppState>,
    task: QueuedTask,
    outcome: Result<(), TaskError>,
) -> anyhow::Result<()> {
    let task_uuid = task.uuid;
    let name = task.name.clone();
    let settled = match outcome {
        Ok(()) => with_conn(&state.db, move |conn| store::complete(conn, &task)).await?,
        Err(TaskError::Retry(delay)) => {
            tracing::debug!(task_uuid = %task_uuid, task = %name, ?delay, "Task will be retried");
            with_conn(&state.db, move |conn| {
                store::retry(conn, &task, delay, "retry requested")
            })
            .await?
        }
        Err(TaskError::Failed(reason)) => {
            tracing::warn!(task_uuid = %task_uuid, task = %name, reason = %reason, "Task failed");
            with_conn(&state.db, move |conn| store::fail(conn, &task, &reason)).await?
        }
        Err(TaskError::Aborted(reason)) => {
            with_conn(&state.db, move |conn| store::abort(conn, &task, &reason)).await?
        }
    };

    if !settled {
        tracing::warn!(
            task_uuid = %task_uuid,
            task = %name,
            "Task lease was lost before it settled; result discarded"
        );
    }
    Ok(())
}

/// Runs tasks until none is due. Delayed retries are left in the queue.
pub async fn drain(state: &Arc<AppState>) -> anyhow::Result<usize> {
    let mut processed = 0;
    while run_once(state).await? {
        processed += 1;
    }
    Ok(processed)
}
