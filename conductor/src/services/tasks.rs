//! Dispatch from queued tasks to their handlers.

use crate::error::OrchestrationError;
use crate::queue::{Task, TaskContext, TaskError};
use crate::services::backup_orchestrator;
use crate::services::provisioning::{self, ProvisioningError};
use crate::services::schedule_dispatcher::{self, SweepSummary};
use crate::state::AppState;
use chrono::Utc;
use std::sync::Arc;

/// Guard and integrity failures end the chain; only unexpected internal
/// errors let the `on_error` continuation run.
fn orchestration(task: &str, result: Result<(), OrchestrationError>) -> Result<(), TaskError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            e.log(task);
            match &e {
                OrchestrationError::Internal(_) => Err(TaskError::Failed(e.to_string())),
                _ => Err(TaskError::Aborted(e.to_string())),
            }
        }
    }
}

fn provisioning_step(
    state: &AppState,
    task: &str,
    result: Result<(), ProvisioningError>,
) -> Result<(), TaskError> {
    match result {
        Ok(()) => Ok(()),
        Err(ProvisioningError::Orchestration(e)) => orchestration(task, Err(e)),
        Err(ProvisioningError::InstallationPending(_)) => Err(TaskError::Retry(state.config.poll_interval)),
        Err(e) => {
            tracing::error!(task, error = %e, "Provisioning step failed");
            Err(TaskError::Failed(e.to_string()))
        }
    }
}

fn sweep(task: &str, result: anyhow::Result<SweepSummary>) -> Result<(), TaskError> {
    match result {
        Ok(summary) => {
            tracing::info!(task, processed = summary.processed, failed = summary.failed, "Sweep finished");
            Ok(())
        }
        Err(e) => {
            tracing::error!(task, "Sweep failed: {e:#}");
            Err(TaskError::Failed(format!("{e:#}")))
        }
    }
}

pub async fn execute(state: &Arc<AppState>, task: &Task, ctx: TaskContext) -> Result<(), TaskError> {
    let name = task.name();
    match task {
        Task::ProcessBackup { backup_uuid } => {
            orchestration(name, backup_orchestrator::perform_backup(state, *backup_uuid, ctx.attempt).await)
        }
        Task::RestoreBackup {
            backup_uuid,
            instance_uuid,
            user_input,
        } => orchestration(
            name,
            backup_orchestrator::perform_restore(state, *backup_uuid, *instance_uuid, user_input.clone())
                .await,
        ),
        Task::DeleteBackup { backup_uuid } => {
            orchestration(name, backup_orchestrator::perform_delete(state, *backup_uuid).await)
        }
        Task::ExecuteSchedules => sweep(
            name,
            schedule_dispatcher::dispatch_due_schedules(state, Utc::now()).await,
        ),
        Task::DeleteExpiredBackups => sweep(
            name,
            schedule_dispatcher::sweep_expired_backups(state, Utc::now()).await,
        ),
        Task::ProvisionInstance { instance_uuid } => provisioning_step(
            state,
            name,
            provisioning::provision_instance(state, *instance_uuid).await,
        ),
        Task::BackendProvisionInstance { instance_uuid } => provisioning_step(
            state,
            name,
            provisioning::backend_provision_instance(state, *instance_uuid).await,
        ),
        Task::ProvisionSucceeded { instance_uuid } => provisioning_step(
            state,
            name,
            provisioning::provision_succeeded(state, *instance_uuid).await,
        ),
        Task::ProvisionFailed { instance_uuid } => provisioning_step(
            state,
            name,
            provisioning::provision_failed(state, *instance_uuid).await,
        ),
        Task::CreateMonitoringHost { instance_uuid } => provisioning_step(
            state,
            name,
            provisioning::create_monitoring_host(state, *instance_uuid).await,
        ),
        Task::PollInstallationState { instance_uuid } => provisioning_step(
            state,
            name,
            provisioning::poll_installation_state(state, *instance_uuid, ctx.attempt).await,
        ),
        Task::InstallationStatePullFailed { instance_uuid } => provisioning_step(
            state,
            name,
            provisioning::installation_state_pull_failed(state, *instance_uuid).await,
        ),
    }
}
