//! Durable task queue.
//!
//! Tasks live in the `tasks` table and are delivered at least once: a
//! claimed task carries a lease and becomes claimable again when the lease
//! runs out. Each queued [`Envelope`] carries its own continuations: `next`
//! is enqueued when the task succeeds, `on_error` when it fails. Both are
//! inserted in the same transaction that settles the task.

pub mod store;
pub mod worker;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    ProcessBackup {
        backup_uuid: Uuid,
    },
    RestoreBackup {
        backup_uuid: Uuid,
        instance_uuid: Uuid,
        #[serde(default)]
        user_input: Value,
    },
    DeleteBackup {
        backup_uuid: Uuid,
    },
    ExecuteSchedules,
    DeleteExpiredBackups,
    ProvisionInstance {
        instance_uuid: Uuid,
    },
    BackendProvisionInstance {
        instance_uuid: Uuid,
    },
    ProvisionSucceeded {
        instance_uuid: Uuid,
    },
    ProvisionFailed {
        instance_uuid: Uuid,
    },
    CreateMonitoringHost {
        instance_uuid: Uuid,
    },
    PollInstallationState {
        instance_uuid: Uuid,
    },
    InstallationStatePullFailed {
        instance_uuid: Uuid,
    },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::ProcessBackup { .. } => "process_backup",
            Task::RestoreBackup { .. } => "restore_backup",
            Task::DeleteBackup { .. } => "delete_backup",
            Task::ExecuteSchedules => "execute_schedules",
            Task::DeleteExpiredBackups => "delete_expired_backups",
            Task::ProvisionInstance { .. } => "provision_instance",
            Task::BackendProvisionInstance { .. } => "backend_provision_instance",
            Task::ProvisionSucceeded { .. } => "provision_succeeded",
            Task::ProvisionFailed { .. } => "provision_failed",
            Task::CreateMonitoringHost { .. } => "create_monitoring_host",
            Task::PollInstallationState { .. } => "poll_installation_state",
            Task::InstallationStatePullFailed { .. } => "installation_state_pull_failed",
        }
    }
}

/// A task plus what to run after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub task: Task,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<Envelope>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Task>,
}

impl Envelope {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            next: None,
            on_error: None,
        }
    }

    /// Runs `next` (with no error handler of its own) once this task succeeds.
    pub fn link(mut self, next: Task) -> Self {
        self.next = Some(Box::new(Envelope::new(next)));
        self
    }

    pub fn link_error(mut self, on_error: Task) -> Self {
        self.on_error = Some(on_error);
        self
    }

    /// Strictly ordered chain; `on_error` runs once, for the first failing
    /// step, and the rest of the chain is dropped. `None` for an empty list.
    pub fn chain(tasks: Vec<Task>, on_error: Option<Task>) -> Option<Self> {
        tasks.into_iter().rev().fold(None, |next, task| {
            Some(Envelope {
                task,
                next: next.map(Box::new),
                on_error: on_error.clone(),
            })
        })
    }

    /// Task names along the success path, starting with this one.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = vec![self.task.name()];
        let mut cursor = self.next.as_deref();
        while let Some(envelope) = cursor {
            names.push(envelope.task.name());
            cursor = envelope.next.as_deref();
        }
        names
    }
}

impl From<Task> for Envelope {
    fn from(task: Task) -> Self {
        Envelope::new(task)
    }
}

/// What a handler reports back to the worker.
#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    /// Not done yet; deliver again after the delay.
    #[error("retry requested in {0:?}")]
    Retry(Duration),

    /// The unit failed; its `on_error` continuation (if any) runs.
    #[error("{0}")]
    Failed(String),

    /// A guard refused the unit. The chain ends here: neither `next` nor
    /// `on_error` runs.
    #[error("aborted: {0}")]
    Aborted(String),
}

/// Delivery details handed to a task handler.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext {
    pub task_uuid: Uuid,
    /// 1 on first delivery.
    pub attempt: u32,
}
