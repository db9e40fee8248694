//! Backup lifecycle operations.
//!
//! Each `perform_*` function is one unit of work on the queue. It applies at
//! most one confirmation (or `erred`) transition and emits at most one audit
//! event. Strategy failures end in `erred` plus a failure event and are not
//! reported to the queue, so nothing retries them automatically.

use crate::db::connection::with_conn;
use crate::error::OrchestrationError;
use crate::models::audit_event::AuditEvent;
use crate::models::backup::{self, Backup, BackupTransition};
use crate::models::BackupSource;
use crate::queue::{store as queue, Task};
use crate::state::AppState;
use crate::strategy::{BackupStrategy, ResolvedSource, StrategyError};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

const KIND: &str = "backup";

struct Prepared {
    backup: Backup,
    strategy: Arc<dyn BackupStrategy>,
    source: ResolvedSource,
}

fn illegal(conn: &Connection, uuid: Uuid, transition: BackupTransition) -> OrchestrationError {
    match backup::current_state(conn, uuid) {
        Ok(Some(current)) => OrchestrationError::IllegalTransition {
            kind: KIND,
            uuid,
            transition: transition.name(),
            current: current.to_string(),
            duplicate: transition.already_applied(current),
        },
        Ok(None) => OrchestrationError::not_found(KIND, uuid),
        Err(e) => OrchestrationError::Internal(e),
    }
}

/// How `prepare` checks the backup's state against a transition.
#[derive(Debug, Clone, Copy)]
enum Guard {
    /// Apply the transition now.
    Claim,
    /// Apply the transition, or accept a backup an earlier delivery already
    /// moved into the transition's target state.
    ClaimOrResume,
    /// Only require one of the transition's source states.
    Require,
}

/// Loads the backup, resolves its source and checks the state guard.
async fn prepare(
    state: &AppState,
    uuid: Uuid,
    transition: BackupTransition,
    guard: Guard,
) -> Result<Prepared, OrchestrationError> {
    let strategies = state.strategies.clone();
    with_conn(&state.db, move |conn| {
        let backup = backup::find_by_uuid(conn, uuid)?
            .ok_or_else(|| OrchestrationError::not_found(KIND, uuid))?;

        let Some(source) = backup.backup_source.clone() else {
            return Err(OrchestrationError::IntegrityFault { kind: KIND, uuid });
        };
        let strategy = strategies
            .resolve(&source.source_type)
            .ok_or_else(|| OrchestrationError::UnsupportedSource(source.source_type.clone()))?;
        let source = strategy
            .resolve(conn, &source)?
            .ok_or(OrchestrationError::IntegrityFault { kind: KIND, uuid })?;

        let guard_passed = match guard {
            Guard::Require => transition.sources().contains(&backup.state),
            Guard::Claim => backup::compare_and_transition(conn, uuid, transition)?,
            Guard::ClaimOrResume => {
                if backup::compare_and_transition(conn, uuid, transition)? {
                    true
                } else if backup::current_state(conn, uuid)? == Some(transition.target()) {
                    tracing::warn!(backup_uuid = %uuid, state = %transition.target(), "Resuming interrupted operation");
                    true
                } else {
                    false
                }
            }
        };
        if !guard_passed {
            return Err(illegal(conn, uuid, transition));
        }

        Ok(Prepared {
            backup,
            strategy,
            source,
        })
    })
    .await
}

/// Applies a confirmation transition; a failed guard here means someone
/// moved the backup while the strategy was running.
async fn confirm(
    state: &AppState,
    uuid: Uuid,
    transition: BackupTransition,
    metadata: Option<Value>,
) -> Result<(), OrchestrationError> {
    with_conn(&state.db, move |conn| {
        let applied = match &metadata {
            Some(metadata) => backup::confirm_backup(conn, uuid, metadata)?,
            None => backup::compare_and_transition(conn, uuid, transition)?,
        };
        if applied {
            Ok(())
        } else {
            Err(illegal(conn, uuid, transition))
        }
    })
    .await
}

fn event(event_type: &str, prepared: &Prepared, message: String) -> AuditEvent {
    AuditEvent::new(event_type, KIND, prepared.backup.uuid, message).with_context(json!({
        "backup_uuid": prepared.backup.uuid,
        "source_type": prepared.source.source.source_type,
        "source_uuid": prepared.source.source.source_id,
        "source_name": prepared.source.name,
    }))
}

fn failure_event(event_type: &str, prepared: &Prepared, message: String, error: &StrategyError) -> AuditEvent {
    let mut event = event(event_type, prepared, message);
    if let Value::Object(context) = &mut event.context {
        context.insert("error".into(), Value::String(error.to_string()));
    }
    event
}

/// Moves the backup to `erred` and emits the failure event.
async fn fail(
    state: &AppState,
    prepared: &Prepared,
    event_type: &str,
    message: String,
    error: StrategyError,
) -> Result<(), OrchestrationError> {
    let uuid = prepared.backup.uuid;
    tracing::error!(
        backup_uuid = %uuid,
        source = %prepared.source,
        error = %error,
        "{}", message
    );
    confirm(state, uuid, BackupTransition::Erred, None).await?;
    state
        .events
        .emit(failure_event(event_type, prepared, message, &error));
    Ok(())
}

/// `attempt` is the delivery count of the task. A redelivery finding the
/// backup still in `backing_up` runs the strategy again, since the previous
/// delivery never got to confirm or err it.
pub async fn perform_backup(
    state: &AppState,
    backup_uuid: Uuid,
    attempt: u32,
) -> Result<(), OrchestrationError> {
    let guard = if attempt > 1 { Guard::ClaimOrResume } else { Guard::Claim };
    let prepared = prepare(state, backup_uuid, BackupTransition::StartBackup, guard).await?;
    tracing::debug!(backup_uuid = %backup_uuid, source = %prepared.source, "About to perform backup");

    match prepared.strategy.backup(&prepared.source).await {
        Ok(metadata) => {
            confirm(state, backup_uuid, BackupTransition::ConfirmBackup, Some(metadata)).await?;
            tracing::info!(backup_uuid = %backup_uuid, source = %prepared.source, "Backup performed");
            state.events.emit(event(
                "iaas_backup_creation_succeeded",
                &prepared,
                format!("Backup for {} was created", prepared.source.name),
            ));
            Ok(())
        }
        Err(e) => {
            let message = format!("Failed to perform backup for {}", prepared.source.name);
            fail(state, &prepared, "iaas_backup_start_failed", message, e).await
        }
    }
}

pub async fn perform_restore(
    state: &AppState,
    backup_uuid: Uuid,
    target_uuid: Uuid,
    user_input: Value,
) -> Result<(), OrchestrationError> {
    let prepared = prepare(state, backup_uuid, BackupTransition::ConfirmRestoration, Guard::Require).await?;
    tracing::debug!(
        backup_uuid = %backup_uuid,
        source = %prepared.source,
        target_uuid = %target_uuid,
        "About to restore backup"
    );

    let strategy = prepared.strategy.clone();
    let target = with_conn(&state.db, move |conn| strategy.resolve_target(conn, target_uuid)).await?;

    let result = match target {
        Some(target) => {
            prepared
                .strategy
                .restore(&prepared.backup.metadata, &target, &user_input)
                .await
        }
        None => Err(StrategyError::MissingTarget(target_uuid)),
    };

    match result {
        Ok(()) => {
            confirm(state, backup_uuid, BackupTransition::ConfirmRestoration, None).await?;
            tracing::info!(backup_uuid = %backup_uuid, source = %prepared.source, "Backup restored");
            state.events.emit(event(
                "iaas_backup_restored",
                &prepared,
                format!(
                    "Backup of {} was restored, created on {}",
                    prepared.source.name,
                    creation_date(prepared.backup.created_at)
                ),
            ));
            Ok(())
        }
        Err(e) => {
            let message = format!("Failed to restore backup for {}", prepared.source.name);
            fail(state, &prepared, "iaas_backup_restore_failed", message, e).await
        }
    }
}

pub async fn perform_delete(state: &AppState, backup_uuid: Uuid) -> Result<(), OrchestrationError> {
    let prepared = prepare(state, backup_uuid, BackupTransition::ConfirmDeletion, Guard::Require).await?;
    tracing::debug!(backup_uuid = %backup_uuid, source = %prepared.source, "About to delete backup");

    match prepared
        .strategy
        .delete(&prepared.source, &prepared.backup.metadata)
        .await
    {
        Ok(()) => {
            confirm(state, backup_uuid, BackupTransition::ConfirmDeletion, None).await?;
            tracing::info!(backup_uuid = %backup_uuid, source = %prepared.source, "Backup deleted");
            state.events.emit(event(
                "iaas_backup_deleted",
                &prepared,
                format!("Backup was deleted for {}", prepared.source.name),
            ));
            Ok(())
        }
        Err(e) => {
            let message = format!("Failed to delete backup for {}", prepared.source.name);
            fail(state, &prepared, "iaas_backup_delete_failed", message, e).await
        }
    }
}

fn creation_date(created_at: DateTime<Utc>) -> String {
    created_at.format("%d/%m/%y").to_string()
}

// Entity helpers: user-facing transitions that hand work to the queue.

/// Creates a pending backup and enqueues its `process_backup` task.
pub fn request_backup(
    conn: &mut Connection,
    source: &BackupSource,
    kept_until: Option<DateTime<Utc>>,
) -> anyhow::Result<Backup> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let created = enqueue_backup(&tx, source, kept_until)?;
    tx.commit()?;
    Ok(created)
}

/// `request_backup` inside a transaction the caller already holds.
pub fn enqueue_backup(
    conn: &Connection,
    source: &BackupSource,
    kept_until: Option<DateTime<Utc>>,
) -> anyhow::Result<Backup> {
    let created = backup::create(conn, Some(source), kept_until)?;
    queue::enqueue(conn, Task::ProcessBackup { backup_uuid: created.uuid })?;
    Ok(created)
}

fn begin(
    conn: &Connection,
    uuid: Uuid,
    transition: BackupTransition,
    task: Task,
) -> Result<(), OrchestrationError> {
    if !backup::compare_and_transition(conn, uuid, transition)? {
        return Err(illegal(conn, uuid, transition));
    }
    queue::enqueue(conn, task)?;
    Ok(())
}

fn start(
    conn: &mut Connection,
    uuid: Uuid,
    transition: BackupTransition,
    task: Task,
) -> Result<(), OrchestrationError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(anyhow::Error::from)?;
    begin(&tx, uuid, transition, task)?;
    tx.commit().map_err(anyhow::Error::from)?;
    Ok(())
}

/// `ready → restoring`, then enqueues the restoration.
pub fn start_restoration(
    conn: &mut Connection,
    backup_uuid: Uuid,
    instance_uuid: Uuid,
    user_input: Value,
) -> Result<(), OrchestrationError> {
    start(
        conn,
        backup_uuid,
        BackupTransition::StartRestoration,
        Task::RestoreBackup {
            backup_uuid,
            instance_uuid,
            user_input,
        },
    )
}

/// `ready|erred → deleting`, then enqueues the deletion.
pub fn start_deletion(conn: &mut Connection, backup_uuid: Uuid) -> Result<(), OrchestrationError> {
    start(
        conn,
        backup_uuid,
        BackupTransition::StartDeletion,
        Task::DeleteBackup { backup_uuid },
    )
}

/// `start_deletion` inside a transaction the caller already holds.
pub fn enqueue_deletion(conn: &Connection, backup_uuid: Uuid) -> Result<(), OrchestrationError> {
    begin(
        conn,
        backup_uuid,
        BackupTransition::StartDeletion,
        Task::DeleteBackup { backup_uuid },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backup::BackupState;
    use crate::models::instance::{self, CreateInstanceData, InstanceTransition};
    use crate::queue::store::queued_tasks;
    use crate::strategy::instance::SOURCE_TYPE;
    use crate::test_support::{test_state, FakeBackend};

    async fn instance_source(state: &AppState) -> BackupSource {
        with_conn(&state.db, |conn| {
            let vm = instance::create(
                conn,
                &CreateInstanceData {
                    name: "VM1".into(),
                    flavor_id: "m1.small".into(),
                    system_volume_id: None,
                    data_volume_id: None,
                },
            )?;
            instance::compare_and_transition(conn, vm.uuid, InstanceTransition::BeginProvisioning)?;
            instance::set_backend_id(conn, vm.uuid, "os-vm1")?;
            instance::compare_and_transition(conn, vm.uuid, InstanceTransition::SetOnline)?;
            Ok::<_, anyhow::Error>(BackupSource::new(SOURCE_TYPE, vm.uuid))
        })
        .await
        .unwrap()
    }

    async fn create_backup(
        state: &AppState,
        source: Option<BackupSource>,
        to: &[BackupTransition],
    ) -> Uuid {
        let to = to.to_vec();
        with_conn(&state.db, move |conn| {
            let created = backup::create(conn, source.as_ref(), None)?;
            for transition in to {
                assert!(backup::compare_and_transition(conn, created.uuid, transition)?);
            }
            Ok::<_, anyhow::Error>(created.uuid)
        })
        .await
        .unwrap()
    }

    /// A ready backup with snapshot metadata, then taken through `then`.
    async fn ready_backup(state: &AppState, source: BackupSource, then: BackupTransition) -> Uuid {
        let uuid = create_backup(state, Some(source), &[BackupTransition::StartBackup]).await;
        with_conn(&state.db, move |conn| {
            backup::confirm_backup(conn, uuid, &json!({ "system_snapshot_id": "snap-1" }))?;
            backup::compare_and_transition(conn, uuid, then)
        })
        .await
        .unwrap();
        uuid
    }

    async fn load(state: &AppState, uuid: Uuid) -> Backup {
        with_conn(&state.db, move |conn| backup::find_by_uuid(conn, uuid))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_backup_success_confirms_and_stores_metadata() {
        let backend = FakeBackend::default();
        backend.set_snapshot_metadata(json!({ "size": 10 }));
        let (_dir, state) = test_state(backend.clone());
        let source = instance_source(&state).await;
        let uuid = create_backup(&state, Some(source), &[]).await;

        perform_backup(&state, uuid, 1).await.unwrap();

        let stored = load(&state, uuid).await;
        assert_eq!(stored.state, BackupState::Ready);
        assert_eq!(stored.metadata, json!({ "size": 10 }));
        assert_eq!(state.events.count(uuid, "iaas_backup_creation_succeeded"), 1);
        assert_eq!(state.events.recent(uuid).len(), 1);
        assert_eq!(backend.calls(), vec!["create_snapshots:os-vm1".to_string()]);
    }

    #[tokio::test]
    async fn test_backup_redelivery_is_a_noop() {
        let backend = FakeBackend::default();
        let (_dir, state) = test_state(backend.clone());
        let source = instance_source(&state).await;
        let uuid = create_backup(&state, Some(source), &[]).await;

        perform_backup(&state, uuid, 1).await.unwrap();
        let err = perform_backup(&state, uuid, 2).await.unwrap_err();

        assert!(matches!(err, OrchestrationError::IllegalTransition { duplicate: true, .. }));
        assert_eq!(load(&state, uuid).await.state, BackupState::Ready);
        assert_eq!(state.events.recent(uuid).len(), 1);
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_backup_resumes_on_redelivery() {
        let backend = FakeBackend::default();
        let (_dir, state) = test_state(backend.clone());
        let source = instance_source(&state).await;
        let uuid = create_backup(&state, Some(source), &[BackupTransition::StartBackup]).await;

        perform_backup(&state, uuid, 2).await.unwrap();

        assert_eq!(load(&state, uuid).await.state, BackupState::Ready);
        assert_eq!(state.events.count(uuid, "iaas_backup_creation_succeeded"), 1);
        assert_eq!(backend.calls(), vec!["create_snapshots:os-vm1".to_string()]);
    }

    #[tokio::test]
    async fn test_first_delivery_does_not_take_over_running_backup() {
        let backend = FakeBackend::default();
        let (_dir, state) = test_state(backend.clone());
        let source = instance_source(&state).await;
        let uuid = create_backup(&state, Some(source), &[BackupTransition::StartBackup]).await;

        let err = perform_backup(&state, uuid, 1).await.unwrap_err();

        assert!(matches!(err, OrchestrationError::IllegalTransition { duplicate: false, .. }));
        assert_eq!(load(&state, uuid).await.state, BackupState::BackingUp);
        assert!(backend.calls().is_empty());
        assert!(state.events.recent(uuid).is_empty());
    }

    #[tokio::test]
    async fn test_backup_failure_marks_erred_with_one_event() {
        let backend = FakeBackend::default();
        backend.fail("create_snapshots");
        let (_dir, state) = test_state(backend.clone());
        let source = instance_source(&state).await;
        let uuid = create_backup(&state, Some(source), &[]).await;

        perform_backup(&state, uuid, 1).await.unwrap();

        assert_eq!(load(&state, uuid).await.state, BackupState::Erred);
        assert_eq!(state.events.count(uuid, "iaas_backup_start_failed"), 1);
        assert_eq!(state.events.recent(uuid).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_source_changes_nothing() {
        let backend = FakeBackend::default();
        let (_dir, state) = test_state(backend.clone());
        let no_source = create_backup(&state, None, &[]).await;
        let dangling = create_backup(
            &state,
            Some(BackupSource::new(SOURCE_TYPE, Uuid::new_v4())),
            &[],
        )
        .await;

        for uuid in [no_source, dangling] {
            let err = perform_backup(&state, uuid, 1).await.unwrap_err();
            assert!(matches!(err, OrchestrationError::IntegrityFault { .. }));
            assert!(matches!(
                perform_delete(&state, uuid).await.unwrap_err(),
                OrchestrationError::IntegrityFault { .. }
            ));
            assert!(matches!(
                perform_restore(&state, uuid, Uuid::new_v4(), Value::Null).await.unwrap_err(),
                OrchestrationError::IntegrityFault { .. }
            ));
            assert_eq!(load(&state, uuid).await.state, BackupState::Pending);
            assert!(state.events.recent(uuid).is_empty());
        }
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_backup_is_not_found() {
        let (_dir, state) = test_state(FakeBackend::default());
        let err = perform_backup(&state, Uuid::new_v4(), 1).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unsupported_source_type_changes_nothing() {
        let (_dir, state) = test_state(FakeBackend::default());
        let uuid = create_backup(
            &state,
            Some(BackupSource::new("openstack.volume", Uuid::new_v4())),
            &[],
        )
        .await;

        let err = perform_backup(&state, uuid, 1).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::UnsupportedSource(_)));
        assert_eq!(load(&state, uuid).await.state, BackupState::Pending);
    }

    #[tokio::test]
    async fn test_restore_success_reports_creation_date() {
        let backend = FakeBackend::default();
        let (_dir, state) = test_state(backend.clone());
        let source = instance_source(&state).await;
        let uuid = create_backup(
            &state,
            Some(source.clone()),
            &[BackupTransition::StartBackup],
        )
        .await;
        with_conn(&state.db, move |conn| {
            backup::confirm_backup(conn, uuid, &json!({ "system_snapshot_id": "snap-1" }))?;
            backup::compare_and_transition(conn, uuid, BackupTransition::StartRestoration)
        })
        .await
        .unwrap();

        perform_restore(&state, uuid, source.source_id, json!({ "flavor": "m1.large" }))
            .await
            .unwrap();

        let stored = load(&state, uuid).await;
        assert_eq!(stored.state, BackupState::Ready);
        let events = state.events.recent(uuid);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "iaas_backup_restored");
        assert!(events[0]
            .message
            .ends_with(&stored.created_at.format("%d/%m/%y").to_string()));
        assert_eq!(backend.calls(), vec!["restore_snapshots:os-vm1".to_string()]);
    }

    #[tokio::test]
    async fn test_restore_to_missing_target_errs() {
        let (_dir, state) = test_state(FakeBackend::default());
        let source = instance_source(&state).await;
        let uuid = create_backup(&state, Some(source), &[BackupTransition::StartBackup]).await;
        with_conn(&state.db, move |conn| {
            backup::confirm_backup(conn, uuid, &json!({}))?;
            backup::compare_and_transition(conn, uuid, BackupTransition::StartRestoration)
        })
        .await
        .unwrap();

        perform_restore(&state, uuid, Uuid::new_v4(), Value::Null).await.unwrap();

        assert_eq!(load(&state, uuid).await.state, BackupState::Erred);
        assert_eq!(state.events.count(uuid, "iaas_backup_restore_failed"), 1);
    }

    #[tokio::test]
    async fn test_restore_backend_failure_marks_erred_with_one_event() {
        let backend = FakeBackend::default();
        backend.fail("restore_snapshots");
        let (_dir, state) = test_state(backend.clone());
        let source = instance_source(&state).await;
        let uuid = ready_backup(&state, source.clone(), BackupTransition::StartRestoration).await;

        perform_restore(&state, uuid, source.source_id, Value::Null).await.unwrap();

        assert_eq!(load(&state, uuid).await.state, BackupState::Erred);
        assert_eq!(state.events.count(uuid, "iaas_backup_restore_failed"), 1);
        assert_eq!(state.events.recent(uuid).len(), 1);
        assert_eq!(backend.calls(), vec!["restore_snapshots:os-vm1".to_string()]);
    }

    #[tokio::test]
    async fn test_restore_redelivery_is_a_noop() {
        let backend = FakeBackend::default();
        let (_dir, state) = test_state(backend.clone());
        let source = instance_source(&state).await;
        let uuid = ready_backup(&state, source.clone(), BackupTransition::StartRestoration).await;

        perform_restore(&state, uuid, source.source_id, Value::Null).await.unwrap();
        let err = perform_restore(&state, uuid, source.source_id, Value::Null)
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestrationError::IllegalTransition { duplicate: true, .. }));
        assert_eq!(load(&state, uuid).await.state, BackupState::Ready);
        assert_eq!(state.events.recent(uuid).len(), 1);
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_redelivery_is_a_noop() {
        let backend = FakeBackend::default();
        let (_dir, state) = test_state(backend.clone());
        let source = instance_source(&state).await;
        let uuid = ready_backup(&state, source, BackupTransition::StartDeletion).await;

        perform_delete(&state, uuid).await.unwrap();
        let err = perform_delete(&state, uuid).await.unwrap_err();

        assert!(matches!(err, OrchestrationError::IllegalTransition { duplicate: true, .. }));
        assert_eq!(load(&state, uuid).await.state, BackupState::Deleted);
        assert_eq!(state.events.count(uuid, "iaas_backup_deleted"), 1);
        assert_eq!(state.events.recent(uuid).len(), 1);
        assert_eq!(backend.calls(), vec!["delete_snapshots:metadata".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_success_and_failure() {
        let backend = FakeBackend::default();
        let (_dir, state) = test_state(backend.clone());
        let source = instance_source(&state).await;

        let ok = create_backup(&state, Some(source.clone()), &[BackupTransition::StartBackup]).await;
        let broken = create_backup(&state, Some(source), &[BackupTransition::StartBackup]).await;
        with_conn(&state.db, move |conn| {
            for uuid in [ok, broken] {
                backup::confirm_backup(conn, uuid, &json!({ "system_snapshot_id": "snap" }))?;
                start_deletion(conn, uuid)?;
            }
            Ok::<_, OrchestrationError>(())
        })
        .await
        .unwrap();

        perform_delete(&state, ok).await.unwrap();
        assert_eq!(load(&state, ok).await.state, BackupState::Deleted);
        assert_eq!(state.events.count(ok, "iaas_backup_deleted"), 1);

        backend.fail("delete_snapshots");
        perform_delete(&state, broken).await.unwrap();
        assert_eq!(load(&state, broken).await.state, BackupState::Erred);
        assert_eq!(state.events.count(broken, "iaas_backup_delete_failed"), 1);
        assert_eq!(state.events.recent(broken).len(), 1);
    }

    #[tokio::test]
    async fn test_start_deletion_enqueues_delete_task() {
        let (_dir, state) = test_state(FakeBackend::default());
        let source = instance_source(&state).await;
        let uuid = create_backup(&state, Some(source), &[BackupTransition::StartBackup]).await;

        let queued = with_conn(&state.db, move |conn| {
            backup::confirm_backup(conn, uuid, &Value::Null)?;
            start_deletion(conn, uuid)?;
            let err = start_deletion(conn, uuid).unwrap_err();
            assert!(matches!(err, OrchestrationError::IllegalTransition { duplicate: true, .. }));
            Ok::<_, OrchestrationError>(queued_tasks(conn)?)
        })
        .await
        .unwrap();

        assert_eq!(queued, vec![Task::DeleteBackup { backup_uuid: uuid }]);
        assert_eq!(load(&state, uuid).await.state, BackupState::Deleting);
    }

    #[tokio::test]
    async fn test_request_backup_enqueues_processing() {
        let (_dir, state) = test_state(FakeBackend::default());
        let source = instance_source(&state).await;

        let (created, queued) = with_conn(&state.db, move |conn| {
            let created = request_backup(conn, &source, None)?;
            Ok::<_, anyhow::Error>((created, queued_tasks(conn)?))
        })
        .await
        .unwrap();

        assert_eq!(created.state, BackupState::Pending);
        assert_eq!(queued, vec![Task::ProcessBackup { backup_uuid: created.uuid }]);
    }
}
