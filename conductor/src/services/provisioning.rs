//! Instance provisioning chain.
//!
//! `provision_instance` moves the instance into `provisioning` and queues the
//! backend call with `provision_succeeded` / `provision_failed` as its
//! continuations. Success goes on to register the instance with monitoring
//! and to poll its installation state. A failure in that monitoring chain
//! moves the instance from `online` to `erred`.

use crate::backend::BackendError;
use crate::db::connection::with_conn;
use crate::error::OrchestrationError;
use crate::models::audit_event::AuditEvent;
use crate::models::instance::{
    self, CreateInstanceData, InstallationState, Instance, InstanceState, InstanceTransition,
};
use crate::queue::{store as queue, Envelope, Task};
use crate::state::AppState;
use rusqlite::{Connection, TransactionBehavior};
use serde_json::json;
use uuid::Uuid;

const KIND: &str = "instance";

#[derive(thiserror::Error, Debug)]
pub enum ProvisioningError {
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("installation state of {0} is not known yet")]
    InstallationPending(Uuid),

    #[error("installation state of {instance} still unknown after {attempts} polls")]
    InstallationTimeout { instance: Uuid, attempts: u32 },
}

impl From<anyhow::Error> for ProvisioningError {
    fn from(e: anyhow::Error) -> Self {
        Self::Orchestration(OrchestrationError::Internal(e))
    }
}

fn guard(
    conn: &Connection,
    uuid: Uuid,
    transition: InstanceTransition,
) -> Result<(), OrchestrationError> {
    if instance::compare_and_transition(conn, uuid, transition)? {
        return Ok(());
    }
    let current = instance::find_by_uuid(conn, uuid)?
        .ok_or_else(|| OrchestrationError::not_found(KIND, uuid))?
        .state;
    Err(OrchestrationError::IllegalTransition {
        kind: KIND,
        uuid,
        transition: transition.name(),
        current: current.to_string(),
        duplicate: transition.already_applied(current),
    })
}

async fn load(state: &AppState, uuid: Uuid) -> Result<Instance, OrchestrationError> {
    with_conn(&state.db, move |conn| {
        instance::find_by_uuid(conn, uuid)?.ok_or_else(|| OrchestrationError::not_found(KIND, uuid))
    })
    .await
}

fn event(event_type: &str, instance: &Instance, message: String) -> AuditEvent {
    AuditEvent::new(event_type, KIND, instance.uuid, message).with_context(json!({
        "instance_uuid": instance.uuid,
        "instance_name": instance.name,
        "flavor_id": instance.flavor_id,
    }))
}

/// Creates an instance in `provisioning_scheduled` and queues its provisioning.
pub fn request_provisioning(
    conn: &mut Connection,
    data: &CreateInstanceData,
) -> anyhow::Result<Instance> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let created = instance::create(&tx, data)?;
    queue::enqueue(&tx, Task::ProvisionInstance { instance_uuid: created.uuid })?;
    tx.commit()?;
    Ok(created)
}

pub async fn provision_instance(state: &AppState, uuid: Uuid) -> Result<(), ProvisioningError> {
    with_conn(&state.db, move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).map_err(anyhow::Error::from)?;
        guard(&tx, uuid, InstanceTransition::BeginProvisioning)?;
        queue::enqueue(
            &tx,
            Envelope::new(Task::BackendProvisionInstance { instance_uuid: uuid })
                .link(Task::ProvisionSucceeded { instance_uuid: uuid })
                .link_error(Task::ProvisionFailed { instance_uuid: uuid }),
        )?;
        tx.commit().map_err(anyhow::Error::from)?;
        Ok::<_, ProvisioningError>(())
    })
    .await?;
    tracing::info!(instance_uuid = %uuid, "Instance provisioning scheduled");
    Ok(())
}

pub async fn backend_provision_instance(
    state: &AppState,
    uuid: Uuid,
) -> Result<(), ProvisioningError> {
    let instance = load(state, uuid).await?;
    if instance.state != InstanceState::Provisioning || instance.backend_id.is_some() {
        return Err(OrchestrationError::IllegalTransition {
            kind: KIND,
            uuid,
            transition: "backend_provision_instance",
            current: instance.state.to_string(),
            duplicate: instance.backend_id.is_some()
                || matches!(instance.state, InstanceState::Online | InstanceState::Erred),
        }
        .into());
    }

    let backend_id = state.backend.provision_instance(&instance).await?;
    let stored = backend_id.clone();
    let assigned =
        with_conn(&state.db, move |conn| instance::set_backend_id(conn, uuid, &stored)).await?;
    if !assigned {
        tracing::warn!(instance_uuid = %uuid, backend_id = %backend_id, "Backend id was already set; keeping the first one");
    }
    tracing::info!(instance_uuid = %uuid, backend_id = %backend_id, "Instance provisioned on backend");
    Ok(())
}

pub async fn provision_succeeded(state: &AppState, uuid: Uuid) -> Result<(), ProvisioningError> {
    let instance = with_conn(&state.db, move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).map_err(anyhow::Error::from)?;
        guard(&tx, uuid, InstanceTransition::SetOnline)?;
        let chain = Envelope::chain(
            vec![
                Task::CreateMonitoringHost { instance_uuid: uuid },
                Task::PollInstallationState { instance_uuid: uuid },
            ],
            Some(Task::InstallationStatePullFailed { instance_uuid: uuid }),
        );
        if let Some(chain) = chain {
            queue::enqueue(&tx, chain)?;
        }
        let online = instance::find_by_uuid(&tx, uuid)?
            .ok_or_else(|| OrchestrationError::not_found(KIND, uuid))?;
        tx.commit().map_err(anyhow::Error::from)?;
        Ok::<_, ProvisioningError>(online)
    })
    .await?;

    state.events.emit(event(
        "resource_creation_succeeded",
        &instance,
        format!("Resource {} has been created", instance.name),
    ));
    Ok(())
}

pub async fn provision_failed(state: &AppState, uuid: Uuid) -> Result<(), ProvisioningError> {
    let instance = with_conn(&state.db, move |conn| {
        guard(conn, uuid, InstanceTransition::SetErred)?;
        instance::find_by_uuid(conn, uuid)?.ok_or_else(|| OrchestrationError::not_found(KIND, uuid))
    })
    .await?;

    tracing::error!(instance_uuid = %uuid, "Instance provisioning failed");
    state.events.emit(event(
        "resource_creation_failed",
        &instance,
        format!("Resource {} creation has failed", instance.name),
    ));
    Ok(())
}

/// Monitoring and polling only make sense for an instance that is online.
fn require_online(instance: &Instance, step: &'static str) -> Result<(), OrchestrationError> {
    if instance.state == InstanceState::Online {
        return Ok(());
    }
    Err(OrchestrationError::IllegalTransition {
        kind: KIND,
        uuid: instance.uuid,
        transition: step,
        current: instance.state.to_string(),
        duplicate: instance.state == InstanceState::Erred,
    })
}

pub async fn create_monitoring_host(state: &AppState, uuid: Uuid) -> Result<(), ProvisioningError> {
    let instance = load(state, uuid).await?;
    require_online(&instance, "create_monitoring_host")?;
    if instance.monitoring_registered_at.is_some() {
        tracing::info!(instance_uuid = %uuid, "Monitoring host already registered");
        return Ok(());
    }

    state.backend.create_monitoring_host(&instance).await?;
    with_conn(&state.db, move |conn| instance::mark_monitoring_registered(conn, uuid)).await?;
    tracing::info!(instance_uuid = %uuid, "Monitoring host registered");
    Ok(())
}

/// `attempt` is the delivery count of the polling task.
pub async fn poll_installation_state(
    state: &AppState,
    uuid: Uuid,
    attempt: u32,
) -> Result<(), ProvisioningError> {
    let instance = load(state, uuid).await?;
    require_online(&instance, "poll_installation_state")?;
    let installation = state.backend.installation_state(&instance).await?;

    if installation == InstallationState::NoData {
        if attempt > state.config.poll_max_retries {
            return Err(ProvisioningError::InstallationTimeout {
                instance: uuid,
                attempts: attempt,
            });
        }
        return Err(ProvisioningError::InstallationPending(uuid));
    }

    let recorded =
        with_conn(&state.db, move |conn| instance::record_installation_state(conn, uuid, installation)).await?;
    if recorded {
        tracing::info!(instance_uuid = %uuid, installation_state = %installation, "Installation state stored");
    } else {
        tracing::info!(instance_uuid = %uuid, "Installation state was already stored");
    }
    Ok(())
}

/// Failure continuation of the monitoring chain: the instance goes from
/// `online` to `erred` and its installation state is recorded as `fail`.
pub async fn installation_state_pull_failed(
    state: &AppState,
    uuid: Uuid,
) -> Result<(), ProvisioningError> {
    let instance = with_conn(&state.db, move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).map_err(anyhow::Error::from)?;
        let current = instance::find_by_uuid(&tx, uuid)?
            .ok_or_else(|| OrchestrationError::not_found(KIND, uuid))?;
        if current.installation_state != InstallationState::NoData {
            return Err(ProvisioningError::from(OrchestrationError::IllegalTransition {
                kind: KIND,
                uuid,
                transition: InstanceTransition::FailInstallation.name(),
                current: format!("{} ({})", current.state, current.installation_state),
                duplicate: true,
            }));
        }
        guard(&tx, uuid, InstanceTransition::FailInstallation)?;
        instance::record_installation_state(&tx, uuid, InstallationState::Fail)?;
        let erred = instance::find_by_uuid(&tx, uuid)?
            .ok_or_else(|| OrchestrationError::not_found(KIND, uuid))?;
        tx.commit().map_err(anyhow::Error::from)?;
        Ok::<_, ProvisioningError>(erred)
    })
    .await?;

    tracing::error!(instance_uuid = %uuid, "Could not complete instance setup; marked as erred");
    state.events.emit(event(
        "resource_creation_failed",
        &instance,
        format!("Resource {} creation has failed", instance.name),
    ));
    Ok(())
}
