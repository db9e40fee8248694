use crate::db::connection::get_uuid;
use crate::models::text_enum;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

text_enum!("instance state", InstanceState {
    ProvisioningScheduled => "provisioning_scheduled",
    Provisioning => "provisioning",
    Online => "online",
    Erred => "erred",
});

text_enum!("installation state", InstallationState {
    NoData => "no_data",
    Ok => "ok",
    Fail => "fail",
});

impl InstanceState {
    /// Position along the provisioning path; `erred` counts as final.
    fn progress(&self) -> u8 {
        match self {
            Self::ProvisioningScheduled => 0,
            Self::Provisioning => 1,
            Self::Online | Self::Erred => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceTransition {
    BeginProvisioning,
    SetOnline,
    SetErred,
    FailInstallation,
}

impl InstanceTransition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BeginProvisioning => "begin_provisioning",
            Self::SetOnline => "set_online",
            Self::SetErred => "set_erred",
            Self::FailInstallation => "fail_installation",
        }
    }

    pub fn sources(&self) -> &'static [InstanceState] {
        use InstanceState::*;
        match self {
            Self::BeginProvisioning => &[ProvisioningScheduled],
            Self::SetOnline => &[Provisioning],
            Self::SetErred => &[ProvisioningScheduled, Provisioning],
            Self::FailInstallation => &[Online],
        }
    }

    pub fn target(&self) -> InstanceState {
        match self {
            Self::BeginProvisioning => InstanceState::Provisioning,
            Self::SetOnline => InstanceState::Online,
            Self::SetErred | Self::FailInstallation => InstanceState::Erred,
        }
    }

    /// Whether an instance found in `current` has already been taken through
    /// this transition (or beyond it).
    pub fn already_applied(&self, current: InstanceState) -> bool {
        current == self.target() || current.progress() > self.target().progress()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub uuid: Uuid,
    pub name: String,
    pub state: InstanceState,
    pub flavor_id: String,
    pub system_volume_id: Option<String>,
    pub data_volume_id: Option<String>,
    pub backend_id: Option<String>,
    pub installation_state: InstallationState,
    pub monitoring_registered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct CreateInstanceData {
    pub name: String,
    pub flavor_id: String,
    pub system_volume_id: Option<String>,
    pub data_volume_id: Option<String>,
}

fn row_to_instance(row: &Row) -> rusqlite::Result<Instance> {
    Ok(Instance {
        uuid: get_uuid(row, "uuid")?,
        name: row.get("name")?,
        state: row.get("state")?,
        flavor_id: row.get("flavor_id")?,
        system_volume_id: row.get("system_volume_id")?,
        data_volume_id: row.get("data_volume_id")?,
        backend_id: row.get("backend_id")?,
        installation_state: row.get("installation_state")?,
        monitoring_registered_at: row.get("monitoring_registered_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn find_by_uuid(conn: &Connection, uuid: Uuid) -> anyhow::Result<Option<Instance>> {
    let instance = conn
        .query_row(
            "SELECT * FROM instances WHERE uuid = ?",
            params![uuid.to_string()],
            row_to_instance,
        )
        .optional()?;
    Ok(instance)
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Instance>> {
    let mut stmt = conn.prepare("SELECT * FROM instances ORDER BY created_at DESC")?;
    let rows = stmt.query_map([], row_to_instance)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn create(conn: &Connection, data: &CreateInstanceData) -> anyhow::Result<Instance> {
    let uuid = Uuid::new_v4();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO instances (uuid, name, state, flavor_id, system_volume_id, data_volume_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            uuid.to_string(),
            data.name,
            InstanceState::ProvisioningScheduled,
            data.flavor_id,
            data.system_volume_id,
            data.data_volume_id,
            now,
            now,
        ],
    )?;
    find_by_uuid(conn, uuid)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created instance"))
}

pub fn compare_and_transition(
    conn: &Connection,
    uuid: Uuid,
    transition: InstanceTransition,
) -> anyhow::Result<bool> {
    let sources = transition.sources();
    let placeholders = vec!["?"; sources.len()].join(", ");
    let sql = format!(
        "UPDATE instances SET state = ?, updated_at = ? WHERE uuid = ? AND state IN ({})",
        placeholders
    );
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
        Box::new(transition.target()),
        Box::new(Utc::now()),
        Box::new(uuid.to_string()),
    ];
    for source in sources {
        values.push(Box::new(*source));
    }
    let changes = conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(changes == 1)
}

/// Records the backend id once; a second assignment is refused so that a
/// redelivered provisioning call cannot overwrite the first one.
pub fn set_backend_id(conn: &Connection, uuid: Uuid, backend_id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE instances SET backend_id = ?1, updated_at = ?2 WHERE uuid = ?3 AND backend_id IS NULL",
        params![backend_id, Utc::now(), uuid.to_string()],
    )?;
    Ok(changes == 1)
}

/// Moves `installation_state` from `no_data` to `installation_state`.
/// Returns `false` when a state was already recorded.
pub fn record_installation_state(
    conn: &Connection,
    uuid: Uuid,
    installation_state: InstallationState,
) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE instances SET installation_state = ?1, updated_at = ?2 WHERE uuid = ?3 AND installation_state = ?4",
        params![installation_state, Utc::now(), uuid.to_string(), InstallationState::NoData],
    )?;
    Ok(changes == 1)
}

pub fn mark_monitoring_registered(conn: &Connection, uuid: Uuid) -> anyhow::Result<bool> {
    let now = Utc::now();
    let changes = conn.execute(
        "UPDATE instances SET monitoring_registered_at = ?1, updated_at = ?1
         WHERE uuid = ?2 AND monitoring_registered_at IS NULL",
        params![now, uuid.to_string()],
    )?;
    Ok(changes == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    fn sample() -> CreateInstanceData {
        CreateInstanceData {
            name: "web-01".into(),
            flavor_id: "m1.small".into(),
            system_volume_id: Some("vol-sys".into()),
            data_volume_id: None,
        }
    }

    #[test]
    fn test_provisioning_path_transitions() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let instance = create(&conn, &sample()).unwrap();
        assert_eq!(instance.state, InstanceState::ProvisioningScheduled);

        assert!(!compare_and_transition(&conn, instance.uuid, InstanceTransition::SetOnline).unwrap());
        assert!(compare_and_transition(&conn, instance.uuid, InstanceTransition::BeginProvisioning).unwrap());
        assert!(compare_and_transition(&conn, instance.uuid, InstanceTransition::SetOnline).unwrap());
        assert!(!compare_and_transition(&conn, instance.uuid, InstanceTransition::SetErred).unwrap());

        let stored = find_by_uuid(&conn, instance.uuid).unwrap().unwrap();
        assert_eq!(stored.state, InstanceState::Online);
    }

    #[test]
    fn test_backend_id_is_written_once() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let instance = create(&conn, &sample()).unwrap();

        assert!(set_backend_id(&conn, instance.uuid, "os-1").unwrap());
        assert!(!set_backend_id(&conn, instance.uuid, "os-2").unwrap());
        let stored = find_by_uuid(&conn, instance.uuid).unwrap().unwrap();
        assert_eq!(stored.backend_id.as_deref(), Some("os-1"));
    }

    #[test]
    fn test_already_applied() {
        assert!(InstanceTransition::BeginProvisioning.already_applied(InstanceState::Online));
        assert!(InstanceTransition::SetOnline.already_applied(InstanceState::Online));
        assert!(!InstanceTransition::SetOnline.already_applied(InstanceState::ProvisioningScheduled));
        assert!(InstanceTransition::SetErred.already_applied(InstanceState::Erred));
        assert!(InstanceTransition::FailInstallation.already_applied(InstanceState::Erred));
        assert!(!InstanceTransition::FailInstallation.already_applied(InstanceState::Online));
    }

    #[test]
    fn test_installation_failure_errs_online_instance_only() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let instance = create(&conn, &sample()).unwrap();

        assert!(!compare_and_transition(&conn, instance.uuid, InstanceTransition::FailInstallation).unwrap());
        compare_and_transition(&conn, instance.uuid, InstanceTransition::BeginProvisioning).unwrap();
        compare_and_transition(&conn, instance.uuid, InstanceTransition::SetOnline).unwrap();
        assert!(compare_and_transition(&conn, instance.uuid, InstanceTransition::FailInstallation).unwrap());
        assert!(!compare_and_transition(&conn, instance.uuid, InstanceTransition::FailInstallation).unwrap());

        let stored = find_by_uuid(&conn, instance.uuid).unwrap().unwrap();
        assert_eq!(stored.state, InstanceState::Erred);
    }

    #[test]
    fn test_installation_state_is_recorded_once() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let instance = create(&conn, &sample()).unwrap();

        assert!(record_installation_state(&conn, instance.uuid, InstallationState::Ok).unwrap());
        assert!(!record_installation_state(&conn, instance.uuid, InstallationState::Fail).unwrap());
        let stored = find_by_uuid(&conn, instance.uuid).unwrap().unwrap();
        assert_eq!(stored.installation_state, InstallationState::Ok);

        assert!(mark_monitoring_registered(&conn, instance.uuid).unwrap());
        assert!(!mark_monitoring_registered(&conn, instance.uuid).unwrap());
    }
}
