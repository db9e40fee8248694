use crate::db::connection::{get_json, get_uuid};
use crate::models::{text_enum, BackupSource};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

text_enum!("backup state", BackupState {
    Pending => "pending",
    Ready => "ready",
    BackingUp => "backing_up",
    Restoring => "restoring",
    Deleting => "deleting",
    Erred => "erred",
    Deleted => "deleted",
});

/// Named backup transitions with their legal source states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupTransition {
    StartBackup,
    ConfirmBackup,
    StartRestoration,
    ConfirmRestoration,
    StartDeletion,
    ConfirmDeletion,
    Erred,
}

impl BackupTransition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartBackup => "start_backup",
            Self::ConfirmBackup => "confirm_backup",
            Self::StartRestoration => "start_restoration",
            Self::ConfirmRestoration => "confirm_restoration",
            Self::StartDeletion => "start_deletion",
            Self::ConfirmDeletion => "confirm_deletion",
            Self::Erred => "erred",
        }
    }

    pub fn sources(&self) -> &'static [BackupState] {
        use BackupState::*;
        match self {
            Self::StartBackup => &[Pending],
            Self::ConfirmBackup => &[BackingUp],
            Self::StartRestoration => &[Ready],
            Self::ConfirmRestoration => &[Restoring],
            Self::StartDeletion => &[Ready, Erred],
            Self::ConfirmDeletion => &[Deleting],
            Self::Erred => &[BackingUp, Restoring, Deleting],
        }
    }

    pub fn target(&self) -> BackupState {
        use BackupState::*;
        match self {
            Self::StartBackup => BackingUp,
            Self::ConfirmBackup | Self::ConfirmRestoration => Ready,
            Self::StartRestoration => Restoring,
            Self::StartDeletion => Deleting,
            Self::ConfirmDeletion => Deleted,
            Self::Erred => Erred,
        }
    }

    /// Whether a backup found in `current` has already been taken through
    /// this transition, as opposed to having been moved elsewhere
    /// concurrently.
    pub fn already_applied(&self, current: BackupState) -> bool {
        use BackupState::*;
        match self {
            Self::StartBackup => !matches!(current, Pending | BackingUp),
            Self::ConfirmBackup | Self::ConfirmRestoration => matches!(current, Ready | Erred),
            Self::StartRestoration => matches!(current, Restoring | Ready | Erred),
            Self::StartDeletion => matches!(current, Deleting | Deleted),
            Self::ConfirmDeletion => matches!(current, Deleted | Erred),
            Self::Erred => current == Erred,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Backup {
    pub uuid: Uuid,
    pub backup_source: Option<BackupSource>,
    pub state: BackupState,
    pub metadata: Value,
    pub kept_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn row_to_backup(row: &Row) -> rusqlite::Result<Backup> {
    Ok(Backup {
        uuid: get_uuid(row, "uuid")?,
        backup_source: BackupSource::from_row(row)?,
        state: row.get("state")?,
        metadata: get_json(row, "metadata")?,
        kept_until: row.get("kept_until")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn find_by_uuid(conn: &Connection, uuid: Uuid) -> anyhow::Result<Option<Backup>> {
    let backup = conn
        .query_row(
            "SELECT * FROM backups WHERE uuid = ?",
            params![uuid.to_string()],
            row_to_backup,
        )
        .optional()?;
    Ok(backup)
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Backup>> {
    let mut stmt = conn.prepare("SELECT * FROM backups ORDER BY created_at DESC")?;
    let rows = stmt.query_map([], row_to_backup)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Ready backups whose retention deadline is strictly before `now`.
pub fn find_expired(conn: &Connection, now: DateTime<Utc>) -> anyhow::Result<Vec<Backup>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backups WHERE state = ?1 AND kept_until IS NOT NULL AND kept_until < ?2
         ORDER BY kept_until",
    )?;
    let rows = stmt.query_map(params![BackupState::Ready, now], row_to_backup)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Ready backups of one source, newest first.
pub fn find_ready_by_source(
    conn: &Connection,
    source: &BackupSource,
) -> anyhow::Result<Vec<Backup>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backups WHERE source_type = ?1 AND source_id = ?2 AND state = ?3
         ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map(
        params![source.source_type, source.source_id.to_string(), BackupState::Ready],
        row_to_backup,
    )?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn create(
    conn: &Connection,
    source: Option<&BackupSource>,
    kept_until: Option<DateTime<Utc>>,
) -> anyhow::Result<Backup> {
    let uuid = Uuid::new_v4();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO backups (uuid, source_type, source_id, state, kept_until, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            uuid.to_string(),
            source.map(|s| s.source_type.clone()),
            source.map(|s| s.source_id.to_string()),
            BackupState::Pending,
            kept_until,
            now,
            now,
        ],
    )?;
    find_by_uuid(conn, uuid)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created backup"))
}

/// Atomically applies `transition` if the backup is in one of its source
/// states. Returns `false` when the guard fails (or the row is gone).
pub fn compare_and_transition(
    conn: &Connection,
    uuid: Uuid,
    transition: BackupTransition,
) -> anyhow::Result<bool> {
    transition_with(conn, uuid, transition, None)
}

/// `confirm_backup` also records the metadata the strategy returned.
pub fn confirm_backup(conn: &Connection, uuid: Uuid, metadata: &Value) -> anyhow::Result<bool> {
    transition_with(conn, uuid, BackupTransition::ConfirmBackup, Some(metadata))
}

fn transition_with(
    conn: &Connection,
    uuid: Uuid,
    transition: BackupTransition,
    metadata: Option<&Value>,
) -> anyhow::Result<bool> {
    let sources = transition.sources();
    let placeholders = vec!["?"; sources.len()].join(", ");
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
        Box::new(transition.target()),
        Box::new(Utc::now()),
    ];
    let mut sets = String::from("state = ?, updated_at = ?");
    if let Some(metadata) = metadata {
        sets.push_str(", metadata = ?");
        values.push(Box::new(serde_json::to_string(metadata)?));
    }
    values.push(Box::new(uuid.to_string()));
    for source in sources {
        values.push(Box::new(*source));
    }

    let sql = format!(
        "UPDATE backups SET {} WHERE uuid = ? AND state IN ({})",
        sets, placeholders
    );
    let changes = conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(changes == 1)
}

pub fn current_state(conn: &Connection, uuid: Uuid) -> anyhow::Result<Option<BackupState>> {
    let state = conn
        .query_row(
            "SELECT state FROM backups WHERE uuid = ?",
            params![uuid.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    #[test]
    fn test_transition_guard_only_applies_from_source_states() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let backup = create(&conn, None, None).unwrap();

        assert!(!compare_and_transition(&conn, backup.uuid, BackupTransition::ConfirmBackup).unwrap());
        assert!(compare_and_transition(&conn, backup.uuid, BackupTransition::StartBackup).unwrap());
        assert!(!compare_and_transition(&conn, backup.uuid, BackupTransition::StartBackup).unwrap());
        assert_eq!(current_state(&conn, backup.uuid).unwrap(), Some(BackupState::BackingUp));
    }

    #[test]
    fn test_backing_up_is_not_an_applied_start() {
        assert!(!BackupTransition::StartBackup.already_applied(BackupState::BackingUp));
        assert!(BackupTransition::StartBackup.already_applied(BackupState::Ready));
        assert!(BackupTransition::ConfirmDeletion.already_applied(BackupState::Deleted));
    }

    #[test]
    fn test_confirm_backup_stores_metadata() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let backup = create(&conn, None, None).unwrap();
        compare_and_transition(&conn, backup.uuid, BackupTransition::StartBackup).unwrap();

        assert!(confirm_backup(&conn, backup.uuid, &serde_json::json!({ "size": 10 })).unwrap());

        let stored = find_by_uuid(&conn, backup.uuid).unwrap().unwrap();
        assert_eq!(stored.state, BackupState::Ready);
        assert_eq!(stored.metadata, serde_json::json!({ "size": 10 }));
    }

    #[test]
    fn test_find_expired_ignores_future_and_non_ready() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let now = Utc::now();
        let source = BackupSource::new("iaas.instance", Uuid::new_v4());

        let expired = create(&conn, Some(&source), Some(now - chrono::Duration::days(1))).unwrap();
        let fresh = create(&conn, Some(&source), Some(now + chrono::Duration::days(1))).unwrap();
        let pending = create(&conn, Some(&source), Some(now - chrono::Duration::days(1))).unwrap();
        for b in [&expired, &fresh] {
            compare_and_transition(&conn, b.uuid, BackupTransition::StartBackup).unwrap();
            confirm_backup(&conn, b.uuid, &Value::Null).unwrap();
        }

        let found: Vec<Uuid> = find_expired(&conn, now).unwrap().iter().map(|b| b.uuid).collect();
        assert_eq!(found, vec![expired.uuid]);
        assert!(!found.contains(&pending.uuid));
    }
}
