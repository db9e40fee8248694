use crate::db::connection::get_uuid;
use crate::models::BackupSource;
use chrono::{DateTime, Utc};
use croner::Cron;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct BackupSchedule {
    pub uuid: Uuid,
    pub backup_source: Option<BackupSource>,
    pub schedule: String,
    pub retention_days: i64,
    pub maximal_number_of_backups: Option<i64>,
    pub is_active: bool,
    pub next_trigger_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

pub struct CreateScheduleData {
    pub backup_source: BackupSource,
    pub schedule: String,
    pub retention_days: i64,
    pub maximal_number_of_backups: Option<i64>,
    pub is_active: bool,
}

fn row_to_schedule(row: &Row) -> rusqlite::Result<BackupSchedule> {
    Ok(BackupSchedule {
        uuid: get_uuid(row, "uuid")?,
        backup_source: BackupSource::from_row(row)?,
        schedule: row.get("schedule")?,
        retention_days: row.get("retention_days")?,
        maximal_number_of_backups: row.get("maximal_number_of_backups")?,
        is_active: row.get("is_active")?,
        next_trigger_at: row.get("next_trigger_at")?,
        created_at: row.get("created_at")?,
    })
}

/// Next occurrence of a cron expression strictly after `after`. Accepts the
/// classic five fields or an optional leading seconds field.
pub fn next_occurrence(expression: &str, after: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    let cron = Cron::new(expression)
        .with_seconds_optional()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid schedule '{}': {}", expression, e))?;
    cron.find_next_occurrence(&after, false)
        .map_err(|e| anyhow::anyhow!("schedule '{}' has no next occurrence: {}", expression, e))
}

pub fn find_by_uuid(conn: &Connection, uuid: Uuid) -> anyhow::Result<Option<BackupSchedule>> {
    let schedule = conn
        .query_row(
            "SELECT * FROM backup_schedules WHERE uuid = ?",
            params![uuid.to_string()],
            row_to_schedule,
        )
        .optional()?;
    Ok(schedule)
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<BackupSchedule>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_schedules ORDER BY created_at DESC")?;
    let rows = stmt.query_map([], row_to_schedule)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Active schedules whose trigger time is strictly before `now`.
pub fn find_due(conn: &Connection, now: DateTime<Utc>) -> anyhow::Result<Vec<BackupSchedule>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_schedules
         WHERE is_active = 1 AND next_trigger_at IS NOT NULL AND next_trigger_at < ?1
         ORDER BY next_trigger_at",
    )?;
    let rows = stmt.query_map(params![now], row_to_schedule)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn create(conn: &Connection, data: &CreateScheduleData) -> anyhow::Result<BackupSchedule> {
    let now = Utc::now();
    let next_trigger_at = if data.is_active {
        Some(next_occurrence(&data.schedule, now)?)
    } else {
        // Reject bad expressions up front, even for inactive schedules.
        next_occurrence(&data.schedule, now)?;
        None
    };

    let uuid = Uuid::new_v4();
    conn.execute(
        "INSERT INTO backup_schedules (uuid, source_type, source_id, schedule, retention_days, maximal_number_of_backups, is_active, next_trigger_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            uuid.to_string(),
            data.backup_source.source_type,
            data.backup_source.source_id.to_string(),
            data.schedule,
            data.retention_days,
            data.maximal_number_of_backups,
            data.is_active,
            next_trigger_at,
            now,
        ],
    )?;
    find_by_uuid(conn, uuid)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created schedule"))
}

/// Activating recomputes the trigger time from `now`; deactivating clears it.
pub fn set_active(
    conn: &Connection,
    uuid: Uuid,
    is_active: bool,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<BackupSchedule>> {
    let Some(schedule) = find_by_uuid(conn, uuid)? else {
        return Ok(None);
    };
    let next_trigger_at = if is_active {
        Some(next_occurrence(&schedule.schedule, now)?)
    } else {
        None
    };
    conn.execute(
        "UPDATE backup_schedules SET is_active = ?1, next_trigger_at = ?2 WHERE uuid = ?3",
        params![is_active, next_trigger_at, uuid.to_string()],
    )?;
    find_by_uuid(conn, uuid)
}

pub fn update_next_trigger_at(
    conn: &Connection,
    uuid: Uuid,
    next_trigger_at: Option<DateTime<Utc>>,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE backup_schedules SET next_trigger_at = ?1 WHERE uuid = ?2",
        params![next_trigger_at, uuid.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_occurrence_hourly() {
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap();
        let next = next_occurrence("0 * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_next_occurrence_is_strictly_after() {
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        let next = next_occurrence("0 * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        assert!(next_occurrence("every tuesday", Utc::now()).is_err());
    }
}
