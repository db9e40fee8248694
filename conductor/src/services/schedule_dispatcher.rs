//! Periodic sweeps over schedules and retention deadlines.

use crate::db::connection::with_conn;
use crate::models::audit_event::AuditEvent;
use crate::models::backup::{self, Backup};
use crate::models::backup_schedule::{self, BackupSchedule};
use crate::error::OrchestrationError;
use crate::services::backup_orchestrator::{enqueue_backup, enqueue_deletion, start_deletion};
use crate::state::AppState;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub processed: usize,
    pub failed: usize,
}

impl SweepSummary {
    fn record(&mut self, ok: bool) {
        if ok {
            self.processed += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Fires every active schedule whose trigger time has passed.
pub async fn dispatch_due_schedules(
    state: &AppState,
    now: DateTime<Utc>,
) -> anyhow::Result<SweepSummary> {
    let due = with_conn(&state.db, move |conn| backup_schedule::find_due(conn, now)).await?;
    let mut summary = SweepSummary::default();

    for schedule in due {
        let schedule_uuid = schedule.uuid;
        let source = schedule
            .backup_source
            .as_ref()
            .map_or_else(|| "<missing source>".to_string(), |s| s.to_string());
        state.events.emit(
            AuditEvent::new(
                "iaas_backup_started_on_schedule",
                "backup_schedule",
                schedule_uuid,
                format!("Scheduled backup was started for {}", source),
            )
            .with_context(json!({ "schedule_uuid": schedule_uuid, "backup_source": source })),
        );

        let result = with_conn(&state.db, move |conn| execute_schedule(conn, &schedule, now)).await;
        match &result {
            Ok(Some(created)) => {
                tracing::info!(schedule_uuid = %schedule_uuid, backup_uuid = %created.uuid, "Schedule executed");
            }
            Ok(None) => {
                tracing::info!(schedule_uuid = %schedule_uuid, "Schedule is no longer due; skipped");
            }
            Err(e) => {
                tracing::error!(schedule_uuid = %schedule_uuid, "Failed to execute schedule: {e:#}");
            }
        }
        summary.record(result.is_ok());
    }

    Ok(summary)
}

/// Starts deletion of every ready backup whose retention deadline passed.
pub async fn sweep_expired_backups(
    state: &AppState,
    now: DateTime<Utc>,
) -> anyhow::Result<SweepSummary> {
    let expired = with_conn(&state.db, move |conn| backup::find_expired(conn, now)).await?;
    let mut summary = SweepSummary::default();

    for expired_backup in expired {
        let backup_uuid = expired_backup.uuid;
        let source = expired_backup
            .backup_source
            .as_ref()
            .map_or_else(|| "<missing source>".to_string(), |s| s.to_string());
        state.events.emit(
            AuditEvent::new(
                "iaas_expired_backup_deleted",
                "backup",
                backup_uuid,
                format!("About to delete expired backup for {}", source),
            )
            .with_context(json!({ "backup_uuid": backup_uuid, "backup_source": source })),
        );

        let result = with_conn(&state.db, move |conn| start_deletion(conn, backup_uuid)).await;
        if let Err(e) = &result {
            e.log("delete_expired_backups");
        }
        summary.record(result.is_ok());
    }

    Ok(summary)
}

/// Creates the scheduled backup, prunes ready backups beyond the schedule's
/// cap and advances the trigger time, all in one transaction. Returns `None`
/// when the stored schedule is no longer due at `now`, which is what a
/// second sweep over the same schedule finds.
pub fn execute_schedule(
    conn: &mut Connection,
    schedule: &BackupSchedule,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<Backup>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let Some(schedule) = backup_schedule::find_by_uuid(&tx, schedule.uuid)? else {
        return Ok(None);
    };
    let due = schedule.is_active && schedule.next_trigger_at.is_some_and(|at| at < now);
    if !due {
        return Ok(None);
    }

    let source = schedule
        .backup_source
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("schedule {} has no backup source", schedule.uuid))?;
    let next = backup_schedule::next_occurrence(&schedule.schedule, now)?;

    let kept_until = now + Duration::days(schedule.retention_days);
    let created = enqueue_backup(&tx, source, Some(kept_until))?;

    if let Some(max) = schedule.maximal_number_of_backups {
        let ready = backup::find_ready_by_source(&tx, source)?;
        let keep = usize::try_from(max).unwrap_or(0);
        // Newest first, so everything past `keep` is the oldest surplus.
        for extra in ready.iter().skip(keep) {
            match enqueue_deletion(&tx, extra.uuid) {
                Ok(()) => tracing::info!(
                    schedule_uuid = %schedule.uuid,
                    backup_uuid = %extra.uuid,
                    "Deleting backup beyond the schedule's maximum"
                ),
                Err(e @ OrchestrationError::IllegalTransition { .. }) => e.log("execute_schedule"),
                Err(e) => return Err(e.into()),
            }
        }
    }

    backup_schedule::update_next_trigger_at(&tx, schedule.uuid, Some(next))?;
    tx.commit()?;
    Ok(Some(created))
}
