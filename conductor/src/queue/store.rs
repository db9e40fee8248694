use super::{Envelope, Task};
use crate::db::connection::get_uuid;
use crate::models::text_enum;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

text_enum!("task status", TaskStatus {
    Queued => "queued",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
});

#[derive(Debug, Clone, Serialize)]
pub struct QueuedTask {
    pub uuid: Uuid,
    pub name: String,
    pub envelope: Envelope,
    pub status: TaskStatus,
    pub attempts: i64,
    pub run_after: DateTime<Utc>,
    pub lease_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn row_to_task(row: &Row) -> rusqlite::Result<QueuedTask> {
    let raw: String = row.get("envelope")?;
    let envelope = serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    Ok(QueuedTask {
        uuid: get_uuid(row, "uuid")?,
        name: row.get("name")?,
        envelope,
        status: row.get("status")?,
        attempts: row.get("attempts")?,
        run_after: row.get("run_after")?,
        lease_until: row.get("lease_until")?,
        last_error: row.get("last_error")?,
        created_at: row.get("created_at")?,
    })
}

fn to_chrono(duration: Duration) -> anyhow::Result<chrono::Duration> {
    Ok(chrono::Duration::from_std(duration)?)
}

pub fn enqueue(conn: &Connection, envelope: impl Into<Envelope>) -> anyhow::Result<Uuid> {
    enqueue_at(conn, envelope, Utc::now())
}

pub fn enqueue_at(
    conn: &Connection,
    envelope: impl Into<Envelope>,
    run_after: DateTime<Utc>,
) -> anyhow::Result<Uuid> {
    let envelope = envelope.into();
    let uuid = Uuid::new_v4();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO tasks (uuid, name, envelope, status, run_after, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            uuid.to_string(),
            envelope.task.name(),
            serde_json::to_string(&envelope)?,
            TaskStatus::Queued,
            run_after,
            now,
            now,
        ],
    )?;
    tracing::debug!(task_uuid = %uuid, chain = ?envelope.names(), "Task enqueued");
    Ok(uuid)
}

/// Claims the oldest deliverable task: queued and due, or running with an
/// expired lease (a worker died or stalled mid-task).
pub fn claim_next(
    conn: &mut Connection,
    now: DateTime<Utc>,
    lease: Duration,
) -> anyhow::Result<Option<QueuedTask>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let candidate: Option<String> = tx
        .query_row(
            "SELECT uuid FROM tasks
             WHERE (status = ?1 AND run_after <= ?3)
                OR (status = ?2 AND lease_until < ?3)
             ORDER BY run_after
             LIMIT 1",
            params![TaskStatus::Queued, TaskStatus::Running, now],
            |row| row.get(0),
        )
        .optional()?;

    let Some(uuid) = candidate else {
        return Ok(None);
    };

    tx.execute(
        "UPDATE tasks SET status = ?1, attempts = attempts + 1, lease_until = ?2, updated_at = ?3
         WHERE uuid = ?4",
        params![TaskStatus::Running, now + to_chrono(lease)?, now, uuid],
    )?;
    let task = tx.query_row("SELECT * FROM tasks WHERE uuid = ?", params![uuid], row_to_task)?;
    tx.commit()?;
    Ok(Some(task))
}

/// Settles a claimed task. The attempt count acts as a fencing token: if the
/// lease expired and someone else re-claimed the task, this returns `false`
/// and nothing is written.
fn settle(
    tx: &rusqlite::Transaction<'_>,
    task: &QueuedTask,
    status: TaskStatus,
    error: Option<&str>,
    run_after: Option<DateTime<Utc>>,
) -> anyhow::Result<bool> {
    let now = Utc::now();
    let changes = tx.execute(
        "UPDATE tasks SET status = ?1, last_error = ?2, run_after = COALESCE(?3, run_after),
                          lease_until = NULL, updated_at = ?4
         WHERE uuid = ?5 AND status = ?6 AND attempts = ?7",
        params![
            status,
            error,
            run_after,
            now,
            task.uuid.to_string(),
            TaskStatus::Running,
            task.attempts,
        ],
    )?;
    Ok(changes == 1)
}

/// Marks the task succeeded and enqueues its `next` continuation.
pub fn complete(conn: &mut Connection, task: &QueuedTask) -> anyhow::Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if !settle(&tx, task, TaskStatus::Succeeded, None, None)? {
        return Ok(false);
    }
    if let Some(next) = &task.envelope.next {
        enqueue(&tx, next.as_ref().clone())?;
    }
    tx.commit()?;
    Ok(true)
}

/// Marks the task failed and enqueues its `on_error` continuation.
pub fn fail(conn: &mut Connection, task: &QueuedTask, error: &str) -> anyhow::Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if !settle(&tx, task, TaskStatus::Failed, Some(error), None)? {
        return Ok(false);
    }
    if let Some(on_error) = &task.envelope.on_error {
        enqueue(&tx, on_error.clone())?;
    }
    tx.commit()?;
    Ok(true)
}

/// Marks the task failed without running any continuation.
pub fn abort(conn: &mut Connection, task: &QueuedTask, reason: &str) -> anyhow::Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let settled = settle(&tx, task, TaskStatus::Failed, Some(reason), None)?;
    tx.commit()?;
    Ok(settled)
}

/// Puts the task back in the queue to be delivered again after `delay`.
pub fn retry(
    conn: &mut Connection,
    task: &QueuedTask,
    delay: Duration,
    reason: &str,
) -> anyhow::Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let run_after = Utc::now() + to_chrono(delay)?;
    let settled = settle(&tx, task, TaskStatus::Queued, Some(reason), Some(run_after))?;
    tx.commit()?;
    Ok(settled)
}

pub fn find_by_uuid(conn: &Connection, uuid: Uuid) -> anyhow::Result<Option<QueuedTask>> {
    let task = conn
        .query_row(
            "SELECT * FROM tasks WHERE uuid = ?",
            params![uuid.to_string()],
            row_to_task,
        )
        .optional()?;
    Ok(task)
}

pub fn find_by_status(conn: &Connection, status: TaskStatus) -> anyhow::Result<Vec<QueuedTask>> {
    let mut stmt =
        conn.prepare("SELECT * FROM tasks WHERE status = ? ORDER BY run_after, created_at")?;
    let rows = stmt.query_map(params![status], row_to_task)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Tasks waiting for delivery, in delivery order.
pub fn queued_tasks(conn: &Connection) -> anyhow::Result<Vec<Task>> {
    Ok(find_by_status(conn, TaskStatus::Queued)?
        .into_iter()
        .map(|t| t.envelope.task)
        .collect())
}

/// Drops settled tasks older than `older_than`.
pub fn purge_settled(conn: &Connection, older_than: DateTime<Utc>) -> anyhow::Result<usize> {
    let removed = conn.execute(
        "DELETE FROM tasks WHERE status IN (?1, ?2) AND updated_at < ?3",
        params![TaskStatus::Succeeded, TaskStatus::Failed, older_than],
    )?;
    Ok(removed)
}
