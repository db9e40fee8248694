use crate::db::connection::{get_json, get_uuid};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub uuid: Uuid,
    pub event_type: String,
    pub message: String,
    pub entity_type: String,
    pub entity_uuid: Uuid,
    pub context: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_uuid: Uuid,
        message: impl Into<String>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            event_type: event_type.to_string(),
            message: message.into(),
            entity_type: entity_type.to_string(),
            entity_uuid,
            context: Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

fn row_to_event(row: &Row) -> rusqlite::Result<AuditEvent> {
    Ok(AuditEvent {
        uuid: get_uuid(row, "uuid")?,
        event_type: row.get("event_type")?,
        message: row.get("message")?,
        entity_type: row.get("entity_type")?,
        entity_uuid: get_uuid(row, "entity_uuid")?,
        context: get_json(row, "context")?,
        created_at: row.get("created_at")?,
    })
}

pub fn insert(conn: &Connection, event: &AuditEvent) -> anyhow::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO audit_events (uuid, event_type, message, entity_type, entity_uuid, context, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.uuid.to_string(),
            event.event_type,
            event.message,
            event.entity_type,
            event.entity_uuid.to_string(),
            serde_json::to_string(&event.context)?,
            event.created_at,
        ],
    )?;
    Ok(())
}

pub fn find_recent(
    conn: &Connection,
    entity_uuid: Option<Uuid>,
    limit: i64,
) -> anyhow::Result<Vec<AuditEvent>> {
    let events = match entity_uuid {
        Some(uuid) => {
            let mut stmt = conn.prepare(
                "SELECT * FROM audit_events WHERE entity_uuid = ? ORDER BY created_at DESC LIMIT ?",
            )?;
            let rows = stmt.query_map(params![uuid.to_string(), limit], row_to_event)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
        None => {
            let mut stmt =
                conn.prepare("SELECT * FROM audit_events ORDER BY created_at DESC LIMIT ?")?;
            let rows = stmt.query_map(params![limit], row_to_event)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
    };
    Ok(events)
}
