use crate::db::connection::DbPool;
use std::fs;
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
  uuid TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  state TEXT NOT NULL DEFAULT 'provisioning_scheduled' CHECK(state IN ('provisioning_scheduled','provisioning','online','erred')),
  flavor_id TEXT NOT NULL,
  system_volume_id TEXT,
  data_volume_id TEXT,
  backend_id TEXT,
  installation_state TEXT NOT NULL DEFAULT 'no_data' CHECK(installation_state IN ('no_data','ok','fail')),
  monitoring_registered_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backups (
  uuid TEXT PRIMARY KEY,
  source_type TEXT,
  source_id TEXT,
  state TEXT NOT NULL DEFAULT 'pending' CHECK(state IN ('pending','ready','backing_up','restoring','deleting','erred','deleted')),
  metadata TEXT,
  kept_until TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backup_schedules (
  uuid TEXT PRIMARY KEY,
  source_type TEXT,
  source_id TEXT,
  schedule TEXT NOT NULL,
  retention_days INTEGER NOT NULL DEFAULT 7,
  maximal_number_of_backups INTEGER,
  is_active INTEGER NOT NULL DEFAULT 0,
  next_trigger_at TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_events (
  uuid TEXT PRIMARY KEY,
  event_type TEXT NOT NULL,
  message TEXT NOT NULL,
  entity_type TEXT NOT NULL,
  entity_uuid TEXT NOT NULL,
  context TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
  uuid TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  envelope TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'queued' CHECK(status IN ('queued','running','succeeded','failed')),
  attempts INTEGER NOT NULL DEFAULT 0,
  run_after TEXT NOT NULL,
  lease_until TEXT,
  last_error TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backups_state_kept_until ON backups(state, kept_until);
CREATE INDEX IF NOT EXISTS idx_backups_source ON backups(source_type, source_id);
CREATE INDEX IF NOT EXISTS idx_backup_schedules_trigger ON backup_schedules(is_active, next_trigger_at);
CREATE INDEX IF NOT EXISTS idx_audit_events_entity ON audit_events(entity_uuid, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, run_after);
"#;

pub fn migrate(pool: &DbPool, data_dir: &Path) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    fs::create_dir_all(data_dir)?;

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    let has_column = |table: &str, column: &str| -> anyhow::Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(columns.iter().any(|c| c == column))
    };

    // Databases created before installation polling existed
    if !has_column("instances", "installation_state")? {
        conn.execute_batch(
            "ALTER TABLE instances ADD COLUMN installation_state TEXT NOT NULL DEFAULT 'no_data'",
        )?;
    }
    if !has_column("instances", "monitoring_registered_at")? {
        conn.execute_batch("ALTER TABLE instances ADD COLUMN monitoring_registered_at TEXT")?;
    }
    if !has_column("backup_schedules", "maximal_number_of_backups")? {
        conn.execute_batch(
            "ALTER TABLE backup_schedules ADD COLUMN maximal_number_of_backups INTEGER",
        )?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
