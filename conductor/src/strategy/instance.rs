use super::{BackupStrategy, ResolvedSource, StrategyError};
use crate::backend::CloudBackend;
use crate::models::instance;
use crate::models::BackupSource;
use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

pub const SOURCE_TYPE: &str = "iaas.instance";

/// Backs up an instance by snapshotting its volumes.
pub struct InstanceBackupStrategy {
    backend: Arc<dyn CloudBackend>,
}

impl InstanceBackupStrategy {
    pub fn new(backend: Arc<dyn CloudBackend>) -> Self {
        Self { backend }
    }

    fn lookup(conn: &Connection, uuid: Uuid) -> anyhow::Result<Option<ResolvedSource>> {
        Ok(instance::find_by_uuid(conn, uuid)?.map(|i| ResolvedSource {
            source: BackupSource::new(SOURCE_TYPE, i.uuid),
            name: i.name,
            backend_id: i.backend_id,
        }))
    }
}

fn backend_id(source: &ResolvedSource) -> Result<&str, StrategyError> {
    source
        .backend_id
        .as_deref()
        .ok_or_else(|| StrategyError::MissingBackendId(source.to_string()))
}

#[async_trait]
impl BackupStrategy for InstanceBackupStrategy {
    fn source_type(&self) -> &'static str {
        SOURCE_TYPE
    }

    fn resolve(
        &self,
        conn: &Connection,
        source: &BackupSource,
    ) -> anyhow::Result<Option<ResolvedSource>> {
        if source.source_type != SOURCE_TYPE {
            anyhow::bail!("instance strategy cannot resolve {} sources", source.source_type);
        }
        Self::lookup(conn, source.source_id)
    }

    fn resolve_target(&self, conn: &Connection, target: Uuid) -> anyhow::Result<Option<ResolvedSource>> {
        Self::lookup(conn, target)
    }

    async fn backup(&self, source: &ResolvedSource) -> Result<Value, StrategyError> {
        let metadata = self.backend.create_snapshots(backend_id(source)?).await?;
        Ok(metadata)
    }

    async fn restore(
        &self,
        metadata: &Value,
        target: &ResolvedSource,
        user_input: &Value,
    ) -> Result<(), StrategyError> {
        if !metadata.is_object() {
            return Err(StrategyError::InvalidMetadata(
                "backup has no snapshot metadata to restore from".into(),
            ));
        }
        self.backend
            .restore_snapshots(backend_id(target)?, metadata, user_input)
            .await?;
        Ok(())
    }

    async fn delete(&self, _source: &ResolvedSource, metadata: &Value) -> Result<(), StrategyError> {
        // Erred before any snapshot was taken.
        if metadata.is_null() {
            return Ok(());
        }
        if !metadata.is_object() {
            return Err(StrategyError::InvalidMetadata(
                "snapshot metadata must be an object".into(),
            ));
        }
        self.backend.delete_snapshots(metadata).await?;
        Ok(())
    }
}
