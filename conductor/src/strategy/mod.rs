//! Backup strategies, one per source type, looked up by the type tag stored
//! on backups and schedules.

pub mod instance;

pub use instance::InstanceBackupStrategy;

use crate::backend::BackendError;
use crate::models::BackupSource;
use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum StrategyError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("invalid backup metadata: {0}")]
    InvalidMetadata(String),

    #[error("{0} has not been provisioned on the backend")]
    MissingBackendId(String),

    #[error("restore target {0} does not exist")]
    MissingTarget(Uuid),
}

/// A backup source that was found in the store.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub source: BackupSource,
    pub name: String,
    pub backend_id: Option<String>,
}

impl fmt::Display for ResolvedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.source.source_id)
    }
}

#[async_trait]
pub trait BackupStrategy: Send + Sync {
    fn source_type(&self) -> &'static str;

    /// Follows the weak reference. `None` when the entity no longer exists.
    fn resolve(
        &self,
        conn: &Connection,
        source: &BackupSource,
    ) -> anyhow::Result<Option<ResolvedSource>>;

    /// Looks up a restore target by uuid.
    fn resolve_target(&self, conn: &Connection, target: Uuid) -> anyhow::Result<Option<ResolvedSource>>;

    async fn backup(&self, source: &ResolvedSource) -> Result<Value, StrategyError>;

    async fn restore(
        &self,
        metadata: &Value,
        target: &ResolvedSource,
        user_input: &Value,
    ) -> Result<(), StrategyError>;

    async fn delete(&self, source: &ResolvedSource, metadata: &Value) -> Result<(), StrategyError>;
}

#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<&'static str, Arc<dyn BackupStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, strategy: Arc<dyn BackupStrategy>) {
        self.strategies.insert(strategy.source_type(), strategy);
    }

    pub fn with(mut self, strategy: Arc<dyn BackupStrategy>) -> Self {
        self.register(strategy);
        self
    }

    pub fn resolve(&self, source_type: &str) -> Option<Arc<dyn BackupStrategy>> {
        self.strategies.get(source_type).cloned()
    }

    pub fn source_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.strategies.keys().copied().collect();
        types.sort_unstable();
        types
    }
}
