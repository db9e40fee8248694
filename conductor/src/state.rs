use crate::backend::CloudBackend;
use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::events::EventLogger;
use crate::strategy::{InstanceBackupStrategy, StrategyRegistry};
use std::sync::Arc;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub events: EventLogger,
    pub strategies: StrategyRegistry,
    pub backend: Arc<dyn CloudBackend>,
}

impl AppState {
    /// Wires the registry with one strategy per supported source type, all
    /// sharing `backend`.
    pub fn new(db: DbPool, config: AppConfig, backend: Arc<dyn CloudBackend>) -> Self {
        let strategies =
            StrategyRegistry::new().with(Arc::new(InstanceBackupStrategy::new(backend.clone())));
        Self {
            db,
            events: EventLogger::new(config.event_queue_per_entity),
            config,
            strategies,
            backend,
        }
    }
}
