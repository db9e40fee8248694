pub mod backend;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod queue;
pub mod services;
pub mod state;
pub mod strategy;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::backend::{BackendError, CloudBackend};
    use crate::config::AppConfig;
    use crate::db::{create_pool, migrate::migrate, DbPool};
    use crate::models::instance::{InstallationState, Instance};
    use crate::state::AppState;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::{HashSet, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    pub fn test_pool() -> (TempDir, DbPool) {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let pool = create_pool(&db_path.to_string_lossy()).unwrap();
        migrate(&pool, dir.path()).unwrap();
        (dir, pool)
    }

    pub fn test_config() -> AppConfig {
        AppConfig {
            poll_interval: Duration::ZERO,
            poll_max_retries: 3,
            ..AppConfig::default()
        }
    }

    pub fn test_state(backend: FakeBackend) -> (TempDir, Arc<AppState>) {
        let (dir, pool) = test_pool();
        let state = AppState::new(pool, test_config(), Arc::new(backend));
        (dir, Arc::new(state))
    }

    #[derive(Default)]
    struct Recorded {
        calls: Vec<String>,
        failing: HashSet<&'static str>,
        snapshot_metadata: Option<Value>,
        installation_states: VecDeque<InstallationState>,
        installation_fallback: Option<InstallationState>,
    }

    /// In-memory backend. Clones share their recorded calls and settings.
    #[derive(Clone, Default)]
    pub struct FakeBackend {
        inner: Arc<Mutex<Recorded>>,
    }

    impl FakeBackend {
        pub fn fail(&self, operation: &'static str) {
            self.inner.lock().unwrap().failing.insert(operation);
        }

        pub fn set_snapshot_metadata(&self, metadata: Value) {
            self.inner.lock().unwrap().snapshot_metadata = Some(metadata);
        }

        /// Answers polls from `states` in order, then with `fallback`.
        pub fn set_installation_states(
            &self,
            states: Vec<InstallationState>,
            fallback: InstallationState,
        ) {
            let mut inner = self.inner.lock().unwrap();
            inner.installation_states = states.into();
            inner.installation_fallback = Some(fallback);
        }

        pub fn calls(&self) -> Vec<String> {
            self.inner.lock().unwrap().calls.clone()
        }

        fn record(&self, operation: &'static str, subject: &str) -> Result<(), BackendError> {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(format!("{operation}:{subject}"));
            if inner.failing.contains(operation) {
                return Err(BackendError::Status {
                    status: 500,
                    body: format!("{operation} failed"),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CloudBackend for FakeBackend {
        async fn provision_instance(&self, instance: &Instance) -> Result<String, BackendError> {
            self.record("provision_instance", &instance.name)?;
            Ok(format!("os-{}", instance.name))
        }

        async fn create_snapshots(&self, backend_id: &str) -> Result<Value, BackendError> {
            self.record("create_snapshots", backend_id)?;
            let metadata = self.inner.lock().unwrap().snapshot_metadata.clone();
            Ok(metadata.unwrap_or_else(|| json!({ "system_snapshot_id": format!("snap-{backend_id}") })))
        }

        async fn restore_snapshots(
            &self,
            target_backend_id: &str,
            _metadata: &Value,
            _user_input: &Value,
        ) -> Result<(), BackendError> {
            self.record("restore_snapshots", target_backend_id)
        }

        async fn delete_snapshots(&self, _metadata: &Value) -> Result<(), BackendError> {
            self.record("delete_snapshots", "metadata")
        }

        async fn create_monitoring_host(&self, instance: &Instance) -> Result<(), BackendError> {
            self.record("create_monitoring_host", &instance.name)
        }

        async fn installation_state(
            &self,
            instance: &Instance,
        ) -> Result<InstallationState, BackendError> {
            self.record("installation_state", &instance.name)?;
            let mut inner = self.inner.lock().unwrap();
            Ok(inner
                .installation_states
                .pop_front()
                .or(inner.installation_fallback)
                .unwrap_or(InstallationState::Ok))
        }
    }
}
