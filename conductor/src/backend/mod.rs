//! Cloud and monitoring backend the strategies and provisioning steps talk to.

pub mod http;

pub use http::HttpCloudBackend;

use crate::models::instance::{InstallationState, Instance};
use async_trait::async_trait;
use serde_json::Value;

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Allocates the instance on the cloud; returns the backend id.
    async fn provision_instance(&self, instance: &Instance) -> Result<String, BackendError>;

    /// Snapshots the instance volumes; the returned object is everything
    /// needed to restore or delete the snapshots later.
    async fn create_snapshots(&self, backend_id: &str) -> Result<Value, BackendError>;

    async fn restore_snapshots(
        &self,
        target_backend_id: &str,
        metadata: &Value,
        user_input: &Value,
    ) -> Result<(), BackendError>;

    async fn delete_snapshots(&self, metadata: &Value) -> Result<(), BackendError>;

    async fn create_monitoring_host(&self, instance: &Instance) -> Result<(), BackendError>;

    async fn installation_state(&self, instance: &Instance)
        -> Result<InstallationState, BackendError>;
}
