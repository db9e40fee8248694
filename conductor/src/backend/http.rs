use super::{BackendError, CloudBackend};
use crate::models::instance::{InstallationState, Instance};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// JSON-over-HTTP client for the cloud gateway.
pub struct HttpCloudBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ProvisionResponse {
    backend_id: String,
}

#[derive(Deserialize)]
struct InstallationResponse {
    state: String,
}

impl HttpCloudBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn parse_installation_state(raw: &str) -> Result<InstallationState, BackendError> {
    match raw {
        "OK" => Ok(InstallationState::Ok),
        "FAIL" => Ok(InstallationState::Fail),
        "NO DATA" => Ok(InstallationState::NoData),
        other => Err(BackendError::InvalidResponse(format!(
            "unknown installation state '{other}'"
        ))),
    }
}

#[async_trait]
impl CloudBackend for HttpCloudBackend {
    async fn provision_instance(&self, instance: &Instance) -> Result<String, BackendError> {
        let response = self
            .client
            .post(self.url("/instances"))
            .json(&json!({
                "uuid": instance.uuid,
                "name": instance.name,
                "flavor_id": instance.flavor_id,
                "system_volume_id": instance.system_volume_id,
                "data_volume_id": instance.data_volume_id,
            }))
            .send()
            .await?;
        let body: ProvisionResponse = Self::check(response).await?.json().await?;
        Ok(body.backend_id)
    }

    async fn create_snapshots(&self, backend_id: &str) -> Result<Value, BackendError> {
        let response = self
            .client
            .post(self.url(&format!("/instances/{backend_id}/snapshots")))
            .send()
            .await?;
        let metadata: Value = Self::check(response).await?.json().await?;
        if !metadata.is_object() {
            return Err(BackendError::InvalidResponse(
                "snapshot metadata must be an object".into(),
            ));
        }
        Ok(metadata)
    }

    async fn restore_snapshots(
        &self,
        target_backend_id: &str,
        metadata: &Value,
        user_input: &Value,
    ) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url(&format!("/instances/{target_backend_id}/restore")))
            .json(&json!({ "metadata": metadata, "input": user_input }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete_snapshots(&self, metadata: &Value) -> Result<(), BackendError> {
        let response = self
            .client
            .delete(self.url("/snapshots"))
            .json(&json!({ "metadata": metadata }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn create_monitoring_host(&self, instance: &Instance) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url("/monitoring/hosts"))
            .json(&json!({
                "instance_uuid": instance.uuid,
                "backend_id": instance.backend_id,
                "name": instance.name,
            }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn installation_state(
        &self,
        instance: &Instance,
    ) -> Result<InstallationState, BackendError> {
        let response = self
            .client
            .get(self.url(&format!("/monitoring/hosts/{}/installation", instance.uuid)))
            .send()
            .await?;
        let body: InstallationResponse = Self::check(response).await?.json().await?;
        parse_installation_state(&body.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_installation_state() {
        assert_eq!(parse_installation_state("OK").unwrap(), InstallationState::Ok);
        assert_eq!(parse_installation_state("NO DATA").unwrap(), InstallationState::NoData);
        assert_eq!(parse_installation_state("FAIL").unwrap(), InstallationState::Fail);
        assert!(parse_installation_state("installing").is_err());
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let backend = HttpCloudBackend::new("http://gateway:8774/", Duration::from_secs(5)).unwrap();
        assert_eq!(backend.url("/instances"), "http://gateway:8774/instances");
    }
}
