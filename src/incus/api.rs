//! Incus HTTP API client.
//!
//! A thin client for the subset of the Incus REST API this daemon
//! drives: instance creation, background-operation wait, instance
//! fetch/update under optimistic concurrency, state transitions, and
//! deletion. All calls are scoped to the configured project.
//!
//! Reference: https://linuxcontainers.org/incus/docs/main/rest-api/

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ETAG, IF_MATCH};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::IncusConfig;

use super::backend::InstanceBackend;

/// Errors from the Incus API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("operation {id} failed: {message}")]
    Operation { id: String, message: String },

    #[error("instance fetch returned no ETag")]
    MissingEtag,

    #[error("response carried no metadata")]
    MissingMetadata,
}

/// Device map: device name to its key/value properties.
pub type DeviceMap = HashMap<String, HashMap<String, String>>;

/// Request body for `POST /1.0/instances`.
#[derive(Debug, Clone, Serialize)]
pub struct InstancesPost {
    pub name: String,
    #[serde(rename = "type")]
    pub instance_type: String,
    pub source: InstanceSource,
    pub config: HashMap<String, String>,
    pub ephemeral: bool,
}

/// Image source for a new instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub alias: String,
    pub server: String,
    pub protocol: String,
}

/// Subset of an instance definition returned by
/// `GET /1.0/instances/{name}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Instance {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub devices: DeviceMap,
    #[serde(default)]
    pub expanded_devices: DeviceMap,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub status: String,
}

impl Instance {
    /// Project the writable fields for a `PUT /1.0/instances/{name}`.
    pub fn to_put(&self) -> InstancePut {
        InstancePut {
            architecture: self.architecture.clone(),
            config: self.config.clone(),
            devices: self.devices.clone(),
            ephemeral: self.ephemeral,
            profiles: self.profiles.clone(),
        }
    }
}

/// Mutable portion of an instance definition.
#[derive(Debug, Clone, Serialize)]
pub struct InstancePut {
    pub architecture: String,
    pub config: HashMap<String, String>,
    pub devices: DeviceMap,
    pub ephemeral: bool,
    pub profiles: Vec<String>,
}

/// Request body for `PUT /1.0/instances/{name}/state`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatePut {
    pub action: String,
}

impl InstanceStatePut {
    /// A start transition.
    pub fn start() -> Self {
        Self {
            action: "start".to_string(),
        }
    }
}

/// A background operation returned by mutating calls.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: u32,
    #[serde(default)]
    pub err: String,
}

/// Standard Incus response envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    error_code: u32,
    #[serde(default)]
    error: String,
    metadata: Option<T>,
}

/// Client for the Incus REST API, authenticated with a TLS client
/// certificate.
pub struct IncusClient {
    client: reqwest::Client,
    base_url: String,
    project: String,
}

impl IncusClient {
    /// Connect to the configured Incus server.
    ///
    /// Reads the client certificate/key pair (and the pinned server
    /// certificate, when configured) and builds the TLS client. No
    /// request timeout is set: instance operations are bounded by the
    /// server's own operation-wait primitive instead.
    pub fn connect(config: &IncusConfig) -> anyhow::Result<Self> {
        let cert = std::fs::read(&config.client.certificate).with_context(|| {
            format!(
                "failed to read client certificate {}",
                config.client.certificate.display()
            )
        })?;
        let key = std::fs::read(&config.client.key).with_context(|| {
            format!("failed to read client key {}", config.client.key.display())
        })?;

        let mut identity = Vec::with_capacity(cert.len() + key.len());
        identity.extend_from_slice(&cert);
        identity.extend_from_slice(&key);
        let identity = reqwest::Identity::from_pem(&identity)
            .context("invalid client certificate or key")?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity);

        if let Some(path) = &config.server.certificate {
            let pem = std::fs::read(path)
                .with_context(|| format!("failed to read server certificate {}", path.display()))?;
            let pinned =
                reqwest::Certificate::from_pem(&pem).context("invalid server certificate")?;
            builder = builder.add_root_certificate(pinned);
        }

        let client = builder.build().context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.server.url.trim_end_matches('/').to_string(),
            project: config.project.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}?project={}", self.base_url, path, self.project)
    }

    /// Unwrap a response into the operation it spawned.
    async fn expect_operation(response: reqwest::Response) -> Result<Operation, ApiError> {
        let envelope: Envelope<Operation> = Self::expect_envelope(response).await?;
        envelope.metadata.ok_or(ApiError::MissingMetadata)
    }

    async fn expect_envelope<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<Envelope<T>, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope<T> = response.json().await?;
        if envelope.error_code != 0 {
            return Err(ApiError::Api {
                status: envelope.error_code as u16,
                message: envelope.error,
            });
        }

        Ok(envelope)
    }
}

#[async_trait]
impl InstanceBackend for IncusClient {
    async fn create_instance(&self, req: &InstancesPost) -> Result<Operation, ApiError> {
        debug!(instance = %req.name, alias = %req.source.alias, "POST /1.0/instances");
        let response = self
            .client
            .post(self.url("/1.0/instances"))
            .json(req)
            .send()
            .await?;
        Self::expect_operation(response).await
    }

    async fn wait_operation(&self, op: &Operation) -> Result<(), ApiError> {
        debug!(operation = %op.id, "Waiting for operation");
        let response = self
            .client
            .get(self.url(&format!("/1.0/operations/{}/wait", op.id)))
            .send()
            .await?;
        let envelope: Envelope<Operation> = Self::expect_envelope(response).await?;
        let finished = envelope.metadata.ok_or(ApiError::MissingMetadata)?;

        if finished.status_code >= 400 {
            return Err(ApiError::Operation {
                id: finished.id,
                message: finished.err,
            });
        }

        Ok(())
    }

    async fn get_instance(&self, name: &str) -> Result<(Instance, String), ApiError> {
        debug!(instance = %name, "GET /1.0/instances/{{name}}");
        let response = self
            .client
            .get(self.url(&format!("/1.0/instances/{name}")))
            .send()
            .await?;

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or(ApiError::MissingEtag)?;

        let envelope: Envelope<Instance> = Self::expect_envelope(response).await?;
        let instance = envelope.metadata.ok_or(ApiError::MissingMetadata)?;
        Ok((instance, etag))
    }

    async fn update_instance(
        &self,
        name: &str,
        put: &InstancePut,
        etag: &str,
    ) -> Result<Operation, ApiError> {
        debug!(instance = %name, "PUT /1.0/instances/{{name}}");
        let response = self
            .client
            .put(self.url(&format!("/1.0/instances/{name}")))
            .header(IF_MATCH, etag)
            .json(put)
            .send()
            .await?;
        Self::expect_operation(response).await
    }

    async fn update_instance_state(
        &self,
        name: &str,
        state: &InstanceStatePut,
    ) -> Result<Operation, ApiError> {
        debug!(instance = %name, action = %state.action, "PUT /1.0/instances/{{name}}/state");
        let response = self
            .client
            .put(self.url(&format!("/1.0/instances/{name}/state")))
            .json(state)
            .send()
            .await?;
        Self::expect_operation(response).await
    }

    async fn delete_instance(&self, name: &str) -> Result<(), ApiError> {
        debug!(instance = %name, "DELETE /1.0/instances/{{name}}");
        let response = self
            .client
            .delete(self.url(&format!("/1.0/instances/{name}")))
            .send()
            .await?;
        // The delete operation is issued but not awaited; rollback is
        // best-effort and the backend reclaims the instance on its own.
        Self::expect_operation(response).await?;
        Ok(())
    }
}
