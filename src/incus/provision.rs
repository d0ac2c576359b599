//! Instance provisioning state machine.
//!
//! Each provisioning attempt walks `Created -> DiskResized -> Started`.
//! Any failure terminates the attempt; a failure during creation
//! additionally deletes the partially created instance (`RolledBack`).
//! Failures after a successful create leave the instance in place for
//! operator inspection — that asymmetry is inherited from the original
//! deployment and kept deliberate, see DESIGN.md.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::labels::ResourceSpec;

use super::api::{InstanceSource, InstanceStatePut, InstancesPost};
use super::backend::InstanceBackend;

/// Public image source instances boot from.
const IMAGE_SERVER: &str = "https://images.linuxcontainers.org";

/// Transfer protocol for image downloads.
const IMAGE_PROTOCOL: &str = "simplestreams";

/// Root disk device name in the instance device map.
const ROOT_DEVICE: &str = "root";

/// Identifies a provisioned instance by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    /// Instance name, `gh-<owner>-<repo>-<job id>`.
    pub name: String,
}

/// Stage of the state machine a provisioning error surfaced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStage {
    Create,
    Resize,
    Start,
    /// All retry attempts failed; wraps the last attempt's error.
    Exhausted,
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Self::Create => "create",
            Self::Resize => "resize",
            Self::Start => "start",
            Self::Exhausted => "exhausted",
        };
        write!(f, "{stage}")
    }
}

/// Terminal and intermediate states of a single provisioning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Created,
    DiskResized,
    Started,
    RolledBack,
}

/// Provisioning failure, tagged with the stage it surfaced in.
#[derive(Debug, Error)]
#[error("provisioning {name} failed at {stage} stage: {source}")]
pub struct ProvisionError {
    pub stage: ProvisionStage,
    pub name: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl ProvisionError {
    fn new(
        stage: ProvisionStage,
        name: &str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            stage,
            name: name.to_string(),
            source: source.into(),
        }
    }
}

/// Everything needed to create one runner instance.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// Deterministic instance name, stable across retries of one job.
    pub name: String,

    /// Resolved resource specification.
    pub spec: ResourceSpec,

    /// Rendered first-boot configuration. Embeds the one-time
    /// registration token; never logged.
    pub user_data: String,
}

/// Drives the create -> resize -> start sequence against the backend.
///
/// A single gate serializes the create-and-wait and start-and-wait
/// phases against the shared backend connection. The intervening
/// fetch/patch resize step runs outside the gate: concurrent attempts
/// may interleave there, which is safe because instance names are
/// unique per job.
pub struct Provisioner {
    backend: Arc<dyn InstanceBackend>,
    gate: Mutex<()>,
}

impl Provisioner {
    pub fn new(backend: Arc<dyn InstanceBackend>) -> Self {
        Self {
            backend,
            gate: Mutex::new(()),
        }
    }

    /// Run one provisioning attempt.
    ///
    /// The instance is created ephemeral: once it stops (the boot
    /// script powers it off after one job) the backend destroys it.
    pub async fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<InstanceHandle, ProvisionError> {
        let name = &request.name;
        let create = build_create_request(request);

        // Create the instance. The gate covers issue-and-wait; once the
        // request is accepted, a failed wait must delete the partially
        // created instance before the attempt reports failure.
        {
            let gate = self.gate.lock().await;

            let op = self
                .backend
                .create_instance(&create)
                .await
                .map_err(|e| ProvisionError::new(ProvisionStage::Create, name, e))?;

            if let Err(e) = self.backend.wait_operation(&op).await {
                drop(gate);
                self.rollback(name).await;
                return Err(ProvisionError::new(ProvisionStage::Create, name, e));
            }
        }

        let mut state = AttemptState::Created;
        debug!(instance = %name, state = ?state, "Instance created");

        // Grow the root disk to the resolved size, outside the gate: the
        // platform-expanded root device is copied into the instance's
        // own device map with the size overridden, then patched back
        // under the ETag from the fetch.
        if let Err(e) = self.resize_root_disk(name, &request.spec.disk).await {
            warn!(instance = %name, error = %e, "Disk resize failed, instance left in place");
            return Err(ProvisionError::new(ProvisionStage::Resize, name, e));
        }

        state = AttemptState::DiskResized;
        debug!(instance = %name, state = ?state, "Root disk resized");

        // Start the instance, again under the gate.
        {
            let _gate = self.gate.lock().await;
            if let Err(e) = self.start_instance(name).await {
                warn!(instance = %name, error = %e, "Start failed, instance left in place");
                return Err(ProvisionError::new(ProvisionStage::Start, name, e));
            }
        }

        state = AttemptState::Started;
        info!(instance = %name, state = ?state, "Instance provisioned");

        Ok(InstanceHandle { name: name.clone() })
    }

    async fn resize_root_disk(
        &self,
        name: &str,
        disk: &str,
    ) -> Result<(), super::api::ApiError> {
        let (instance, etag) = self.backend.get_instance(name).await?;

        let mut put = instance.to_put();
        let mut root = instance
            .expanded_devices
            .get(ROOT_DEVICE)
            .cloned()
            .unwrap_or_default();
        root.insert("size".to_string(), disk.to_string());
        put.devices.insert(ROOT_DEVICE.to_string(), root);

        let op = self.backend.update_instance(name, &put, &etag).await?;
        self.backend.wait_operation(&op).await
    }

    async fn start_instance(&self, name: &str) -> Result<(), super::api::ApiError> {
        let op = self
            .backend
            .update_instance_state(name, &InstanceStatePut::start())
            .await?;
        self.backend.wait_operation(&op).await
    }

    /// Compensating action for a failed create: delete the instance by
    /// name. Best-effort; a failed delete is logged, not surfaced.
    async fn rollback(&self, name: &str) {
        warn!(instance = %name, state = ?AttemptState::RolledBack, "Rolling back failed create");
        if let Err(e) = self.backend.delete_instance(name).await {
            warn!(instance = %name, error = %e, "Rollback delete failed");
        }
    }
}

fn build_create_request(request: &ProvisionRequest) -> InstancesPost {
    let spec = &request.spec;

    let mut config = HashMap::new();
    config.insert("limits.cpu".to_string(), spec.cpu.to_string());
    config.insert("limits.memory".to_string(), spec.memory.clone());
    config.insert(
        "cloud-init.user-data".to_string(),
        request.user_data.clone(),
    );

    InstancesPost {
        name: request.name.clone(),
        instance_type: "virtual-machine".to_string(),
        source: InstanceSource {
            source_type: "image".to_string(),
            alias: format!("{}/cloud/{}", spec.image, spec.architecture),
            server: IMAGE_SERVER.to_string(),
            protocol: IMAGE_PROTOCOL.to_string(),
        },
        config,
        ephemeral: true,
    }
}

#[cfg(test)]
mod tests {
    use super::super::backend::{FailPoint, MockBackend, MockCall};
    use super::*;

    fn request() -> ProvisionRequest {
        ProvisionRequest {
            name: "gh-acme-widgets-31415926".to_string(),
            spec: ResourceSpec {
                cpu: 8,
                memory: "16GiB".to_string(),
                disk: "100GiB".to_string(),
                architecture: "amd64".to_string(),
                image: "ubuntu/noble".to_string(),
            },
            user_data: "#cloud-config:\n".to_string(),
        }
    }

    fn provisioner(backend: &Arc<MockBackend>) -> Provisioner {
        Provisioner::new(Arc::clone(backend) as Arc<dyn InstanceBackend>)
    }

    #[tokio::test]
    async fn success_walks_create_resize_start() {
        let backend = Arc::new(MockBackend::new());
        let handle = provisioner(&backend).provision(&request()).await.unwrap();
        assert_eq!(handle.name, "gh-acme-widgets-31415926");

        let name = "gh-acme-widgets-31415926";
        assert_eq!(
            backend.calls(),
            vec![
                MockCall::Create(name.to_string()),
                MockCall::WaitOperation(format!("create:{name}")),
                MockCall::GetInstance(name.to_string()),
                MockCall::UpdateInstance(name.to_string()),
                MockCall::WaitOperation(format!("update:{name}")),
                MockCall::UpdateState(name.to_string(), "start".to_string()),
                MockCall::WaitOperation(format!("start:{name}")),
            ]
        );
    }

    #[tokio::test]
    async fn create_request_carries_spec_and_boot_config() {
        let backend = Arc::new(MockBackend::new());
        provisioner(&backend).provision(&request()).await.unwrap();

        let creates = backend.creates();
        assert_eq!(creates.len(), 1);
        let create = &creates[0];
        assert_eq!(create.instance_type, "virtual-machine");
        assert!(create.ephemeral);
        assert_eq!(create.source.alias, "ubuntu/noble/cloud/amd64");
        assert_eq!(create.source.server, "https://images.linuxcontainers.org");
        assert_eq!(create.source.protocol, "simplestreams");
        assert_eq!(
            create.config.get("limits.cpu").map(String::as_str),
            Some("8")
        );
        assert_eq!(
            create.config.get("limits.memory").map(String::as_str),
            Some("16GiB")
        );
        assert_eq!(
            create.config.get("cloud-init.user-data").map(String::as_str),
            Some("#cloud-config:\n")
        );
    }

    #[tokio::test]
    async fn resize_overrides_platform_root_device() {
        let backend = Arc::new(MockBackend::new());
        provisioner(&backend).provision(&request()).await.unwrap();

        let puts = backend.puts();
        assert_eq!(puts.len(), 1);
        let root = puts[0].devices.get("root").unwrap();
        // Copied from the expanded device, with the size overridden.
        assert_eq!(root.get("path").map(String::as_str), Some("/"));
        assert_eq!(root.get("pool").map(String::as_str), Some("default"));
        assert_eq!(root.get("size").map(String::as_str), Some("100GiB"));
    }

    #[tokio::test]
    async fn rejected_create_request_fails_without_rollback() {
        let backend = Arc::new(MockBackend::failing_at(FailPoint::Create));
        let err = provisioner(&backend).provision(&request()).await.unwrap_err();
        assert_eq!(err.stage, ProvisionStage::Create);
        // Nothing was issued, so there is nothing to delete.
        assert!(backend.deleted().is_empty());
    }

    #[tokio::test]
    async fn failed_create_operation_rolls_back() {
        let backend = Arc::new(MockBackend::failing_at(FailPoint::CreateWait));
        let err = provisioner(&backend).provision(&request()).await.unwrap_err();
        assert_eq!(err.stage, ProvisionStage::Create);
        // The compensating delete ran before the attempt reported failure.
        assert_eq!(backend.deleted(), vec!["gh-acme-widgets-31415926"]);
        let calls = backend.calls();
        assert_eq!(
            calls.last(),
            Some(&MockCall::Delete("gh-acme-widgets-31415926".to_string()))
        );
    }

    #[tokio::test]
    async fn failed_fetch_is_a_resize_failure_without_rollback() {
        let backend = Arc::new(MockBackend::failing_at(FailPoint::GetInstance));
        let err = provisioner(&backend).provision(&request()).await.unwrap_err();
        assert_eq!(err.stage, ProvisionStage::Resize);
        assert!(backend.deleted().is_empty());
    }

    #[tokio::test]
    async fn failed_resize_leaves_instance_in_place() {
        let backend = Arc::new(MockBackend::failing_at(FailPoint::UpdateWait));
        let err = provisioner(&backend).provision(&request()).await.unwrap_err();
        assert_eq!(err.stage, ProvisionStage::Resize);
        assert!(backend.deleted().is_empty());
    }

    #[tokio::test]
    async fn failed_start_leaves_instance_in_place() {
        let backend = Arc::new(MockBackend::failing_at(FailPoint::StartWait));
        let err = provisioner(&backend).provision(&request()).await.unwrap_err();
        assert_eq!(err.stage, ProvisionStage::Start);
        assert!(backend.deleted().is_empty());
    }

    #[tokio::test]
    async fn concurrent_attempts_interleave_only_outside_the_gate() {
        // Two concurrent provisions against one provisioner complete
        // without deadlock; the gate is scoped per phase, not held
        // across the whole sequence.
        let backend = Arc::new(MockBackend::new());
        let provisioner = Arc::new(provisioner(&backend));

        let mut a = request();
        a.name = "gh-acme-widgets-1".to_string();
        let mut b = request();
        b.name = "gh-acme-widgets-2".to_string();

        let (ra, rb) = tokio::join!(
            {
                let p = Arc::clone(&provisioner);
                async move { p.provision(&a).await }
            },
            {
                let p = Arc::clone(&provisioner);
                async move { p.provision(&b).await }
            }
        );

        assert!(ra.is_ok());
        assert!(rb.is_ok());
        assert_eq!(backend.create_count(), 2);
    }
}
