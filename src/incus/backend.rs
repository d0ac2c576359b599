//! Virtualization backend seam and test double.
//!
//! The provisioner drives instance lifecycle through this trait so the
//! state machine can be exercised without an Incus server. `IncusClient`
//! is the production implementation; `MockBackend` records every call
//! and injects failures at chosen points.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::api::{ApiError, Instance, InstancePut, InstanceStatePut, InstancesPost, Operation};

/// Instance lifecycle operations against the virtualization backend.
#[async_trait]
pub trait InstanceBackend: Send + Sync {
    /// Issue an instance-create request. Returns the background
    /// operation to wait on.
    async fn create_instance(&self, req: &InstancesPost) -> Result<Operation, ApiError>;

    /// Block until a background operation completes.
    async fn wait_operation(&self, op: &Operation) -> Result<(), ApiError>;

    /// Fetch an instance definition and its version tag (ETag).
    async fn get_instance(&self, name: &str) -> Result<(Instance, String), ApiError>;

    /// Update an instance definition under optimistic concurrency.
    async fn update_instance(
        &self,
        name: &str,
        put: &InstancePut,
        etag: &str,
    ) -> Result<Operation, ApiError>;

    /// Request an instance state transition.
    async fn update_instance_state(
        &self,
        name: &str,
        state: &InstanceStatePut,
    ) -> Result<Operation, ApiError>;

    /// Delete an instance by name. Best-effort, used as the compensating
    /// action for a failed create.
    async fn delete_instance(&self, name: &str) -> Result<(), ApiError>;
}

/// Where a mock failure is injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    None,
    /// The create request itself is rejected.
    Create,
    /// The create request is accepted but its operation fails.
    CreateWait,
    /// The post-create instance fetch fails.
    GetInstance,
    /// The disk-resize update is rejected.
    UpdateInstance,
    /// The disk-resize operation fails.
    UpdateWait,
    /// The start request is rejected.
    Start,
    /// The start operation fails.
    StartWait,
}

/// A call the mock backend observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Create(String),
    WaitOperation(String),
    GetInstance(String),
    UpdateInstance(String),
    UpdateState(String, String),
    Delete(String),
}

/// In-memory backend double.
pub struct MockBackend {
    fail_point: FailPoint,
    /// How many times the failure fires before the backend heals.
    /// `None` fails forever.
    fail_limit: Option<u32>,
    failures: AtomicU32,
    log: Mutex<Vec<MockCall>>,
    creates: Mutex<Vec<InstancesPost>>,
    puts: Mutex<Vec<InstancePut>>,
}

impl MockBackend {
    /// A backend where everything succeeds.
    pub fn new() -> Self {
        Self::with_fail_point(FailPoint::None, None)
    }

    /// A backend that always fails at `point`.
    pub fn failing_at(point: FailPoint) -> Self {
        Self::with_fail_point(point, None)
    }

    /// A backend that fails at `point` for the first `failures` hits,
    /// then heals.
    pub fn healing_after(point: FailPoint, failures: u32) -> Self {
        Self::with_fail_point(point, Some(failures))
    }

    fn with_fail_point(fail_point: FailPoint, fail_limit: Option<u32>) -> Self {
        Self {
            fail_point,
            fail_limit,
            failures: AtomicU32::new(0),
            log: Mutex::new(Vec::new()),
            creates: Mutex::new(Vec::new()),
            puts: Mutex::new(Vec::new()),
        }
    }

    /// Every call observed, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.log.lock().unwrap().clone()
    }

    /// Create requests observed.
    pub fn creates(&self) -> Vec<InstancesPost> {
        self.creates.lock().unwrap().clone()
    }

    /// Instance updates observed.
    pub fn puts(&self) -> Vec<InstancePut> {
        self.puts.lock().unwrap().clone()
    }

    /// Number of create requests observed.
    pub fn create_count(&self) -> usize {
        self.creates.lock().unwrap().len()
    }

    /// Names passed to delete, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Delete(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MockCall) {
        self.log.lock().unwrap().push(call);
    }

    fn should_fail(&self, point: FailPoint) -> bool {
        if self.fail_point != point {
            return false;
        }
        if let Some(limit) = self.fail_limit {
            if self.failures.load(Ordering::SeqCst) >= limit {
                return false;
            }
        }
        self.failures.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn failure() -> ApiError {
        ApiError::Api {
            status: 500,
            message: "injected failure".to_string(),
        }
    }

    fn operation(kind: &str, name: &str) -> Operation {
        Operation {
            id: format!("{kind}:{name}"),
            status: "Running".to_string(),
            status_code: 103,
            err: String::new(),
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceBackend for MockBackend {
    async fn create_instance(&self, req: &InstancesPost) -> Result<Operation, ApiError> {
        self.record(MockCall::Create(req.name.clone()));
        self.creates.lock().unwrap().push(req.clone());
        if self.should_fail(FailPoint::Create) {
            return Err(Self::failure());
        }
        Ok(Self::operation("create", &req.name))
    }

    async fn wait_operation(&self, op: &Operation) -> Result<(), ApiError> {
        self.record(MockCall::WaitOperation(op.id.clone()));
        let fails = match op.id.split(':').next() {
            Some("create") => self.should_fail(FailPoint::CreateWait),
            Some("update") => self.should_fail(FailPoint::UpdateWait),
            Some("start") => self.should_fail(FailPoint::StartWait),
            _ => false,
        };
        if fails {
            return Err(ApiError::Operation {
                id: op.id.clone(),
                message: "injected operation failure".to_string(),
            });
        }
        Ok(())
    }

    async fn get_instance(&self, name: &str) -> Result<(Instance, String), ApiError> {
        self.record(MockCall::GetInstance(name.to_string()));
        if self.should_fail(FailPoint::GetInstance) {
            return Err(Self::failure());
        }

        let mut instance = Instance {
            name: name.to_string(),
            architecture: "x86_64".to_string(),
            ephemeral: true,
            profiles: vec!["default".to_string()],
            ..Default::default()
        };
        // The platform-expanded root disk, as profiles would provide it.
        instance.expanded_devices.insert(
            "root".to_string(),
            [
                ("type".to_string(), "disk".to_string()),
                ("path".to_string(), "/".to_string()),
                ("pool".to_string(), "default".to_string()),
            ]
            .into_iter()
            .collect(),
        );

        Ok((instance, "etag-1".to_string()))
    }

    async fn update_instance(
        &self,
        name: &str,
        put: &InstancePut,
        _etag: &str,
    ) -> Result<Operation, ApiError> {
        self.record(MockCall::UpdateInstance(name.to_string()));
        self.puts.lock().unwrap().push(put.clone());
        if self.should_fail(FailPoint::UpdateInstance) {
            return Err(Self::failure());
        }
        Ok(Self::operation("update", name))
    }

    async fn update_instance_state(
        &self,
        name: &str,
        state: &InstanceStatePut,
    ) -> Result<Operation, ApiError> {
        self.record(MockCall::UpdateState(name.to_string(), state.action.clone()));
        if self.should_fail(FailPoint::Start) {
            return Err(Self::failure());
        }
        Ok(Self::operation("start", name))
    }

    async fn delete_instance(&self, name: &str) -> Result<(), ApiError> {
        self.record(MockCall::Delete(name.to_string()));
        Ok(())
    }
}
