//! Incus backend: REST client, backend seam, provisioning state machine.

pub mod api;
pub mod backend;
pub mod provision;

pub use api::{ApiError, IncusClient};
pub use backend::{InstanceBackend, MockBackend};
pub use provision::{
    InstanceHandle, ProvisionError, ProvisionRequest, ProvisionStage, Provisioner,
};
