//! Bounded fixed-delay retry for the provisioning step.
//!
//! VM boot operations run on a human timescale; a fixed short delay and
//! a small attempt budget cover transient backend failures without
//! backoff machinery.

use std::time::Duration;

use tracing::warn;

use crate::incus::provision::{
    InstanceHandle, ProvisionError, ProvisionRequest, ProvisionStage, Provisioner,
};

/// Retry policy for the whole provisioning step.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,

    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(5),
        }
    }
}

/// Run `provisioner.provision` under `policy`.
///
/// Stops on the first success. Once attempts are exhausted, the last
/// error is surfaced wrapped in the `Exhausted` stage.
pub async fn provision_with_retry(
    provisioner: &Provisioner,
    request: &ProvisionRequest,
    policy: &RetryPolicy,
) -> Result<InstanceHandle, ProvisionError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match provisioner.provision(request).await {
            Ok(handle) => return Ok(handle),
            Err(e) => {
                if attempt >= attempts {
                    return Err(ProvisionError {
                        stage: ProvisionStage::Exhausted,
                        name: request.name.clone(),
                        source: Box::new(e),
                    });
                }

                warn!(
                    instance = %request.name,
                    attempt,
                    attempts,
                    error = %e,
                    "Provisioning attempt failed, retrying"
                );
            }
        }

        tokio::time::sleep(policy.delay).await;
        attempt += 1;
    }
}
