//! The webhook-to-instance provisioning pipeline.
//!
//! Sequencing: signature validation -> event parsing -> filtering ->
//! resource resolution -> registration-token issuance -> boot-config
//! rendering -> retried provisioning. The HTTP layer reports every
//! error as an opaque 500; specific causes stay in the logs.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{info, warn};

use crate::cloudinit::{self, CloudInitError};
use crate::event::WorkRequest;
use crate::github::GithubError;
use crate::incus::provision::{InstanceHandle, ProvisionError, ProvisionRequest};
use crate::labels::ResourceSpec;
use crate::retry;
use crate::signature::{self, SignatureError};
use crate::state::AppState;

/// Pipeline failure taxonomy. Every variant surfaces to the webhook
/// caller as the same generic 500.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed validation: {0}")]
    Authentication(#[from] SignatureError),

    #[error("failed to parse body: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// Boot-config rendering failed; no instance is created and the
    /// request is not retried.
    #[error("failed to render boot configuration: {0}")]
    UnsupportedArchitecture(#[from] CloudInitError),

    /// The one-time registration token could not be issued; fatal for
    /// the request, no provisioning attempted.
    #[error("couldn't register worker: {0}")]
    CredentialIssuance(#[from] GithubError),

    #[error("failed to spawn instance: {0}")]
    Provision(#[from] ProvisionError),
}

/// Why an authentic event was dropped without provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The action was not `queued`.
    NotQueued,

    /// The job does not ask for a self-hosted runner.
    HostedRunner,
}

/// What the pipeline did with an event.
#[derive(Debug)]
pub enum Outcome {
    /// Event was authentic but not actionable; nothing was provisioned.
    Ignored(IgnoreReason),

    /// A runner instance was provisioned.
    Provisioned(InstanceHandle),
}

/// Handle one webhook delivery end to end.
pub async fn handle_event(
    state: Arc<AppState>,
    signature: Option<String>,
    body: Bytes,
) -> Result<Outcome, PipelineError> {
    signature::validate(
        &state.config.github.webhook.secret,
        signature.as_deref(),
        &body,
    )?;

    let request = WorkRequest::parse(&body)?;

    // Only handle queued items.
    if !request.is_queued() {
        warn!(action = %request.action, "Ignoring event with unknown action");
        return Ok(Outcome::Ignored(IgnoreReason::NotQueued));
    }

    // Hosted-runner jobs are not this system's concern.
    if !request.wants_self_hosted() {
        return Ok(Outcome::Ignored(IgnoreReason::HostedRunner));
    }

    info!(
        action = %request.action,
        workflow = %request.workflow_name,
        labels = ?request.labels,
        "New request"
    );

    let spec = ResourceSpec::resolve(&state.config.defaults, &request.labels);

    // One-time, repository-scoped token; single use, never logged.
    let token = state
        .github
        .create_registration_token(&request.repo_owner, &request.repo_name)
        .await?;

    let user_data = cloudinit::render_user_data(
        &spec.architecture,
        &state.config.github.agent.version,
        &request.repo(),
        &token.token,
        &request.labels,
    )?;

    info!(
        image = %spec.image,
        architecture = %spec.architecture,
        cpu = spec.cpu,
        memory = %spec.memory,
        disk = %spec.disk,
        url = %request.workflow_url,
        "Spawning instance"
    );

    let provision_request = ProvisionRequest {
        name: request.instance_name(),
        spec,
        user_data,
    };

    let handle = retry::provision_with_retry(
        &state.provisioner,
        &provision_request,
        &state.retry_policy,
    )
    .await?;

    Ok(Outcome::Provisioned(handle))
}
