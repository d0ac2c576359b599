//! Webhook event parsing and filtering.
//!
//! Only `workflow_job` events with action `queued` and a `self-hosted`
//! label lead to provisioning; everything else (including non-job
//! deliveries such as `ping`) falls through the action filter and is
//! acknowledged without side effects.

use serde::Deserialize;

/// Label that gates jobs onto this system.
pub const SELF_HOSTED_LABEL: &str = "self-hosted";

/// Action value announcing a newly queued job.
const QUEUED_ACTION: &str = "queued";

/// The subset of the `workflow_job` payload this daemon consumes.
///
/// All fields default so that unrelated event types decode cleanly and
/// are rejected by the filters rather than as parse errors.
#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    action: String,
    #[serde(default)]
    workflow_job: WorkflowJob,
    #[serde(default)]
    repository: Repository,
}

#[derive(Debug, Default, Deserialize)]
struct WorkflowJob {
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Repository {
    #[serde(default)]
    name: String,
    #[serde(default)]
    owner: Owner,
}

#[derive(Debug, Default, Deserialize)]
struct Owner {
    #[serde(default)]
    login: String,
}

/// A parsed unit of work from the job queue. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRequest {
    pub action: String,
    pub workflow_url: String,
    pub workflow_id: i64,
    pub workflow_name: String,
    pub labels: Vec<String>,
    pub repo_owner: String,
    pub repo_name: String,
}

impl WorkRequest {
    /// Decode a raw webhook body.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        let payload: WebhookPayload = serde_json::from_slice(body)?;
        Ok(Self {
            action: payload.action,
            workflow_url: payload.workflow_job.html_url,
            workflow_id: payload.workflow_job.id,
            workflow_name: payload.workflow_job.name,
            labels: payload.workflow_job.labels,
            repo_owner: payload.repository.owner.login,
            repo_name: payload.repository.name,
        })
    }

    /// True when the event announces a newly queued job.
    pub fn is_queued(&self) -> bool {
        self.action == QUEUED_ACTION
    }

    /// True when the job asks for a self-hosted runner.
    pub fn wants_self_hosted(&self) -> bool {
        self.labels.iter().any(|label| label == SELF_HOSTED_LABEL)
    }

    /// `owner/name` repository identifier.
    pub fn repo(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }

    /// Deterministic instance name, stable across retries of one job.
    pub fn instance_name(&self) -> String {
        format!(
            "gh-{}-{}-{}",
            self.repo_owner, self.repo_name, self.workflow_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUED: &[u8] = br#"{
        "action": "queued",
        "workflow_job": {
            "html_url": "https://github.com/acme/widgets/actions/runs/42/job/7",
            "id": 31415926,
            "name": "build",
            "labels": ["self-hosted", "cpu-8", "mem-16G"]
        },
        "repository": {
            "name": "widgets",
            "owner": { "login": "acme" }
        }
    }"#;

    #[test]
    fn parses_queued_event() {
        let request = WorkRequest::parse(QUEUED).unwrap();
        assert!(request.is_queued());
        assert!(request.wants_self_hosted());
        assert_eq!(request.workflow_id, 31415926);
        assert_eq!(request.workflow_name, "build");
        assert_eq!(request.repo(), "acme/widgets");
        assert_eq!(request.instance_name(), "gh-acme-widgets-31415926");
    }

    #[test]
    fn completed_action_is_not_queued() {
        let body = br#"{"action": "completed", "workflow_job": {"labels": ["self-hosted"]}}"#;
        let request = WorkRequest::parse(body).unwrap();
        assert!(!request.is_queued());
    }

    #[test]
    fn hosted_runner_jobs_are_filtered() {
        let body = br#"{"action": "queued", "workflow_job": {"labels": ["ubuntu-latest"]}}"#;
        let request = WorkRequest::parse(body).unwrap();
        assert!(request.is_queued());
        assert!(!request.wants_self_hosted());
    }

    #[test]
    fn non_job_deliveries_decode_and_fail_the_action_filter() {
        // A `ping` delivery has none of the workflow_job fields.
        let request = WorkRequest::parse(br#"{"zen": "Design for failure."}"#).unwrap();
        assert!(!request.is_queued());
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        assert!(WorkRequest::parse(b"not json").is_err());
    }
}
