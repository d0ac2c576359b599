//! GitHub API client.
//!
//! The only operation this daemon needs from GitHub is issuing one-time
//! runner registration tokens, scoped to a single repository.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const USER_AGENT: &str = concat!("runner-forge/", env!("CARGO_PKG_VERSION"));
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// GitHub API errors.
#[derive(Debug, Error)]
pub enum GithubError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registration token request failed with status {status}: {body}")]
    Api { status: u16, body: String },
}

/// A one-time, repository-scoped runner registration token.
///
/// Single use: embed it into exactly one instance's boot configuration,
/// then discard it. Never logged.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Client for the GitHub REST API.
pub struct GithubClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl GithubClient {
    /// Create a client against `api_url` (normally
    /// `https://api.github.com`) authenticated with `token`.
    pub fn new(api_url: &str, token: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// Issue a fresh registration token for `owner/repo`.
    pub async fn create_registration_token(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<RegistrationToken, GithubError> {
        let url = format!(
            "{}/repos/{}/{}/actions/runners/registration-token",
            self.api_url, owner, repo
        );
        debug!(owner, repo, "Requesting runner registration token");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GithubError::Api { status, body });
        }

        Ok(response.json().await?)
    }
}
