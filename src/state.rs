//! Shared application state.

use std::sync::Arc;

use crate::config::Config;
use crate::github::GithubClient;
use crate::incus::provision::Provisioner;
use crate::retry::RetryPolicy;

/// Process-wide state shared by all webhook handlers.
///
/// Clients are constructed once at startup and injected here; the
/// provisioner owns the concurrency gate for the shared backend
/// connection.
pub struct AppState {
    pub config: Config,
    pub github: GithubClient,
    pub provisioner: Provisioner,
    pub retry_policy: RetryPolicy,
}

impl AppState {
    pub fn new(config: Config, github: GithubClient, provisioner: Provisioner) -> Arc<Self> {
        let retry_policy = config.provision.retry_policy();
        Arc::new(Self {
            config,
            github,
            provisioner,
            retry_policy,
        })
    }
}
