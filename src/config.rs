//! Daemon configuration.
//!
//! Configuration is loaded from a TOML file. Secrets can be supplied (or
//! overridden) through environment variables so the file on disk does not
//! have to carry them: `FORGE_GITHUB_TOKEN` and `FORGE_WEBHOOK_SECRET`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Baseline resource specification applied before label resolution.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// HTTP listener settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Incus server connection settings.
    pub incus: IncusConfig,

    /// GitHub API and webhook settings.
    pub github: GithubConfig,

    /// Provisioning retry policy.
    #[serde(default)]
    pub provision: ProvisionConfig,
}

impl Config {
    /// Load configuration from a TOML file, then apply environment
    /// variable overrides for secrets.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;
        let mut config: Config =
            toml::from_str(&raw).context("failed to parse the configuration")?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("FORGE_GITHUB_TOKEN") {
            self.github.token = token;
        }
        if let Ok(secret) = std::env::var("FORGE_WEBHOOK_SECRET") {
            self.github.webhook.secret = secret;
        }
    }
}

/// Baseline resource specification.
///
/// Every field carries a value so a resolved specification is always
/// total, whatever the label set contains.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
    /// Instance architecture.
    #[serde(default = "default_architecture")]
    pub architecture: String,

    /// CPU count.
    #[serde(default = "default_cpu")]
    pub cpu: u32,

    /// Memory size, as an Incus quantity (`8GiB`).
    #[serde(default = "default_memory")]
    pub memory: String,

    /// Root disk size, as an Incus quantity (`50GiB`).
    #[serde(default = "default_disk")]
    pub disk: String,

    /// Image path on the public image server (`ubuntu/noble`).
    #[serde(default = "default_image")]
    pub image: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            architecture: default_architecture(),
            cpu: default_cpu(),
            memory: default_memory(),
            disk: default_disk(),
            image: default_image(),
        }
    }
}

fn default_architecture() -> String {
    "amd64".to_string()
}

fn default_cpu() -> u32 {
    4
}

fn default_memory() -> String {
    "8GiB".to_string()
}

fn default_disk() -> String {
    "50GiB".to_string()
}

fn default_image() -> String {
    "ubuntu/noble".to_string()
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Listen address for the webhook endpoint.
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

/// Incus server connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IncusConfig {
    /// Project all instance operations are scoped to.
    #[serde(default = "default_project")]
    pub project: String,

    /// Server endpoint and trust anchor.
    pub server: IncusServerConfig,

    /// Client certificate authentication material.
    pub client: IncusClientConfig,
}

fn default_project() -> String {
    "default".to_string()
}

/// Incus server endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IncusServerConfig {
    /// Base URL of the Incus API (`https://incus.example.net:8443`).
    pub url: String,

    /// Path to the server certificate to pin. When unset, the system
    /// trust store applies.
    #[serde(default)]
    pub certificate: Option<PathBuf>,
}

/// Incus client certificate settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IncusClientConfig {
    /// Path to the PEM client certificate.
    pub certificate: PathBuf,

    /// Path to the PEM client key.
    pub key: PathBuf,
}

/// GitHub API and webhook settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
    /// API token used to issue runner registration tokens.
    #[serde(default)]
    pub token: String,

    /// GitHub API base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Runner agent release settings.
    pub agent: AgentConfig,

    /// Webhook intake settings.
    #[serde(default)]
    pub webhook: WebhookConfig,
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

/// Runner agent release settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// actions-runner release version to install on new instances.
    pub version: String,
}

/// Webhook intake settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    /// Shared secret GitHub signs deliveries with.
    #[serde(default)]
    pub secret: String,
}

/// Provisioning retry policy settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionConfig {
    /// Total provisioning attempts per job, including the first.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Fixed delay between attempts, in seconds.
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
}

impl ProvisionConfig {
    /// Build the retry policy the orchestrator runs under.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            delay: Duration::from_secs(self.delay_secs),
        }
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_secs: default_delay_secs(),
        }
    }
}

fn default_attempts() -> u32 {
    5
}

fn default_delay_secs() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [defaults]
        architecture = "arm64"
        cpu = 8
        memory = "16GiB"
        disk = "100GiB"
        image = "debian/13"

        [daemon]
        listen = "127.0.0.1:9000"

        [incus]
        project = "github"

        [incus.server]
        url = "https://incus.example.net:8443"
        certificate = "/etc/runner-forge/server.crt"

        [incus.client]
        certificate = "/etc/runner-forge/client.crt"
        key = "/etc/runner-forge/client.key"

        [github]
        token = "ghp_test"

        [github.agent]
        version = "2.321.0"

        [github.webhook]
        secret = "hunter2"

        [provision]
        attempts = 3
        delay_secs = 1
    "#;

    const MINIMAL: &str = r#"
        [incus.server]
        url = "https://incus.example.net:8443"

        [incus.client]
        certificate = "/etc/runner-forge/client.crt"
        key = "/etc/runner-forge/client.key"

        [github]
        token = "ghp_test"

        [github.agent]
        version = "2.321.0"
    "#;

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(FULL).unwrap();
        assert_eq!(config.defaults.cpu, 8);
        assert_eq!(config.defaults.image, "debian/13");
        assert_eq!(config.daemon.listen, "127.0.0.1:9000");
        assert_eq!(config.incus.project, "github");
        assert_eq!(config.github.webhook.secret, "hunter2");
        assert_eq!(config.provision.attempts, 3);
        assert_eq!(
            config.provision.retry_policy().delay,
            Duration::from_secs(1)
        );
    }

    #[test]
    fn minimal_config_falls_back_to_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.defaults.architecture, "amd64");
        assert_eq!(config.defaults.cpu, 4);
        assert_eq!(config.defaults.memory, "8GiB");
        assert_eq!(config.defaults.disk, "50GiB");
        assert_eq!(config.defaults.image, "ubuntu/noble");
        assert_eq!(config.daemon.listen, "0.0.0.0:8080");
        assert_eq!(config.incus.project, "default");
        assert_eq!(config.github.api_url, "https://api.github.com");
        assert_eq!(config.provision.attempts, 5);
        assert_eq!(config.provision.delay_secs, 5);
    }

    #[test]
    fn env_overrides_replace_file_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, FULL).unwrap();

        std::env::set_var("FORGE_GITHUB_TOKEN", "ghp_env");
        std::env::set_var("FORGE_WEBHOOK_SECRET", "env-secret");
        let config = Config::load(&path).unwrap();
        std::env::remove_var("FORGE_GITHUB_TOKEN");
        std::env::remove_var("FORGE_WEBHOOK_SECRET");

        assert_eq!(config.github.token, "ghp_env");
        assert_eq!(config.github.webhook.secret, "env-secret");
    }
}
