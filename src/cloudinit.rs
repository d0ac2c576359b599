//! First-boot configuration rendering.
//!
//! Renders the cloud-init user-data that turns a freshly booted VM into
//! a single-use GitHub Actions runner: install prerequisites, download
//! the actions-runner release for the target architecture, register
//! against the repository with a one-time token, run one job, power off.
//!
//! The rendered output embeds the registration token. It is handed to
//! the virtualization backend as instance metadata and must never be
//! logged.

use minijinja::{context, Environment};
use thiserror::Error;

/// Cloud-init template for the runner first boot.
const USER_DATA_TEMPLATE: &str = r#"#cloud-config:
package_update: true
package_upgrade: true

packages:
  - apt-transport-https
  - curl
  - git
  - jq
  - libicu-dev

runcmd:
  - mkdir /actions-runner
  - cd /actions-runner
  - curl -O -L https://github.com/actions/runner/releases/download/v{{ agent_version }}/actions-runner-linux-{{ agent_arch }}-{{ agent_version }}.tar.gz
  - tar xzf ./actions-runner-linux-{{ agent_arch }}-{{ agent_version }}.tar.gz
  - RUNNER_ALLOW_RUNASROOT=1 ./bin/installdependencies.sh
  - RUNNER_ALLOW_RUNASROOT=1 ./config.sh --url https://github.com/{{ repo }} --token {{ token }} --ephemeral --labels {{ labels }}
  - RUNNER_ALLOW_RUNASROOT=1 HOME=/root USER=root SHELL=/bin/bash ./run.sh
  - poweroff
"#;

/// Boot configuration rendering errors.
#[derive(Debug, Error)]
pub enum CloudInitError {
    /// The instance architecture has no corresponding runner release.
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("template rendering failed: {0}")]
    Render(#[from] minijinja::Error),
}

/// Map an instance architecture to the actions-runner release naming.
fn agent_arch(architecture: &str) -> Option<&'static str> {
    match architecture {
        "amd64" => Some("x64"),
        "arm64" => Some("arm64"),
        _ => None,
    }
}

/// Render the first-boot user-data for a runner instance.
///
/// Deterministic in its inputs. Fails when the architecture is not one
/// the runner agent ships releases for; callers must treat that as
/// fatal for the request rather than creating an instance with no boot
/// configuration.
pub fn render_user_data(
    architecture: &str,
    agent_version: &str,
    repo: &str,
    token: &str,
    labels: &[String],
) -> Result<String, CloudInitError> {
    let agent_arch = agent_arch(architecture)
        .ok_or_else(|| CloudInitError::UnsupportedArchitecture(architecture.to_string()))?;

    let mut env = Environment::new();
    env.add_template("user-data", USER_DATA_TEMPLATE)?;
    let rendered = env.get_template("user-data")?.render(context! {
        agent_version,
        agent_arch,
        repo,
        token,
        labels => labels.join(","),
    })?;

    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(architecture: &str) -> Result<String, CloudInitError> {
        render_user_data(
            architecture,
            "2.321.0",
            "acme/widgets",
            "AABBCC-one-time",
            &["self-hosted".to_string(), "cpu-8".to_string()],
        )
    }

    #[test]
    fn amd64_maps_to_x64_release() {
        let out = render("amd64").unwrap();
        assert!(out.contains("actions-runner-linux-x64-2.321.0.tar.gz"));
    }

    #[test]
    fn arm64_maps_to_arm64_release() {
        let out = render("arm64").unwrap();
        assert!(out.contains("actions-runner-linux-arm64-2.321.0.tar.gz"));
    }

    #[test]
    fn unsupported_architecture_is_a_render_failure() {
        assert!(matches!(
            render("riscv64"),
            Err(CloudInitError::UnsupportedArchitecture(arch)) if arch == "riscv64"
        ));
    }

    #[test]
    fn token_and_repo_appear_in_registration_command() {
        let out = render("amd64").unwrap();
        assert!(out.contains(
            "./config.sh --url https://github.com/acme/widgets --token AABBCC-one-time \
             --ephemeral --labels self-hosted,cpu-8"
        ));
    }

    #[test]
    fn runner_powers_off_after_one_job() {
        let out = render("amd64").unwrap();
        let run = out.find("./run.sh").unwrap();
        let poweroff = out.find("- poweroff").unwrap();
        assert!(run < poweroff);
    }

    #[test]
    fn rendering_is_deterministic() {
        assert_eq!(render("amd64").unwrap(), render("amd64").unwrap());
    }
}
