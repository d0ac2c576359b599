//! Resource specification resolution from job labels.
//!
//! Jobs declare their resource needs through free-form runner labels of
//! the form `<key>-<value>`. Recognized keys overwrite the configured
//! defaults; unrecognized tokens are ignored. Later labels win when a
//! key repeats.

use crate::config::DefaultsConfig;

/// The resolved (cpu, memory, disk, architecture, image) tuple an
/// instance is created with.
///
/// Every field always carries a value: resolution starts from the
/// configured defaults, so coverage is total whatever the labels say.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub cpu: u32,
    pub memory: String,
    pub disk: String,
    pub architecture: String,
    pub image: String,
}

impl ResourceSpec {
    /// The configured baseline, before any labels apply.
    pub fn from_defaults(defaults: &DefaultsConfig) -> Self {
        Self {
            cpu: defaults.cpu,
            memory: defaults.memory.clone(),
            disk: defaults.disk.clone(),
            architecture: defaults.architecture.clone(),
            image: defaults.image.clone(),
        }
    }

    /// Layer a label set over the defaults.
    ///
    /// Each label splits on its first `-` into (key, value). Quantities
    /// written as `10G` become the `10GiB` form Incus expects; image
    /// values recover their `/` separators from `-` (labels cannot
    /// contain slashes).
    pub fn resolve(defaults: &DefaultsConfig, labels: &[String]) -> Self {
        let mut spec = Self::from_defaults(defaults);

        for label in labels {
            let Some((key, value)) = label.split_once('-') else {
                continue;
            };

            match key {
                "cpu" => {
                    if let Ok(cpu) = value.parse() {
                        spec.cpu = cpu;
                    }
                }
                "mem" => spec.memory = value.replacen('G', "GiB", 1),
                "disk" => spec.disk = value.replacen('G', "GiB", 1),
                "arch" => spec.architecture = value.to_string(),
                "image" => spec.image = value.replace('-', "/"),
                _ => {}
            }
        }

        spec
    }
}
