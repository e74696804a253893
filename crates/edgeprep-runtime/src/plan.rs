//! What a run should provision, as read from the configuration file.

use std::collections::BTreeMap;
use std::path::PathBuf;

use edgeprep_provision::boot_config::DEFAULT_BOOT_CONFIG;
use edgeprep_types::{CompressionAlgo, GovernorMode, OverlayMount};
use serde::{Deserialize, Deserializer, Serialize, de};

const MIB: u64 = 1024 * 1024;

/// A size in MiB whose byte count fits in a `u64`.
fn size_in_mib<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let mb = u64::deserialize(deserializer)?;
    match mb.checked_mul(MIB) {
        Some(_) => Ok(mb),
        None => Err(de::Error::custom(format!("size_mb = {mb} overflows a 64-bit byte count"))),
    }
}

fn default_boot_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_BOOT_CONFIG)
}

fn default_true() -> bool {
    true
}

fn default_algorithm() -> CompressionAlgo {
    CompressionAlgo::Lz4
}

fn default_priority() -> i32 {
    100
}

/// Boot-config directives and the document they go into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootConfigPlan {
    #[serde(default = "default_boot_config_path")]
    pub path: PathBuf,
    /// Enforces the camera `gpu_mem` minimum.
    #[serde(default = "default_true")]
    pub camera_attached: bool,
    #[serde(default)]
    pub directives: BTreeMap<String, String>,
}

impl Default for BootConfigPlan {
    fn default() -> Self {
        Self {
            path: default_boot_config_path(),
            camera_attached: true,
            directives: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapPlan {
    #[serde(deserialize_with = "size_in_mib")]
    pub size_mb: u64,
    #[serde(default = "default_algorithm")]
    pub algorithm: CompressionAlgo,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

impl SwapPlan {
    pub fn size_bytes(&self) -> u64 {
        self.size_mb.saturating_mul(MIB)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayPlan {
    pub path: PathBuf,
    #[serde(deserialize_with = "size_in_mib")]
    pub size_mb: u64,
}

impl OverlayPlan {
    pub fn mount(&self) -> OverlayMount {
        OverlayMount::new(self.path.clone(), self.size_mb.saturating_mul(MIB))
    }
}

/// Leaf provisioning steps. Absent sections are skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionPlan {
    pub boot_config: Option<BootConfigPlan>,
    pub swap: Option<SwapPlan>,
    pub governor: Option<GovernorMode>,
    pub overlays: Vec<OverlayPlan>,
    pub sysctl: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_deserialises_from_toml() {
        let plan: ProvisionPlan = toml::from_str(
            r#"
            governor = "performance"

            [boot_config]
            directives = { gpu_mem = "128", arm_freq = "1800" }

            [swap]
            size_mb = 256
            algorithm = "zstd"

            [[overlays]]
            path = "/tmp"
            size_mb = 64

            [sysctl]
            "vm.swappiness" = "100"
            "#,
        )
        .unwrap();
        assert_eq!(plan.governor, Some(GovernorMode::Performance));
        let boot = plan.boot_config.unwrap();
        assert_eq!(boot.path, PathBuf::from(DEFAULT_BOOT_CONFIG));
        assert!(boot.camera_attached);
        assert_eq!(boot.directives["gpu_mem"], "128");
        let swap = plan.swap.unwrap();
        assert_eq!(swap.size_bytes(), 256 * MIB);
        assert_eq!(swap.priority, 100);
        assert_eq!(plan.overlays[0].mount(), OverlayMount::new("/tmp", 64 * MIB));
        assert_eq!(plan.sysctl["vm.swappiness"], "100");
    }

    #[test]
    fn overflowing_size_is_rejected() {
        let err = toml::from_str::<ProvisionPlan>("[swap]\nsize_mb = 20000000000000\n").unwrap_err();
        assert!(err.to_string().contains("overflows"));
        assert!(toml::from_str::<ProvisionPlan>("[[overlays]]\npath = \"/tmp\"\nsize_mb = 20000000000000\n").is_err());
    }

    #[test]
    fn empty_plan_skips_everything() {
        let plan: ProvisionPlan = toml::from_str("").unwrap();
        assert_eq!(plan, ProvisionPlan::default());
    }
}
