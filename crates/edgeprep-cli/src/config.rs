//! Configuration file – `/etc/edgeprep/edgeprep.toml`.
//!
//! One TOML document describes the host layout, the leaf provisioning plan
//! and the service manifest. Every field has a default, so a file holding
//! only `[provision]` or only `[[services.units]]` is valid.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use edgeprep_hal::{ActuatorRegistry, HardwareSafetyGuard, guard::DEFAULT_QUIESCE_TIMEOUT};
use edgeprep_hal::gpio::SYSFS_GPIO_ROOT;
use edgeprep_orchestrator::ServiceManifest;
use edgeprep_provision::boot_unit::DEFAULT_UNIT_DIR;
use edgeprep_provision::sysctl::DEFAULT_SYSCTL_FILE;
use edgeprep_provision::tmpfs::DEFAULT_RESERVE_FRACTION;
use edgeprep_provision::{CommandRunner, SwapPolicy};
use edgeprep_runtime::run::DEFAULT_STATE_DIR;
use edgeprep_runtime::{HostContext, ProvisionPlan};
use edgeprep_types::{CleanupAction, HostRoot};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/edgeprep/edgeprep.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Where edgeprep finds and writes things on the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Prefix for every host path. `/` on a live system; a staging
    /// directory when preparing an image.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,
    #[serde(default = "default_sysctl_file")]
    pub sysctl_file: PathBuf,
    /// Binary referenced by `ExecStopPost=` in rendered service units.
    #[serde(default = "default_quiesce_bin")]
    pub quiesce_bin: PathBuf,
    #[serde(default = "default_gpio_root")]
    pub gpio_root: PathBuf,
    #[serde(default = "default_quiesce_timeout_ms")]
    pub quiesce_timeout_ms: u64,
    /// Share of RAM that tmpfs overlays must leave free.
    #[serde(default = "default_reserve_fraction")]
    pub tmpfs_reserve_fraction: f64,
}

fn default_root() -> PathBuf {
    PathBuf::from("/")
}
fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}
fn default_unit_dir() -> PathBuf {
    PathBuf::from(DEFAULT_UNIT_DIR)
}
fn default_sysctl_file() -> PathBuf {
    PathBuf::from(DEFAULT_SYSCTL_FILE)
}
fn default_quiesce_bin() -> PathBuf {
    PathBuf::from("/usr/local/bin/edgeprep")
}
fn default_gpio_root() -> PathBuf {
    PathBuf::from(SYSFS_GPIO_ROOT)
}
fn default_quiesce_timeout_ms() -> u64 {
    DEFAULT_QUIESCE_TIMEOUT.as_millis() as u64
}
fn default_reserve_fraction() -> f64 {
    DEFAULT_RESERVE_FRACTION
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            state_dir: default_state_dir(),
            unit_dir: default_unit_dir(),
            sysctl_file: default_sysctl_file(),
            quiesce_bin: default_quiesce_bin(),
            gpio_root: default_gpio_root(),
            quiesce_timeout_ms: default_quiesce_timeout_ms(),
            tmpfs_reserve_fraction: default_reserve_fraction(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub swap_policy: SwapPolicy,
    #[serde(default)]
    pub provision: ProvisionPlan,
    #[serde(default)]
    pub services: ServiceManifest,
}

impl Config {
    pub fn host_root(&self) -> HostRoot {
        HostRoot::new(&self.host.root)
    }

    pub fn host_context(&self, runner: Arc<dyn CommandRunner>) -> HostContext {
        HostContext {
            root: self.host_root(),
            state_dir: self.host.state_dir.clone(),
            unit_dir: self.host.unit_dir.clone(),
            sysctl_file: self.host.sysctl_file.clone(),
            swap_policy: self.swap_policy.clone(),
            tmpfs_reserve_fraction: self.host.tmpfs_reserve_fraction,
            runner,
        }
    }

    pub fn guard(&self) -> HardwareSafetyGuard {
        let registry = ActuatorRegistry::with_gpio_root(self.host_root().path(&self.host.gpio_root));
        HardwareSafetyGuard::new(
            Arc::new(registry),
            Duration::from_millis(self.host.quiesce_timeout_ms),
        )
    }

    /// Cleanup actions of `unit`, or `None` if the manifest has no such unit.
    pub fn cleanup_for(&self, unit: &str) -> Option<Vec<CleanupAction>> {
        let name = unit.strip_suffix(".service").unwrap_or(unit);
        self.services.unit(name).map(|u| u.cleanup.clone())
    }

    /// Every configured actuator, once.
    pub fn all_cleanup(&self) -> Vec<CleanupAction> {
        let mut seen = BTreeSet::new();
        self.services
            .start_order()
            .into_iter()
            .flat_map(|u| u.cleanup.iter())
            .filter(|a| seen.insert(a.target_resource_id.clone()))
            .cloned()
            .collect()
    }
}

/// Load `path` and apply environment overrides.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Apply `EDGEPREP_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `EDGEPREP_ROOT` | `host.root` |
/// | `EDGEPREP_STATE_DIR` | `host.state_dir` |
/// | `EDGEPREP_UNIT_DIR` | `host.unit_dir` |
/// | `EDGEPREP_BOOT_CONFIG` | `provision.boot_config.path` |
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |name| std::env::var(name).ok());
}

fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("EDGEPREP_ROOT") {
        cfg.host.root = PathBuf::from(v);
    }
    if let Some(v) = var("EDGEPREP_STATE_DIR") {
        cfg.host.state_dir = PathBuf::from(v);
    }
    if let Some(v) = var("EDGEPREP_UNIT_DIR") {
        cfg.host.unit_dir = PathBuf::from(v);
    }
    if let Some(v) = var("EDGEPREP_BOOT_CONFIG")
        && let Some(boot) = cfg.provision.boot_config.as_mut()
    {
        boot.path = PathBuf::from(v);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use edgeprep_types::{CompressionAlgo, Criticality, GovernorMode};

    use super::*;

    const SAMPLE: &str = r#"
[host]
root = "/srv/image"

[swap_policy]
max_ram_fraction = 0.4

[provision]
governor = "performance"
sysctl = { "vm.swappiness" = "100" }

[provision.boot_config]
directives = { gpu_mem = "128" }

[provision.swap]
size_mb = 512
algorithm = "zstd"

[[provision.overlays]]
path = "/tmp"
size_mb = 64

[services]
deadline_secs = 120

[[services.units]]
name = "get_gps_data"
executable_path = "/opt/firmware/get_gps_data"
start_rank = 1

[[services.units]]
name = "facial"
executable_path = "/opt/firmware/facial"
start_rank = 2
criticality = "critical"
dependencies = ["get_gps_data"]
cleanup = [{ target_resource_id = "gpio12" }, { target_resource_id = "gpio4" }]

[[services.units]]
name = "upload_images"
executable_path = "/opt/firmware/upload_images"
start_rank = 3
cleanup = [{ target_resource_id = "gpio4" }]
"#;

    fn write(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("edgeprep.toml");
        fs::write(&path, content).expect("write config");
        (dir, path)
    }

    fn parse(content: &str) -> Config {
        toml::from_str(content).expect("valid config")
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg = parse("");
        assert_eq!(cfg, Config::default());
        assert!(cfg.host_root().is_system());
        assert_eq!(cfg.host.quiesce_timeout_ms, 500);
    }

    #[test]
    fn sample_parses() {
        let cfg = parse(SAMPLE);
        assert_eq!(cfg.host.root, PathBuf::from("/srv/image"));
        assert_eq!(cfg.host.unit_dir, PathBuf::from(DEFAULT_UNIT_DIR));
        assert_eq!(cfg.swap_policy.max_ram_fraction, 0.4);
        assert_eq!(cfg.swap_policy.swapoff_attempts, 5);
        assert_eq!(cfg.provision.governor, Some(GovernorMode::Performance));
        assert_eq!(
            cfg.provision.swap.as_ref().map(|s| s.algorithm),
            Some(CompressionAlgo::Zstd)
        );
        assert_eq!(cfg.services.deadline_secs, 120);
        let facial = cfg.services.unit("facial").expect("facial unit");
        assert_eq!(facial.criticality, Criticality::Critical);
        assert_eq!(facial.cleanup[0].quiescent_value, "0");
        assert!(cfg.services.validate().is_ok());
    }

    #[test]
    fn shipped_example_is_valid() {
        let cfg = parse(include_str!("../../../config/edgeprep.example.toml"));
        assert!(cfg.services.validate().is_ok());
        assert_eq!(cfg.services.units.len(), 6);
        let targets: Vec<String> = cfg
            .all_cleanup()
            .into_iter()
            .map(|a| a.target_resource_id)
            .collect();
        assert_eq!(targets, vec!["gpio12", "gpio13", "gpio4"]);
        let boot = cfg.provision.boot_config.expect("boot config section");
        assert_eq!(boot.directives["gpu_mem"], "256");
        assert_eq!(cfg.provision.overlays.len(), 2);
    }

    #[test]
    fn cleanup_lookup_accepts_systemd_names() {
        let cfg = parse(SAMPLE);
        let actions = cfg.cleanup_for("facial.service").expect("known unit");
        assert_eq!(actions.len(), 2);
        assert!(cfg.cleanup_for("ghost").is_none());
        assert_eq!(cfg.cleanup_for("get_gps_data"), Some(Vec::new()));
    }

    #[test]
    fn all_cleanup_deduplicates_targets() {
        let cfg = parse(SAMPLE);
        let targets: Vec<String> = cfg
            .all_cleanup()
            .into_iter()
            .map(|a| a.target_resource_id)
            .collect();
        assert_eq!(targets, vec!["gpio12", "gpio4"]);
    }

    #[test]
    fn host_context_reroots() {
        let cfg = parse(SAMPLE);
        let ctx = cfg.host_context(Arc::new(edgeprep_provision::RecordingRunner::new()));
        assert_eq!(ctx.root.path("/etc/fstab"), PathBuf::from("/srv/image/etc/fstab"));
        assert_eq!(ctx.swap_policy.max_ram_fraction, 0.4);
    }

    #[test]
    fn overrides_apply() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("EDGEPREP_ROOT", "/mnt/staging"),
            ("EDGEPREP_UNIT_DIR", "/lib/systemd/system"),
            ("EDGEPREP_BOOT_CONFIG", "/boot/config.txt"),
        ]);
        let mut cfg = parse(SAMPLE);
        apply_overrides(&mut cfg, |name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(cfg.host.root, PathBuf::from("/mnt/staging"));
        assert_eq!(cfg.host.unit_dir, PathBuf::from("/lib/systemd/system"));
        assert_eq!(cfg.host.state_dir, PathBuf::from(DEFAULT_STATE_DIR));
        assert_eq!(
            cfg.provision.boot_config.map(|b| b.path),
            Some(PathBuf::from("/boot/config.txt"))
        );
    }

    #[test]
    fn boot_config_override_needs_a_boot_config_section() {
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, |name| {
            (name == "EDGEPREP_BOOT_CONFIG").then(|| "/boot/config.txt".to_string())
        });
        assert!(cfg.provision.boot_config.is_none());
    }

    #[test]
    fn load_from_reads_file() {
        let (_dir, path) = write(SAMPLE);
        let cfg = load_from(&path).expect("load ok");
        assert_eq!(cfg.services.units.len(), 3);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let err = load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let (_dir, path) = write("[host\nroot = 1");
        assert!(matches!(load_from(&path).unwrap_err(), ConfigError::Parse { .. }));
    }

    #[test]
    fn overflowing_swap_size_is_a_parse_error() {
        let (_dir, path) = write("[provision.swap]\nsize_mb = 20000000000000\n");
        assert!(matches!(load_from(&path).unwrap_err(), ConfigError::Parse { .. }));
    }
}
