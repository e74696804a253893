//! Shared data model for edgeprep.
//!
//! Every crate in the workspace speaks in these types: the leaf provisioning
//! components return them, the orchestrator consumes [`ServiceUnit`]s, and the
//! run summary serialises all of them to JSON.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod error;

pub use error::{ProvisionError, exit_code};

const MIB: u64 = 1024 * 1024;

// ────────────────────────────────────────────────────────────────────────────
// Host filesystem root
// ────────────────────────────────────────────────────────────────────────────

/// Prefix applied to every absolute host path (`/boot`, `/etc`, `/proc`,
/// `/sys`, ...).
///
/// On a live device this is `/`. Pointing it elsewhere stages the changes
/// into a mounted image, and lets tests run against a temporary directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRoot(PathBuf);

impl Default for HostRoot {
    fn default() -> Self {
        Self::system()
    }
}

impl HostRoot {
    pub fn system() -> Self {
        Self(PathBuf::from("/"))
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self(root.into())
    }

    pub fn is_system(&self) -> bool {
        self.0 == Path::new("/")
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Map a host path onto this root. Relative paths are taken as relative
    /// to the host's `/`.
    pub fn path(&self, host_path: impl AsRef<Path>) -> PathBuf {
        let relative: PathBuf = host_path
            .as_ref()
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        self.0.join(relative)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Compressed swap
// ────────────────────────────────────────────────────────────────────────────

/// Compression algorithm backing a compressed swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgo {
    Lz4,
    Lzo,
    Zstd,
}

impl CompressionAlgo {
    /// Name as understood by `/sys/block/zram*/comp_algorithm`.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgo::Lz4 => "lz4",
            CompressionAlgo::Lzo => "lzo",
            CompressionAlgo::Zstd => "zstd",
        }
    }

    /// Static compression ratio used to estimate effective capacity.
    ///
    /// These are policy defaults, not measurements. Real ratios depend on the
    /// workload's page contents.
    pub fn estimated_ratio(&self) -> f64 {
        match self {
            CompressionAlgo::Lz4 | CompressionAlgo::Lzo => 2.0,
            CompressionAlgo::Zstd => 3.0,
        }
    }
}

impl fmt::Display for CompressionAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgo {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "lz4" => Ok(CompressionAlgo::Lz4),
            "lzo" | "lzo-rle" => Ok(CompressionAlgo::Lzo),
            "zstd" => Ok(CompressionAlgo::Zstd),
            other => Err(ProvisionError::PolicyViolation {
                key: "compression_algo".to_string(),
                reason: format!("unsupported compression algorithm '{other}'"),
            }),
        }
    }
}

/// A compressed swap device held in RAM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapDevice {
    /// Uncompressed size exposed to the kernel (`disksize`).
    pub size_bytes: u64,
    pub algorithm: CompressionAlgo,
    /// Swap priority passed to `swapon -p`.
    pub priority: i32,
}

impl SwapDevice {
    /// Estimated amount of anonymous memory the device can absorb.
    pub fn effective_capacity(&self) -> u64 {
        (self.size_bytes as f64 * self.algorithm.estimated_ratio()) as u64
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CPU frequency scaling
// ────────────────────────────────────────────────────────────────────────────

/// Kernel cpufreq governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernorMode {
    Performance,
    Powersave,
    Ondemand,
    Conservative,
    Schedutil,
    Userspace,
}

impl GovernorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GovernorMode::Performance => "performance",
            GovernorMode::Powersave => "powersave",
            GovernorMode::Ondemand => "ondemand",
            GovernorMode::Conservative => "conservative",
            GovernorMode::Schedutil => "schedutil",
            GovernorMode::Userspace => "userspace",
        }
    }
}

impl fmt::Display for GovernorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GovernorMode {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "performance" => Ok(GovernorMode::Performance),
            "powersave" => Ok(GovernorMode::Powersave),
            "ondemand" => Ok(GovernorMode::Ondemand),
            "conservative" => Ok(GovernorMode::Conservative),
            "schedutil" => Ok(GovernorMode::Schedutil),
            "userspace" => Ok(GovernorMode::Userspace),
            other => Err(ProvisionError::PolicyViolation {
                key: "governor".to_string(),
                reason: format!("unknown cpufreq governor '{other}'"),
            }),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RAM-backed overlays
// ────────────────────────────────────────────────────────────────────────────

/// A tmpfs mount whose storage lives entirely in RAM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayMount {
    pub path: PathBuf,
    pub size_limit: u64,
}

impl OverlayMount {
    pub fn new(path: impl Into<PathBuf>, size_limit: u64) -> Self {
        Self {
            path: path.into(),
            size_limit,
        }
    }

    /// Mount options in `mount -o` / fstab form.
    pub fn options(&self) -> String {
        format!("noatime,nosuid,size={}", format_size(self.size_limit))
    }
}

/// Render a byte count the way tmpfs `size=` expects it (`64m`, `1g`, or raw
/// bytes when not a whole number of mebibytes).
pub fn format_size(bytes: u64) -> String {
    if bytes != 0 && bytes % (1024 * MIB) == 0 {
        format!("{}g", bytes / (1024 * MIB))
    } else if bytes != 0 && bytes % MIB == 0 {
        format!("{}m", bytes / MIB)
    } else {
        bytes.to_string()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Service units
// ────────────────────────────────────────────────────────────────────────────

/// How the loss of a unit affects the bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Criticality {
    /// Failure to start aborts the remaining bring-up.
    Critical,
    /// Failure is recorded and the bring-up continues.
    #[default]
    BestEffort,
}

/// Restart behaviour handed to the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    #[default]
    OnFailure,
    Always,
}

impl RestartPolicy {
    /// Value of systemd's `Restart=` directive.
    pub fn as_systemd(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Always => "always",
        }
    }
}

/// Drive one actuator resource to its safe value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CleanupAction {
    /// Resource identifier, e.g. `"gpio12"`.
    pub target_resource_id: String,
    /// Value written to the resource on quiesce, e.g. `"0"`.
    #[serde(default = "default_quiescent_value")]
    pub quiescent_value: String,
}

fn default_quiescent_value() -> String {
    "0".to_string()
}

impl CleanupAction {
    pub fn new(target: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            target_resource_id: target.into(),
            quiescent_value: value.into(),
        }
    }
}

/// A background service descriptor as handed over by the packaging side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceUnit {
    /// Unit name without the `.service` suffix.
    pub name: String,
    pub executable_path: PathBuf,
    /// Arguments appended to `executable_path` in `ExecStart=`.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Scheduling niceness, `-20..=19`.
    #[serde(default)]
    pub niceness: i8,
    /// Relative CPU weight, `1..=10000`.
    #[serde(default = "default_resource_weight")]
    pub resource_weight: u32,
    /// Units start in ascending rank.
    pub start_rank: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub criticality: Criticality,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Actuators this unit drives; quiesced whenever the unit terminates.
    #[serde(default)]
    pub cleanup: Vec<CleanupAction>,
    /// Per-unit ceiling on the readiness wait. Falls back to the manifest
    /// default when absent.
    #[serde(default)]
    pub ready_timeout_secs: Option<u64>,
}

fn default_resource_weight() -> u32 {
    100
}

impl ServiceUnit {
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>, start_rank: u32) -> Self {
        Self {
            name: name.into(),
            executable_path: executable.into(),
            args: Vec::new(),
            working_directory: None,
            niceness: 0,
            resource_weight: default_resource_weight(),
            start_rank,
            dependencies: Vec::new(),
            criticality: Criticality::default(),
            restart_policy: RestartPolicy::default(),
            cleanup: Vec::new(),
            ready_timeout_secs: None,
        }
    }

    pub fn controls_actuators(&self) -> bool {
        !self.cleanup.is_empty()
    }
}

/// Lifecycle of a [`ServiceUnit`] as tracked by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Uninstalled,
    Installed,
    Enabled,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl UnitState {
    /// Whether the lifecycle graph has an edge `self → next`.
    pub fn can_transition_to(&self, next: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, next),
            (Uninstalled, Installed)
                | (Installed, Enabled)
                // installation or enabling failed
                | (Uninstalled, Failed)
                | (Installed, Failed)
                | (Enabled, Starting)
                // dependency failed, never started
                | (Enabled, Failed)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                // restart after a clean stop or a failure
                | (Stopped, Starting)
                | (Failed, Starting)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Stopped | UnitState::Failed)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitState::Uninstalled => "uninstalled",
            UnitState::Installed => "installed",
            UnitState::Enabled => "enabled",
            UnitState::Starting => "starting",
            UnitState::Running => "running",
            UnitState::Stopping => "stopping",
            UnitState::Stopped => "stopped",
            UnitState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a unit stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationCause {
    Graceful,
    Crash,
    OomKill,
}
