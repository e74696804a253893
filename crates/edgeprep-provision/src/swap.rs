//! [`SwapManager`] – compressed swap on a zram block device.
//!
//! Provisioning writes the compression algorithm and size into
//! `/sys/block/<dev>`, formats the device with `mkswap` and enables it with
//! `swapon -p <priority>`. A JSON marker in the state directory records what
//! was created so a second call is a no-op, and a oneshot boot unit recreates
//! the device after every restart.
//!
//! Teardown always disables swapping before resetting the device so in-use
//! pages are migrated back to RAM instead of being dropped.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use edgeprep_types::{CompressionAlgo, HostRoot, ProvisionError, SwapDevice};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::boot_unit::{BootUnit, BootUnitWriter, sysfs_write_command};
use crate::document::write_atomic;
use crate::host::CommandRunner;
use crate::meminfo::MemoryInfo;

pub const BOOT_UNIT_NAME: &str = "edgeprep-zram.service";
const MARKER_FILE: &str = "zram.json";

// ────────────────────────────────────────────────────────────────────────────
// Policy
// ────────────────────────────────────────────────────────────────────────────

/// Limits applied by [`SwapManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapPolicy {
    /// Largest device size as a fraction of physical RAM.
    pub max_ram_fraction: f64,
    /// `swapoff` attempts before teardown gives up.
    pub swapoff_attempts: u32,
    /// Pause between `swapoff` attempts.
    pub swapoff_delay_ms: u64,
    /// zram device name under `/dev` and `/sys/block`.
    pub device: String,
}

impl Default for SwapPolicy {
    fn default() -> Self {
        Self {
            max_ram_fraction: 0.5,
            swapoff_attempts: 5,
            swapoff_delay_ms: 500,
            device: "zram0".to_string(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Reports
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of [`SwapManager::provision`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapReport {
    pub device: String,
    pub swap: SwapDevice,
    pub effective_capacity: u64,
    /// `false` when the device already existed and nothing was changed.
    pub created: bool,
}

/// Output of [`SwapManager::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapStatus {
    pub device: String,
    /// Parameters recorded by the last successful provisioning.
    pub provisioned: Option<SwapDevice>,
    /// Whether `/proc/swaps` currently lists the device.
    pub active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Marker {
    device: String,
    swap: SwapDevice,
}

// ────────────────────────────────────────────────────────────────────────────
// SwapManager
// ────────────────────────────────────────────────────────────────────────────

pub struct SwapManager {
    root: HostRoot,
    state_dir: PathBuf,
    policy: SwapPolicy,
    runner: Arc<dyn CommandRunner>,
    boot_units: BootUnitWriter,
}

impl SwapManager {
    pub fn new(
        root: HostRoot,
        state_dir: impl Into<PathBuf>,
        policy: SwapPolicy,
        runner: Arc<dyn CommandRunner>,
        boot_units: BootUnitWriter,
    ) -> Self {
        Self {
            root,
            state_dir: state_dir.into(),
            policy,
            runner,
            boot_units,
        }
    }

    fn dev_node(&self) -> String {
        format!("/dev/{}", self.policy.device)
    }

    fn sys_dir(&self) -> PathBuf {
        PathBuf::from("/sys/block").join(&self.policy.device)
    }

    fn marker_path(&self) -> PathBuf {
        self.root.path(self.state_dir.join(MARKER_FILE))
    }

    fn read_marker(&self) -> Option<Marker> {
        let raw = fs::read_to_string(self.marker_path()).ok()?;
        match serde_json::from_str(&raw) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!(error = %e, "ignoring unreadable swap marker");
                None
            }
        }
    }

    /// Whether `/proc/swaps` lists the device.
    pub fn is_active(&self) -> bool {
        let dev = self.dev_node();
        fs::read_to_string(self.root.path("/proc/swaps"))
            .map(|raw| {
                raw.lines()
                    .skip(1)
                    .any(|l| l.split_whitespace().next() == Some(dev.as_str()))
            })
            .unwrap_or(false)
    }

    fn write_sysfs(&self, attr: &str, value: &str) -> Result<(), ProvisionError> {
        let path = self.root.path(self.sys_dir().join(attr));
        fs::write(&path, value).map_err(|e| ProvisionError::io(&path, e))
    }

    /// Create, format and enable the swap device.
    ///
    /// # Errors
    ///
    /// - [`ProvisionError::InsufficientMemory`] if `size_bytes` exceeds the
    ///   policy fraction of physical RAM; nothing is created.
    /// - [`ProvisionError::DeviceBusy`] if the device is already in use as
    ///   swap without having been provisioned by this tool.
    pub fn provision(
        &self,
        size_bytes: u64,
        algorithm: CompressionAlgo,
        priority: i32,
    ) -> Result<SwapReport, ProvisionError> {
        if let Some(marker) = self.read_marker() {
            info!(device = %marker.device, "swap already provisioned");
            return Ok(SwapReport {
                effective_capacity: marker.swap.effective_capacity(),
                device: marker.device,
                swap: marker.swap,
                created: false,
            });
        }

        let mem = MemoryInfo::read(&self.root)?;
        let limit = (mem.total_bytes as f64 * self.policy.max_ram_fraction) as u64;
        if size_bytes > limit {
            return Err(ProvisionError::InsufficientMemory {
                requested: size_bytes,
                limit,
                detail: format!(
                    "swap device may use at most {:.0}% of {} bytes RAM",
                    self.policy.max_ram_fraction * 100.0,
                    mem.total_bytes
                ),
            });
        }

        if self.is_active() {
            return Err(ProvisionError::DeviceBusy {
                device: self.policy.device.clone(),
                attempts: 0,
            });
        }

        if !self.root.path(self.sys_dir()).is_dir() {
            self.runner.run("modprobe", &["zram"])?;
            if !self.root.path(self.sys_dir()).is_dir() {
                return Err(ProvisionError::HostCommand {
                    command: "modprobe zram".to_string(),
                    details: format!("{} did not appear", self.sys_dir().display()),
                });
            }
        }

        let swap = SwapDevice {
            size_bytes,
            algorithm,
            priority,
        };
        if let Err(e) = self.bring_up(&swap).and_then(|()| self.persist(&swap)) {
            error!(device = %self.policy.device, error = %e, "swap provisioning failed; resetting device");
            self.roll_back();
            return Err(e);
        }

        let report = SwapReport {
            device: self.policy.device.clone(),
            effective_capacity: swap.effective_capacity(),
            swap,
            created: true,
        };
        info!(
            device = %report.device,
            size_bytes,
            algorithm = %algorithm,
            priority,
            effective_capacity = report.effective_capacity,
            "swap provisioned"
        );
        Ok(report)
    }

    fn bring_up(&self, swap: &SwapDevice) -> Result<(), ProvisionError> {
        let dev = self.dev_node();
        self.write_sysfs("comp_algorithm", swap.algorithm.as_str())?;
        self.write_sysfs("disksize", &swap.size_bytes.to_string())?;
        self.runner.run("mkswap", &[&dev])?;
        self.runner
            .run("swapon", &["-p", &swap.priority.to_string(), &dev])?;
        Ok(())
    }

    /// Boot unit and marker. Only called once the device is live.
    fn persist(&self, swap: &SwapDevice) -> Result<(), ProvisionError> {
        self.boot_units.install(&self.boot_unit(swap))?;

        let marker = Marker {
            device: self.policy.device.clone(),
            swap: swap.clone(),
        };
        let path = self.marker_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| ProvisionError::io(dir, e))?;
        }
        let json = serde_json::to_vec_pretty(&marker).map_err(|e| ProvisionError::Io {
            path: path.clone(),
            details: e.to_string(),
        })?;
        write_atomic(&path, &json).map_err(|e| ProvisionError::io(&path, e))
    }

    /// Undo a partial provisioning so the next attempt starts clean.
    fn roll_back(&self) {
        let _ = self.runner.run("swapoff", &[&self.dev_node()]);
        if let Err(e) = self.write_sysfs("reset", "1") {
            warn!(error = %e, "device reset after failed provisioning also failed");
        }
        if let Err(e) = self.boot_units.remove(BOOT_UNIT_NAME) {
            warn!(error = %e, "cannot remove swap boot unit after failed provisioning");
        }
    }

    fn boot_unit(&self, swap: &SwapDevice) -> BootUnit {
        let dev = self.dev_node();
        let sys = self.sys_dir();
        BootUnit::new(BOOT_UNIT_NAME, "edgeprep compressed swap")
            .exec_start("/sbin/modprobe zram")
            .exec_start(sysfs_write_command(swap.algorithm.as_str(), &sys.join("comp_algorithm")))
            .exec_start(sysfs_write_command(&swap.size_bytes.to_string(), &sys.join("disksize")))
            .exec_start(format!("/sbin/mkswap {dev}"))
            .exec_start(format!("/sbin/swapon -p {} {dev}", swap.priority))
            .exec_stop(format!("/sbin/swapoff {dev}"))
            .exec_stop(sysfs_write_command("1", &sys.join("reset")))
    }

    /// Disable and remove the swap device.
    ///
    /// Returns `false` when there was nothing to remove.
    ///
    /// # Errors
    ///
    /// [`ProvisionError::DeviceBusy`] if the kernel still lists the device
    /// after the configured number of `swapoff` attempts. The device is left
    /// enabled in that case.
    pub fn deprovision(&self) -> Result<bool, ProvisionError> {
        let had_marker = self.marker_path().exists();
        let was_active = self.is_active();
        if !had_marker && !was_active {
            info!(device = %self.policy.device, "no swap device to remove");
            return Ok(false);
        }

        if was_active {
            self.swapoff_with_retry()?;
        }

        if self.root.path(self.sys_dir()).is_dir() {
            self.write_sysfs("reset", "1")?;
        }
        self.boot_units.remove(BOOT_UNIT_NAME)?;
        let marker = self.marker_path();
        if marker.exists() {
            fs::remove_file(&marker).map_err(|e| ProvisionError::io(&marker, e))?;
        }
        info!(device = %self.policy.device, "swap deprovisioned");
        Ok(true)
    }

    fn swapoff_with_retry(&self) -> Result<(), ProvisionError> {
        let dev = self.dev_node();
        let attempts = self.policy.swapoff_attempts.max(1);
        for attempt in 1..=attempts {
            match self.runner.run("swapoff", &[&dev]) {
                Ok(_) if !self.is_active() => return Ok(()),
                Ok(_) => warn!(device = %dev, attempt, "swapoff returned but device still active"),
                Err(e) => warn!(device = %dev, attempt, error = %e, "swapoff failed"),
            }
            if attempt < attempts {
                thread::sleep(Duration::from_millis(self.policy.swapoff_delay_ms));
            }
        }
        Err(ProvisionError::DeviceBusy {
            device: self.policy.device.clone(),
            attempts,
        })
    }

    pub fn status(&self) -> SwapStatus {
        SwapStatus {
            device: self.policy.device.clone(),
            provisioned: self.read_marker().map(|m| m.swap),
            active: self.is_active(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::boot_unit::DEFAULT_UNIT_DIR;
    use crate::host::RecordingRunner;

    const MIB: u64 = 1024 * 1024;
    const SWAPS_HEADER: &str = "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n";

    fn host(total_mb: u64) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("proc")).unwrap();
        fs::create_dir_all(root.join("sys/block/zram0")).unwrap();
        fs::write(
            root.join("proc/meminfo"),
            format!("MemTotal: {} kB\nMemAvailable: {} kB\n", total_mb * 1024, total_mb * 512),
        )
        .unwrap();
        fs::write(root.join("proc/swaps"), SWAPS_HEADER).unwrap();
        dir
    }

    /// Runner whose swapon/swapoff edit `<root>/proc/swaps` like the kernel.
    fn kernel_like(root: &Path) -> Arc<RecordingRunner> {
        kernel_like_with(root, RecordingRunner::new())
    }

    fn kernel_like_with(root: &Path, base: RecordingRunner) -> Arc<RecordingRunner> {
        let on = root.join("proc/swaps");
        let off = on.clone();
        Arc::new(
            base
                .with_handler("swapon", move |args| {
                    let dev = args.last().copied().unwrap_or_default();
                    let mut swaps = fs::read_to_string(&on).unwrap();
                    swaps.push_str(&format!("{dev}\tpartition\t102396\t0\t100\n"));
                    fs::write(&on, swaps).unwrap();
                    Ok(String::new())
                })
                .with_handler("swapoff", move |_| {
                    fs::write(&off, SWAPS_HEADER).unwrap();
                    Ok(String::new())
                }),
        )
    }

    fn manager(root: &Path, runner: Arc<RecordingRunner>, policy: SwapPolicy) -> SwapManager {
        let host_root = HostRoot::new(root);
        let units = BootUnitWriter::new(host_root.clone(), DEFAULT_UNIT_DIR, runner.clone());
        SwapManager::new(host_root, "/var/lib/edgeprep", policy, runner, units)
    }

    #[test]
    fn provision_then_deprovision_round_trip() {
        let dir = host(1024);
        let runner = kernel_like(dir.path());
        let swap = manager(dir.path(), runner.clone(), SwapPolicy::default());

        let report = swap.provision(256 * MIB, CompressionAlgo::Zstd, 100).unwrap();
        assert!(report.created);
        assert_eq!(report.effective_capacity, 768 * MIB);
        assert!(swap.is_active());
        let sys = dir.path().join("sys/block/zram0");
        assert_eq!(fs::read_to_string(sys.join("comp_algorithm")).unwrap(), "zstd");
        assert_eq!(
            fs::read_to_string(sys.join("disksize")).unwrap(),
            (256 * MIB).to_string()
        );
        assert!(dir.path().join("etc/systemd/system").join(BOOT_UNIT_NAME).is_file());
        assert_eq!(runner.calls_starting_with("swapon -p 100 /dev/zram0").len(), 1);

        assert!(swap.deprovision().unwrap());
        assert!(!swap.is_active());
        assert_eq!(fs::read_to_string(sys.join("reset")).unwrap(), "1");
        assert!(!dir.path().join("var/lib/edgeprep/zram.json").exists());
        assert!(!dir.path().join("etc/systemd/system").join(BOOT_UNIT_NAME).exists());
        assert_eq!(swap.status().provisioned, None);
    }

    #[test]
    fn second_provision_returns_existing_device() {
        let dir = host(1024);
        let runner = kernel_like(dir.path());
        let swap = manager(dir.path(), runner.clone(), SwapPolicy::default());

        swap.provision(128 * MIB, CompressionAlgo::Lz4, 100).unwrap();
        let again = swap.provision(64 * MIB, CompressionAlgo::Zstd, 5).unwrap();
        assert!(!again.created);
        assert_eq!(again.swap.size_bytes, 128 * MIB);
        assert_eq!(again.swap.algorithm, CompressionAlgo::Lz4);
        assert_eq!(runner.calls_starting_with("mkswap").len(), 1);
    }

    #[test]
    fn oversized_request_creates_nothing() {
        let dir = host(1000);
        let runner = kernel_like(dir.path());
        let swap = manager(dir.path(), runner.clone(), SwapPolicy::default());

        let err = swap.provision(600 * MIB, CompressionAlgo::Lz4, 100).unwrap_err();
        assert!(matches!(err, ProvisionError::InsufficientMemory { .. }));
        assert!(runner.calls().is_empty());
        assert!(!swap.is_active());
        assert!(swap.status().provisioned.is_none());
        assert!(!dir.path().join("sys/block/zram0/disksize").exists());
    }

    #[test]
    fn stuck_swapoff_is_device_busy() {
        let dir = host(1024);
        fs::write(
            dir.path().join("proc/swaps"),
            format!("{SWAPS_HEADER}/dev/zram0\tpartition\t102396\t2048\t100\n"),
        )
        .unwrap();
        let runner = Arc::new(RecordingRunner::new().with_handler("swapoff", |_| {
            Err(ProvisionError::HostCommand {
                command: "swapoff /dev/zram0".into(),
                details: "Device or resource busy".into(),
            })
        }));
        let policy = SwapPolicy {
            swapoff_delay_ms: 0,
            ..SwapPolicy::default()
        };
        let swap = manager(dir.path(), runner.clone(), policy);

        let err = swap.deprovision().unwrap_err();
        assert_eq!(
            err,
            ProvisionError::DeviceBusy {
                device: "zram0".into(),
                attempts: 5
            }
        );
        assert_eq!(runner.calls_starting_with("swapoff").len(), 5);
        assert!(!dir.path().join("sys/block/zram0/reset").exists());
    }

    #[test]
    fn foreign_active_device_is_not_reused() {
        let dir = host(1024);
        fs::write(
            dir.path().join("proc/swaps"),
            format!("{SWAPS_HEADER}/dev/zram0\tpartition\t102396\t0\t-2\n"),
        )
        .unwrap();
        let runner = kernel_like(dir.path());
        let swap = manager(dir.path(), runner, SwapPolicy::default());
        let err = swap.provision(64 * MIB, CompressionAlgo::Lz4, 100).unwrap_err();
        assert!(matches!(err, ProvisionError::DeviceBusy { attempts: 0, .. }));
    }

    #[test]
    fn failed_swapon_resets_device() {
        let dir = host(1024);
        let runner = Arc::new(RecordingRunner::new().with_handler("swapon", |_| {
            Err(ProvisionError::HostCommand {
                command: "swapon".into(),
                details: "Invalid argument".into(),
            })
        }));
        let swap = manager(dir.path(), runner, SwapPolicy::default());
        assert!(swap.provision(64 * MIB, CompressionAlgo::Lz4, 100).is_err());
        assert_eq!(
            fs::read_to_string(dir.path().join("sys/block/zram0/reset")).unwrap(),
            "1"
        );
        assert!(swap.status().provisioned.is_none());
    }

    #[test]
    fn failure_after_swapon_rolls_back_and_retry_succeeds() {
        let dir = host(1024);
        let systemctl_down = Arc::new(AtomicBool::new(true));
        let flag = systemctl_down.clone();
        let base = RecordingRunner::new().with_handler("systemctl", move |_| {
            if flag.load(Ordering::SeqCst) {
                Err(ProvisionError::HostCommand {
                    command: "systemctl enable".into(),
                    details: "transient".into(),
                })
            } else {
                Ok(String::new())
            }
        });
        let runner = kernel_like_with(dir.path(), base);
        let swap = manager(dir.path(), runner.clone(), SwapPolicy::default());

        let err = swap.provision(64 * MIB, CompressionAlgo::Lz4, 100).unwrap_err();
        assert!(matches!(err, ProvisionError::HostCommand { .. }));
        assert!(!swap.is_active());
        assert!(swap.status().provisioned.is_none());
        assert_eq!(
            fs::read_to_string(dir.path().join("sys/block/zram0/reset")).unwrap(),
            "1"
        );

        systemctl_down.store(false, Ordering::SeqCst);
        let report = swap.provision(64 * MIB, CompressionAlgo::Lz4, 100).unwrap();
        assert!(report.created);
        assert!(swap.is_active());
        assert_eq!(runner.calls_starting_with("swapon").len(), 2);
    }

    #[test]
    fn deprovision_without_device_is_noop() {
        let dir = host(1024);
        let runner = kernel_like(dir.path());
        let swap = manager(dir.path(), runner.clone(), SwapPolicy::default());
        assert!(!swap.deprovision().unwrap());
        assert!(runner.calls().is_empty());
    }
}
