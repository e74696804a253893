//! [`GovernorController`] – per-core cpufreq governor control.
//!
//! Setting a governor is a multi-target operation: every core is attempted
//! even when an earlier one refuses the mode, and the cores that failed are
//! named in a [`ProvisionError::PartialApplication`].

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use edgeprep_types::{GovernorMode, HostRoot, ProvisionError};
use tracing::{info, warn};

use crate::boot_unit::{BootUnit, BootUnitWriter};

pub const BOOT_UNIT_NAME: &str = "edgeprep-governor.service";
const CPU_ROOT: &str = "/sys/devices/system/cpu";

pub struct GovernorController {
    root: HostRoot,
    boot_units: BootUnitWriter,
}

impl GovernorController {
    pub fn new(root: HostRoot, boot_units: BootUnitWriter) -> Self {
        Self { root, boot_units }
    }

    /// Logical cores exposing a `cpufreq` directory, ascending.
    pub fn cores(&self) -> Result<Vec<u32>, ProvisionError> {
        let cpu_root = self.root.path(CPU_ROOT);
        let entries = fs::read_dir(&cpu_root).map_err(|e| ProvisionError::io(&cpu_root, e))?;
        let mut cores: Vec<u32> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let index = name.to_str()?.strip_prefix("cpu")?.parse::<u32>().ok()?;
                entry.path().join("cpufreq").is_dir().then_some(index)
            })
            .collect();
        cores.sort_unstable();
        Ok(cores)
    }

    fn cpufreq_dir(&self, core: u32) -> PathBuf {
        self.root.path(CPU_ROOT).join(format!("cpu{core}/cpufreq"))
    }

    /// Apply `mode` to every core and persist it for future boots.
    ///
    /// Returns the cores that accepted the mode.
    ///
    /// # Errors
    ///
    /// [`ProvisionError::PartialApplication`] naming each core that rejected
    /// the mode, failed the write, or read back a different value. The other
    /// cores keep the new mode and the boot unit is still installed; if that
    /// install fails too, `failed` also lists `boot-unit`.
    pub fn set_governor(&self, mode: GovernorMode) -> Result<Vec<u32>, ProvisionError> {
        let cores = self.cores()?;
        if cores.is_empty() {
            return Err(ProvisionError::Io {
                path: self.root.path(CPU_ROOT),
                details: "no cpufreq-capable cores found".to_string(),
            });
        }

        let mut applied = Vec::new();
        let mut failed = Vec::new();
        for core in cores {
            match self.apply_core(core, mode) {
                Ok(()) => applied.push(core),
                Err(reason) => {
                    warn!(core, mode = %mode, %reason, "core rejected governor");
                    failed.push(core.to_string());
                }
            }
        }

        let persisted = self.boot_units.install(&boot_unit(mode));

        if !failed.is_empty() {
            if let Err(e) = persisted {
                warn!(mode = %mode, error = %e, "governor boot unit not installed");
                failed.push(PERSIST_FAILURE.to_string());
            }
            return Err(ProvisionError::PartialApplication {
                operation: format!("set governor {mode}"),
                failed,
            });
        }
        persisted?;
        info!(mode = %mode, cores = applied.len(), "governor applied");
        Ok(applied)
    }

    fn apply_core(&self, core: u32, mode: GovernorMode) -> Result<(), String> {
        let dir = self.cpufreq_dir(core);
        if let Ok(available) = fs::read_to_string(dir.join("scaling_available_governors"))
            && !available.split_whitespace().any(|g| g == mode.as_str())
        {
            return Err(format!("not in available governors: {}", available.trim()));
        }
        let target = dir.join("scaling_governor");
        fs::write(&target, mode.as_str()).map_err(|e| format!("write failed: {e}"))?;
        let read_back = fs::read_to_string(&target).map_err(|e| format!("read-back failed: {e}"))?;
        if read_back.trim() != mode.as_str() {
            return Err(format!("read back '{}'", read_back.trim()));
        }
        Ok(())
    }

    /// Live governor per core; `None` where it cannot be read.
    pub fn current_governor(&self) -> Result<BTreeMap<u32, Option<String>>, ProvisionError> {
        Ok(self
            .cores()?
            .into_iter()
            .map(|core| {
                let value = fs::read_to_string(self.cpufreq_dir(core).join("scaling_governor"))
                    .ok()
                    .map(|v| v.trim().to_string());
                (core, value)
            })
            .collect())
    }
}

/// Entry in `PartialApplication.failed` when the boot unit could not be installed.
const PERSIST_FAILURE: &str = "boot-unit";

fn boot_unit(mode: GovernorMode) -> BootUnit {
    BootUnit::new(BOOT_UNIT_NAME, "edgeprep cpufreq governor").exec_start(format!(
        "/bin/sh -c 'for f in {CPU_ROOT}/cpu[0-9]*/cpufreq/scaling_governor; do echo {mode} > \"$f\"; done'"
    ))
}
