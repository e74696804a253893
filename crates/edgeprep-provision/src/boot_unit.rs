//! Oneshot units that re-apply provisioned state at boot.
//!
//! zram devices and cpufreq governors do not survive a reboot. The
//! components that create them register a small `Type=oneshot` unit whose
//! `ExecStart=` lines recreate the state before the workload starts.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use edgeprep_types::{HostRoot, ProvisionError};
use tracing::{debug, info};

use crate::document::write_atomic;
use crate::host::CommandRunner;

/// Default location of locally installed units.
pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

/// A boot-time oneshot unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootUnit {
    /// File name including the `.service` suffix.
    pub name: String,
    pub description: String,
    /// Commands run in order at boot.
    pub exec_start: Vec<String>,
    /// Commands run when the unit is stopped.
    pub exec_stop: Vec<String>,
}

impl BootUnit {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            exec_start: Vec::new(),
            exec_stop: Vec::new(),
        }
    }

    pub fn exec_start(mut self, command: impl Into<String>) -> Self {
        self.exec_start.push(command.into());
        self
    }

    pub fn exec_stop(mut self, command: impl Into<String>) -> Self {
        self.exec_stop.push(command.into());
        self
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "# Managed by edgeprep. Local edits are overwritten.\n\
             [Unit]\n\
             Description={}\n\
             DefaultDependencies=no\n\
             After=local-fs.target\n\
             Before=multi-user.target\n\
             \n\
             [Service]\n\
             Type=oneshot\n\
             RemainAfterExit=yes\n",
            self.description
        );
        for cmd in &self.exec_start {
            out.push_str(&format!("ExecStart={cmd}\n"));
        }
        for cmd in &self.exec_stop {
            out.push_str(&format!("ExecStop={cmd}\n"));
        }
        out.push_str("\n[Install]\nWantedBy=multi-user.target\n");
        out
    }
}

/// Shell-wrapped `echo VALUE > PATH`, for sysfs writes in `ExecStart=`.
pub fn sysfs_write_command(value: &str, path: &Path) -> String {
    format!("/bin/sh -c 'echo {value} > {}'", path.display())
}

/// Installs and removes [`BootUnit`]s.
#[derive(Clone)]
pub struct BootUnitWriter {
    root: HostRoot,
    unit_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl BootUnitWriter {
    pub fn new(root: HostRoot, unit_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            root,
            unit_dir: unit_dir.into(),
            runner,
        }
    }

    /// Host path of the unit file for `name`.
    pub fn unit_path(&self, name: &str) -> PathBuf {
        self.root.path(self.unit_dir.join(name))
    }

    /// Write the unit file and enable it.
    pub fn install(&self, unit: &BootUnit) -> Result<PathBuf, ProvisionError> {
        let path = self.unit_path(&unit.name);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| ProvisionError::config_write(dir, e))?;
        }
        write_atomic(&path, unit.render().as_bytes())
            .map_err(|e| ProvisionError::config_write(&path, e))?;
        if self.root.is_system() {
            self.runner.run("systemctl", &["daemon-reload"])?;
        }
        self.systemctl("enable", &unit.name)?;
        info!(unit = %unit.name, path = %path.display(), "boot unit installed");
        Ok(path)
    }

    /// Disable and delete the unit. Absent units are not an error.
    pub fn remove(&self, name: &str) -> Result<(), ProvisionError> {
        let path = self.unit_path(name);
        if !path.exists() {
            debug!(unit = %name, "boot unit not installed");
            return Ok(());
        }
        self.systemctl("disable", name)?;
        fs::remove_file(&path).map_err(|e| ProvisionError::io(&path, e))?;
        if self.root.is_system() {
            self.runner.run("systemctl", &["daemon-reload"])?;
        }
        info!(unit = %name, "boot unit removed");
        Ok(())
    }

    fn systemctl(&self, verb: &str, name: &str) -> Result<String, ProvisionError> {
        if self.root.is_system() {
            self.runner.run("systemctl", &[verb, name])
        } else {
            let root_arg = format!("--root={}", self.root.as_path().display());
            self.runner.run("systemctl", &[&root_arg, verb, name])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RecordingRunner;

    fn unit() -> BootUnit {
        BootUnit::new("edgeprep-test.service", "Test unit")
            .exec_start("/usr/sbin/mkswap /dev/zram0")
            .exec_stop("/sbin/swapoff /dev/zram0")
    }

    #[test]
    fn render_contains_oneshot_sections() {
        let text = unit().render();
        assert!(text.contains("Type=oneshot\n"));
        assert!(text.contains("ExecStart=/usr/sbin/mkswap /dev/zram0\n"));
        assert!(text.contains("ExecStop=/sbin/swapoff /dev/zram0\n"));
        assert!(text.ends_with("WantedBy=multi-user.target\n"));
    }

    #[test]
    fn staged_install_uses_root_flag() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let writer = BootUnitWriter::new(HostRoot::new(dir.path()), DEFAULT_UNIT_DIR, runner.clone());

        let path = writer.install(&unit()).unwrap();
        assert_eq!(path, dir.path().join("etc/systemd/system/edgeprep-test.service"));
        assert!(path.is_file());
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("systemctl --root="));
        assert!(calls[0].ends_with("enable edgeprep-test.service"));

        writer.remove("edgeprep-test.service").unwrap();
        assert!(!path.exists());
        assert!(runner.calls()[1].ends_with("disable edgeprep-test.service"));
    }

    #[test]
    fn removing_absent_unit_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let writer = BootUnitWriter::new(HostRoot::new(dir.path()), DEFAULT_UNIT_DIR, runner.clone());
        writer.remove("edgeprep-absent.service").unwrap();
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn sysfs_write_is_shell_wrapped() {
        let cmd = sysfs_write_command("lz4", Path::new("/sys/block/zram0/comp_algorithm"));
        assert_eq!(cmd, "/bin/sh -c 'echo lz4 > /sys/block/zram0/comp_algorithm'");
    }
}
