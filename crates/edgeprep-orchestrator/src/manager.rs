//! The service-manager seam.
//!
//! The orchestrator never talks to systemd directly; it goes through a
//! [`ServiceManager`]. [`SystemdManager`] is the production implementation,
//! [`ScriptedManager`][crate::scripted::ScriptedManager] the one used by
//! tests.

use std::path::PathBuf;

use async_trait::async_trait;
use edgeprep_types::{HostRoot, ProvisionError, ServiceUnit};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::unit_file::systemd_name;

/// Result of one readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Readiness {
    Ready,
    NotReady,
    /// The unit exited while starting.
    Failed,
}

/// Installs, starts and observes service units.
///
/// # Contract
///
/// * `start` only requests the start; readiness is observed through
///   repeated `probe` calls.
/// * `stop` must be safe to call on a unit that is not running.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Place the rendered unit where the manager will find it.
    async fn install(&self, unit: &ServiceUnit, rendered: &str) -> Result<(), ProvisionError>;

    /// Register the unit for automatic start at boot.
    async fn enable(&self, name: &str) -> Result<(), ProvisionError>;

    async fn start(&self, name: &str) -> Result<(), ProvisionError>;

    async fn probe(&self, name: &str) -> Result<Readiness, ProvisionError>;

    async fn stop(&self, name: &str) -> Result<(), ProvisionError>;
}

// ────────────────────────────────────────────────────────────────────────────
// systemd
// ────────────────────────────────────────────────────────────────────────────

/// Drives units through `systemctl`.
///
/// With a non-system [`HostRoot`] only `install` and `enable` are supported
/// (the latter via `systemctl --root`); there is no running manager to start
/// anything in a staged image.
pub struct SystemdManager {
    root: HostRoot,
    unit_dir: PathBuf,
}

impl SystemdManager {
    pub fn new(root: HostRoot, unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            root,
            unit_dir: unit_dir.into(),
        }
    }

    /// Path of the rendered unit for `name`.
    pub fn unit_path(&self, name: &str) -> PathBuf {
        self.root.path(self.unit_dir.join(systemd_name(name)))
    }

    async fn systemctl(&self, args: &[&str]) -> Result<(bool, String), ProvisionError> {
        let mut cmd = Command::new("systemctl");
        if !self.root.is_system() {
            cmd.arg(format!("--root={}", self.root.as_path().display()));
        }
        cmd.args(args);
        let line = format!("systemctl {}", args.join(" "));
        debug!(command = %line, "running systemctl");
        let output = cmd.output().await.map_err(|e| ProvisionError::HostCommand {
            command: line.clone(),
            details: e.to_string(),
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            Ok((true, stdout))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Ok((false, if stderr.is_empty() { stdout } else { stderr }))
        }
    }

    async fn checked(&self, args: &[&str]) -> Result<(), ProvisionError> {
        match self.systemctl(args).await? {
            (true, _) => Ok(()),
            (false, details) => Err(ProvisionError::HostCommand {
                command: format!("systemctl {}", args.join(" ")),
                details,
            }),
        }
    }

    fn require_live(&self, verb: &str) -> Result<(), ProvisionError> {
        if self.root.is_system() {
            Ok(())
        } else {
            Err(ProvisionError::HostCommand {
                command: format!("systemctl {verb}"),
                details: format!("no service manager running in {}", self.root.as_path().display()),
            })
        }
    }
}

#[async_trait]
impl ServiceManager for SystemdManager {
    async fn install(&self, unit: &ServiceUnit, rendered: &str) -> Result<(), ProvisionError> {
        let path = self.unit_path(&unit.name);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ProvisionError::config_write(dir, e))?;
        }
        tokio::fs::write(&path, rendered)
            .await
            .map_err(|e| ProvisionError::config_write(&path, e))?;
        if self.root.is_system() {
            self.checked(&["daemon-reload"]).await?;
        }
        Ok(())
    }

    async fn enable(&self, name: &str) -> Result<(), ProvisionError> {
        self.checked(&["enable", &systemd_name(name)]).await
    }

    async fn start(&self, name: &str) -> Result<(), ProvisionError> {
        self.require_live("start")?;
        self.checked(&["start", "--no-block", &systemd_name(name)]).await
    }

    async fn probe(&self, name: &str) -> Result<Readiness, ProvisionError> {
        self.require_live("show")?;
        let unit = systemd_name(name);
        let (ok, output) = self.systemctl(&["show", "--property=ActiveState,Job", &unit]).await?;
        if !ok {
            return Err(ProvisionError::HostCommand {
                command: format!("systemctl show {unit}"),
                details: output,
            });
        }
        Ok(readiness_from_show(&output))
    }

    async fn stop(&self, name: &str) -> Result<(), ProvisionError> {
        self.require_live("stop")?;
        self.checked(&["stop", &systemd_name(name)]).await
    }
}

/// Map `systemctl show --property=ActiveState,Job` output to a readiness.
///
/// `inactive` only means the unit gave up when no start job is queued for it;
/// right after `start --no-block` the job is usually still waiting.
fn readiness_from_show(output: &str) -> Readiness {
    let mut active_state = "";
    let mut job_pending = false;
    for line in output.lines() {
        match line.split_once('=') {
            Some(("ActiveState", value)) => active_state = value.trim(),
            Some(("Job", value)) => {
                let value = value.trim();
                job_pending = !value.is_empty() && value != "0";
            }
            _ => {}
        }
    }
    match active_state {
        "active" => Readiness::Ready,
        "failed" => Readiness::Failed,
        "inactive" if !job_pending => Readiness::Failed,
        _ => Readiness::NotReady,
    }
}
