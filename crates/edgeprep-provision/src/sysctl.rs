//! [`SysctlTuner`] – kernel tunables in a dedicated `sysctl.d` file.
//!
//! The whole tunable set is rewritten on every call, so the file always
//! reflects exactly the last applied map. `/etc/sysctl.conf` and other
//! owners' drop-ins are never touched, and removing the file reverts the
//! persisted state.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use edgeprep_types::{HostRoot, ProvisionError};
use tracing::{info, warn};

use crate::document::write_atomic;

pub const DEFAULT_SYSCTL_FILE: &str = "/etc/sysctl.d/90-edgeprep.conf";

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('.')
        && !key.ends_with('.')
        && !key.contains("..")
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

pub struct SysctlTuner {
    root: HostRoot,
    file: PathBuf,
}

impl SysctlTuner {
    pub fn new(root: HostRoot, file: impl Into<PathBuf>) -> Self {
        Self {
            root,
            file: file.into(),
        }
    }

    pub fn file_path(&self) -> PathBuf {
        self.root.path(&self.file)
    }

    /// Persist `tunables` and apply them to the running kernel.
    ///
    /// Returns the keys applied live.
    ///
    /// # Errors
    ///
    /// - [`ProvisionError::PolicyViolation`] for a malformed key or value;
    ///   nothing is written.
    /// - [`ProvisionError::ConfigWrite`] if the file cannot be written.
    /// - [`ProvisionError::PartialApplication`] naming keys the kernel
    ///   rejected. The file still holds the full map.
    pub fn apply_tunables(
        &self,
        tunables: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, ProvisionError> {
        for (key, value) in tunables {
            if !valid_key(key) {
                return Err(ProvisionError::PolicyViolation {
                    key: key.clone(),
                    reason: "not a valid sysctl key".to_string(),
                });
            }
            if value.trim().is_empty() || value.contains('\n') {
                return Err(ProvisionError::PolicyViolation {
                    key: key.clone(),
                    reason: "value must be a single non-empty line".to_string(),
                });
            }
        }

        let mut content = String::from("# Managed by edgeprep. Rewritten on every run.\n");
        for (key, value) in tunables {
            content.push_str(&format!("{key} = {}\n", value.trim()));
        }
        let path = self.file_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| ProvisionError::config_write(dir, e))?;
        }
        write_atomic(&path, content.as_bytes()).map_err(|e| ProvisionError::config_write(&path, e))?;

        let mut applied = Vec::new();
        let mut failed = Vec::new();
        for (key, value) in tunables {
            let proc_path = self
                .root
                .path("/proc/sys")
                .join(key.replace('.', "/"));
            let result = if proc_path.is_file() {
                fs::write(&proc_path, value.trim()).map_err(|e| e.to_string())
            } else {
                Err("no such tunable".to_string())
            };
            match result {
                Ok(()) => applied.push(key.clone()),
                Err(reason) => {
                    warn!(key = %key, value = %value, %reason, "kernel rejected tunable");
                    failed.push(key.clone());
                }
            }
        }

        info!(
            file = %path.display(),
            applied = applied.len(),
            failed = failed.len(),
            "sysctl tunables written"
        );
        if !failed.is_empty() {
            return Err(ProvisionError::PartialApplication {
                operation: "apply sysctl tunables".to_string(),
                failed,
            });
        }
        Ok(applied)
    }

    /// Remove the dedicated file. Live values stay until the next boot or
    /// `sysctl --system`.
    pub fn revert(&self) -> Result<bool, ProvisionError> {
        let path = self.file_path();
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|e| ProvisionError::io(&path, e))?;
        info!(file = %path.display(), "sysctl tunables reverted");
        Ok(true)
    }
}
