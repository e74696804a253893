//! [`ConfigMutator`] – idempotent editor for the firmware boot configuration.
//!
//! Directives are written into one managed block at the end of `config.txt`.
//! Every other line setting a managed key (or one of its deprecated aliases)
//! is removed first, so each key appears exactly once after a mutation and
//! re-applying the same map leaves the file byte-identical. Lines for keys
//! this tool does not manage are never touched.
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeMap;
//! use edgeprep_provision::{ConfigMutator, DirectivePolicy};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let path = dir.path().join("config.txt");
//! std::fs::write(&path, "arm_freq=1500\nenable_uart=1\n").unwrap();
//!
//! let mut mutator = ConfigMutator::new(DirectivePolicy::standard(true));
//! let directives = BTreeMap::from([("arm_freq".to_string(), "1800".to_string())]);
//! let change = mutator.apply_directives(&path, &directives).unwrap();
//! assert!(change.reboot_required.contains("arm_freq"));
//!
//! let text = std::fs::read_to_string(&path).unwrap();
//! assert_eq!(text.matches("arm_freq=").count(), 1);
//! assert!(text.contains("enable_uart=1"));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use edgeprep_types::ProvisionError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::document::{BackupLedger, Document, append_block, strip_block};

mod policy;

pub use policy::{
    CAMERA_MIN_GPU_MEM_MB, CameraGpuMemRule, DirectivePolicy, DirectiveRule, ManagedKeyRule,
    NumericValueRule,
};

/// Default location of the firmware boot configuration.
pub const DEFAULT_BOOT_CONFIG: &str = "/boot/firmware/config.txt";

const BLOCK_BEGIN: &str = "# BEGIN edgeprep managed block";
const BLOCK_END: &str = "# END edgeprep managed block";

/// Keys this tool is allowed to set.
pub const MANAGED_KEYS: &[&str] = &[
    "arm_freq",
    "over_voltage",
    "core_freq",
    "gpu_mem",
    "temp_soft_limit",
    "force_turbo",
    "dtoverlay",
    "hdmi_blanking",
    "dtparam",
];

/// Keys the firmware re-reads without a reboot.
const RUNTIME_KEYS: &[&str] = &["hdmi_blanking"];

/// Deprecated or board-specific spellings of a managed key.
const ALIASES: &[(&str, &[&str])] = &[
    ("gpu_mem", &["gpu_mem_256", "gpu_mem_512", "gpu_mem_1024"]),
    ("core_freq", &["gpu_freq"]),
    ("over_voltage", &["over_voltage_delta"]),
];

/// Whether `key` only takes effect after a reboot.
pub fn is_boot_time(key: &str) -> bool {
    !RUNTIME_KEYS.contains(&key)
}

/// The canonical key a (possibly aliased) key sets.
fn canonical(key: &str) -> &str {
    ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&key))
        .map_or(key, |(canon, _)| canon)
}

/// Key set by a `key=value` line, ignoring comments and section filters.
fn line_key(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
        return None;
    }
    line.split_once('=').map(|(k, _)| k.trim())
}

fn line_value(line: &str) -> Option<&str> {
    line.split_once('=').map(|(_, v)| v.trim())
}

/// Result of one [`ConfigMutator::apply_directives`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootConfigChange {
    pub path: PathBuf,
    /// The directives now in force in the managed block.
    pub applied: BTreeMap<String, String>,
    /// Boot-time keys whose value changed; empty when nothing was written.
    pub reboot_required: BTreeSet<String>,
    pub written: bool,
    pub backup: Option<PathBuf>,
}

impl BootConfigChange {
    pub fn needs_reboot(&self) -> bool {
        !self.reboot_required.is_empty()
    }
}

/// Boot-config editor. Holds the backup ledger for the current run.
pub struct ConfigMutator {
    policy: DirectivePolicy,
    backups: BackupLedger,
}

impl ConfigMutator {
    pub fn new(policy: DirectivePolicy) -> Self {
        Self {
            policy,
            backups: BackupLedger::new(),
        }
    }

    /// Replace the managed block of `path` with `directives`.
    ///
    /// # Errors
    ///
    /// - [`ProvisionError::PolicyViolation`] if any directive is rejected;
    ///   the file is left untouched.
    /// - [`ProvisionError::ConfigWrite`] if the file is missing or cannot be
    ///   written.
    pub fn apply_directives(
        &mut self,
        path: &Path,
        directives: &BTreeMap<String, String>,
    ) -> Result<BootConfigChange, ProvisionError> {
        for (key, value) in directives {
            self.policy.verify(key, value)?;
        }

        let mut doc = Document::open(path)?;
        let previous: BTreeMap<String, String> = effective_values(doc.content())
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let (outside, _) = strip_block(doc.content(), BLOCK_BEGIN, BLOCK_END);

        let kept: Vec<&str> = outside
            .into_iter()
            .filter(|line| match line_key(line) {
                Some(key) => {
                    let overridden = directives.contains_key(canonical(key));
                    if overridden {
                        debug!(line = %line.trim(), "dropping superseded directive");
                    }
                    !overridden
                }
                None => true,
            })
            .collect();

        let mut body = vec!["[all]".to_string()];
        body.extend(directives.iter().map(|(k, v)| format!("{k}={}", v.trim())));
        let rendered = append_block(&kept, BLOCK_BEGIN, BLOCK_END, &body);

        let written = doc.commit(rendered, &mut self.backups)?;
        let reboot_required = if written {
            directives
                .iter()
                .filter(|(k, v)| is_boot_time(k) && previous.get(k.as_str()).map(String::as_str) != Some(v.trim()))
                .map(|(k, _)| k.clone())
                .collect()
        } else {
            BTreeSet::new()
        };

        info!(
            path = %path.display(),
            directives = directives.len(),
            written,
            reboot_required = reboot_required.len(),
            "boot config applied"
        );

        Ok(BootConfigChange {
            path: path.to_path_buf(),
            applied: directives.clone(),
            reboot_required,
            written,
            backup: self.backups.backup_of(path).cloned(),
        })
    }
}

/// Last value set for each canonical key anywhere in `content`.
fn effective_values(content: &str) -> BTreeMap<&str, &str> {
    let mut values = BTreeMap::new();
    for line in content.lines() {
        if let (Some(key), Some(value)) = (line_key(line), line_value(line)) {
            values.insert(canonical(key), value);
        }
    }
    values
}
