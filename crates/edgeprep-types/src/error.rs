use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Process exit codes, one per error kind.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const CONFIG_FILE: i32 = 2;
    pub const CONFIG_WRITE: i32 = 10;
    pub const INSUFFICIENT_MEMORY: i32 = 11;
    pub const PARTIAL_APPLICATION: i32 = 12;
    pub const DEVICE_BUSY: i32 = 13;
    pub const PROBE_TIMEOUT: i32 = 14;
    pub const FATAL_STARTUP: i32 = 15;
    pub const POLICY_VIOLATION: i32 = 16;
    pub const INVALID_MANIFEST: i32 = 17;
    pub const HOST: i32 = 18;
}

/// Error taxonomy shared by every provisioning component and the
/// orchestrator.
///
/// Variants carry plain data (no boxed sources) so they can be embedded in
/// the JSON run summary.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProvisionError {
    #[error("Cannot write {}: {reason}", path.display())]
    ConfigWrite { path: PathBuf, reason: String },

    #[error("Insufficient memory: requested {requested} bytes, limit {limit} bytes ({detail})")]
    InsufficientMemory {
        requested: u64,
        limit: u64,
        detail: String,
    },

    #[error("{operation} partially applied; failed targets: {}", failed.join(", "))]
    PartialApplication {
        operation: String,
        failed: Vec<String>,
    },

    #[error("Device {device} still busy after {attempts} attempt(s)")]
    DeviceBusy { device: String, attempts: u32 },

    #[error("Unit {unit} not ready after {waited_ms} ms")]
    ProbeTimeout { unit: String, waited_ms: u64 },

    #[error("Fatal startup failure in {unit}: {reason}")]
    FatalStartup { unit: String, reason: String },

    #[error("Policy violation on {key}: {reason}")]
    PolicyViolation { key: String, reason: String },

    #[error("Invalid service manifest: {reason}")]
    InvalidManifest { reason: String },

    #[error("Host command `{command}` failed: {details}")]
    HostCommand { command: String, details: String },

    #[error("I/O error on {}: {details}", path.display())]
    Io { path: PathBuf, details: String },
}

impl ProvisionError {
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        ProvisionError::Io {
            path: path.into(),
            details: err.to_string(),
        }
    }

    pub fn config_write(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        ProvisionError::ConfigWrite {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Stable identifier used in the run summary.
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::ConfigWrite { .. } => "config_write",
            ProvisionError::InsufficientMemory { .. } => "insufficient_memory",
            ProvisionError::PartialApplication { .. } => "partial_application",
            ProvisionError::DeviceBusy { .. } => "device_busy",
            ProvisionError::ProbeTimeout { .. } => "probe_timeout",
            ProvisionError::FatalStartup { .. } => "fatal_startup",
            ProvisionError::PolicyViolation { .. } => "policy_violation",
            ProvisionError::InvalidManifest { .. } => "invalid_manifest",
            ProvisionError::HostCommand { .. } => "host_command",
            ProvisionError::Io { .. } => "io",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionError::ConfigWrite { .. } => exit_code::CONFIG_WRITE,
            ProvisionError::InsufficientMemory { .. } => exit_code::INSUFFICIENT_MEMORY,
            ProvisionError::PartialApplication { .. } => exit_code::PARTIAL_APPLICATION,
            ProvisionError::DeviceBusy { .. } => exit_code::DEVICE_BUSY,
            ProvisionError::ProbeTimeout { .. } => exit_code::PROBE_TIMEOUT,
            ProvisionError::FatalStartup { .. } => exit_code::FATAL_STARTUP,
            ProvisionError::PolicyViolation { .. } => exit_code::POLICY_VIOLATION,
            ProvisionError::InvalidManifest { .. } => exit_code::INVALID_MANIFEST,
            ProvisionError::HostCommand { .. } | ProvisionError::Io { .. } => exit_code::HOST,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_application_display_names_targets() {
        let err = ProvisionError::PartialApplication {
            operation: "set_governor".to_string(),
            failed: vec!["2".to_string(), "3".to_string()],
        };
        assert!(err.to_string().contains("failed targets: 2, 3"));
        assert_eq!(err.exit_code(), exit_code::PARTIAL_APPLICATION);
    }

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        let errors = [
            ProvisionError::config_write("/boot/config.txt", "read-only"),
            ProvisionError::InsufficientMemory {
                requested: 1,
                limit: 0,
                detail: String::new(),
            },
            ProvisionError::PartialApplication {
                operation: String::new(),
                failed: vec![],
            },
            ProvisionError::DeviceBusy {
                device: "zram0".into(),
                attempts: 5,
            },
            ProvisionError::ProbeTimeout {
                unit: "a".into(),
                waited_ms: 10,
            },
            ProvisionError::FatalStartup {
                unit: "a".into(),
                reason: String::new(),
            },
            ProvisionError::PolicyViolation {
                key: "gpu_mem".into(),
                reason: String::new(),
            },
            ProvisionError::InvalidManifest {
                reason: String::new(),
            },
        ];
        let mut codes: Vec<i32> = errors.iter().map(ProvisionError::exit_code).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|c| *c != exit_code::SUCCESS));
    }

    #[test]
    fn error_serialises_with_kind_tag() {
        let err = ProvisionError::DeviceBusy {
            device: "zram0".into(),
            attempts: 3,
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "device_busy");
        assert_eq!(json["attempts"], 3);
    }
}
