//! `/proc/meminfo` snapshot.

use std::fs;

use edgeprep_types::{HostRoot, ProvisionError};
use serde::{Deserialize, Serialize};

const MEMINFO: &str = "/proc/meminfo";

/// Physical memory as reported by the kernel at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl MemoryInfo {
    pub fn read(root: &HostRoot) -> Result<Self, ProvisionError> {
        let path = root.path(MEMINFO);
        let raw = fs::read_to_string(&path).map_err(|e| ProvisionError::io(&path, e))?;
        Self::parse(&raw).ok_or_else(|| ProvisionError::Io {
            path,
            details: "MemTotal/MemAvailable not found".to_string(),
        })
    }

    /// Parse the `MemTotal` and `MemAvailable` lines (values in kB).
    pub fn parse(raw: &str) -> Option<Self> {
        let mut total = None;
        let mut available = None;
        for line in raw.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(kb) = value.parse::<u64>() else {
                continue;
            };
            match key {
                "MemTotal:" => total = Some(kb * 1024),
                "MemAvailable:" => available = Some(kb * 1024),
                _ => {}
            }
        }
        Some(Self {
            total_bytes: total?,
            available_bytes: available?,
        })
    }

    /// Memory already in use by the running system.
    pub fn committed(&self) -> u64 {
        self.total_bytes.saturating_sub(self.available_bytes)
    }
}
