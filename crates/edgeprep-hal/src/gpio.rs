//! Sysfs GPIO driver.
//!
//! A pin exported through `/sys/class/gpio/export` appears as
//! `/sys/class/gpio/gpio<N>/` with a `value` attribute. The driver never
//! exports pins itself: a pin that is not exported is an absent resource,
//! which the safety guard skips with a warning. Pins driven through
//! `/dev/gpiomem` by another library are therefore invisible here.

use std::fs;
use std::path::{Path, PathBuf};

use crate::HalError;
use crate::line::OutputLine;

/// Default sysfs GPIO class directory.
pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// A single sysfs GPIO output.
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    id: String,
    dir: PathBuf,
}

impl SysfsGpio {
    /// Line for pin `pin` under `root` (normally [`SYSFS_GPIO_ROOT`]).
    pub fn new(root: impl AsRef<Path>, pin: u32) -> Self {
        let id = format!("gpio{pin}");
        Self {
            dir: root.as_ref().join(&id),
            id,
        }
    }

    /// Parse a `gpio<N>` resource id into its pin number.
    pub fn parse_id(id: &str) -> Option<u32> {
        id.strip_prefix("gpio")?.parse().ok()
    }

    fn value_path(&self) -> PathBuf {
        self.dir.join("value")
    }
}

impl OutputLine for SysfsGpio {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_present(&self) -> bool {
        self.value_path().is_file()
    }

    fn write_value(&self, value: &str) -> Result<(), HalError> {
        if !self.is_present() {
            return Err(HalError::Missing(self.id.clone()));
        }
        fs::write(self.value_path(), value).map_err(|source| HalError::Io {
            resource: self.id.clone(),
            source,
        })
    }

    fn read_value(&self) -> Result<String, HalError> {
        fs::read_to_string(self.value_path())
            .map(|v| v.trim().to_string())
            .map_err(|source| HalError::Io {
                resource: self.id.clone(),
                source,
            })
    }
}
