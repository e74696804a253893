//! [`ActuatorRegistry`] – resolves actuator resource ids to drivers.
//!
//! Explicitly registered [`OutputLine`]s take precedence. Ids of the form
//! `gpio<N>` that have no registered driver fall back to a [`SysfsGpio`]
//! under the configured sysfs root, so a manifest can name GPIO pins without
//! any further wiring.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::gpio::{SYSFS_GPIO_ROOT, SysfsGpio};
use crate::line::OutputLine;

/// Central actuator registry.
pub struct ActuatorRegistry {
    lines: HashMap<String, Arc<dyn OutputLine>>,
    gpio_root: Option<PathBuf>,
}

impl Default for ActuatorRegistry {
    fn default() -> Self {
        Self::with_gpio_root(SYSFS_GPIO_ROOT)
    }
}

impl ActuatorRegistry {
    /// Registry with sysfs GPIO fallback at the standard location.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with sysfs GPIO fallback under `root`.
    pub fn with_gpio_root(root: impl AsRef<Path>) -> Self {
        Self {
            lines: HashMap::new(),
            gpio_root: Some(root.as_ref().to_path_buf()),
        }
    }

    /// Registry that only knows explicitly registered lines.
    pub fn without_gpio() -> Self {
        Self {
            lines: HashMap::new(),
            gpio_root: None,
        }
    }

    /// Register a driver. Any previously registered driver with the same id
    /// is replaced.
    pub fn register(&mut self, line: Arc<dyn OutputLine>) {
        self.lines.insert(line.id().to_string(), line);
    }

    /// Resolve `id` to a driver, or `None` when nothing can serve it.
    pub fn resolve(&self, id: &str) -> Option<Arc<dyn OutputLine>> {
        if let Some(line) = self.lines.get(id) {
            return Some(line.clone());
        }
        let root = self.gpio_root.as_ref()?;
        let pin = SysfsGpio::parse_id(id)?;
        Some(Arc::new(SysfsGpio::new(root, pin)))
    }

    /// Ids of explicitly registered lines.
    pub fn registered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lines.keys().cloned().collect();
        ids.sort();
        ids
    }
}
