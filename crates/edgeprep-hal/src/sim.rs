//! In-process simulated output lines for tests.
//!
//! A [`SimLine`] records every value written to it and can be flipped
//! "absent" or "faulty" to exercise the safety guard's degraded paths
//! without any physical hardware.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::HalError;
use crate::line::OutputLine;

/// A simulated actuator line.
pub struct SimLine {
    id: String,
    value: Mutex<String>,
    writes: Mutex<Vec<String>>,
    present: AtomicBool,
    faulty: AtomicBool,
}

impl SimLine {
    /// Create a present, healthy line holding `initial`.
    pub fn new(id: impl Into<String>, initial: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: Mutex::new(initial.into()),
            writes: Mutex::new(Vec::new()),
            present: AtomicBool::new(true),
            faulty: AtomicBool::new(false),
        }
    }

    /// Mark the resource as released.
    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
    }

    /// Make every subsequent write fail.
    pub fn set_faulty(&self, faulty: bool) {
        self.faulty.store(faulty, Ordering::SeqCst);
    }

    /// Values written so far, oldest first.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Current value.
    pub fn value(&self) -> String {
        self.value.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl OutputLine for SimLine {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    fn write_value(&self, value: &str) -> Result<(), HalError> {
        if !self.is_present() {
            return Err(HalError::Missing(self.id.clone()));
        }
        if self.faulty.load(Ordering::SeqCst) {
            return Err(HalError::Rejected {
                resource: self.id.clone(),
                value: value.to_string(),
            });
        }
        if let Ok(mut v) = self.value.lock() {
            *v = value.to_string();
        }
        if let Ok(mut w) = self.writes.lock() {
            w.push(value.to_string());
        }
        Ok(())
    }

    fn read_value(&self) -> Result<String, HalError> {
        if !self.is_present() {
            return Err(HalError::Missing(self.id.clone()));
        }
        Ok(self.value())
    }
}
