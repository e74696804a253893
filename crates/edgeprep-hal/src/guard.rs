//! [`HardwareSafetyGuard`] – forces actuators to their quiescent value.
//!
//! The guard runs on the teardown path, possibly while the host is out of
//! memory or a unit has just crashed. It therefore:
//!
//! - never returns an error, only an informational [`QuiesceReport`];
//! - skips actions whose resource is missing and carries on with the rest;
//! - executes the batch on a worker thread and waits at most its configured
//!   bound, so a wedged driver cannot stall shutdown.
//!
//! Quiescing is idempotent: writing the safe value twice is harmless.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use edgeprep_hal::{ActuatorRegistry, HardwareSafetyGuard, SimLine};
//! use edgeprep_types::CleanupAction;
//!
//! let buzzer = Arc::new(SimLine::new("buzzer", "1"));
//! let mut registry = ActuatorRegistry::without_gpio();
//! registry.register(buzzer.clone());
//!
//! let guard = HardwareSafetyGuard::new(Arc::new(registry), Duration::from_millis(500));
//! let report = guard.quiesce(&[CleanupAction::new("buzzer", "0")]);
//! assert_eq!(report.applied, vec!["buzzer"]);
//! assert_eq!(buzzer.value(), "0");
//! ```

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use edgeprep_types::CleanupAction;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::registry::ActuatorRegistry;

/// Default upper bound on a quiesce batch.
pub const DEFAULT_QUIESCE_TIMEOUT: Duration = Duration::from_millis(500);

/// Outcome of one [`HardwareSafetyGuard::quiesce`] batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuiesceReport {
    /// Resources driven to their quiescent value.
    pub applied: Vec<String>,
    /// Resources that were absent or unknown.
    pub skipped: Vec<String>,
    /// Resources whose write failed (logged, not propagated).
    pub failed: Vec<String>,
    /// The batch did not finish within the bound.
    pub timed_out: bool,
}

impl QuiesceReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.timed_out
    }
}

enum Outcome {
    Applied(String),
    Skipped(String),
    Failed(String),
}

/// Drives actuator resources to a safe state on unit termination.
#[derive(Clone)]
pub struct HardwareSafetyGuard {
    registry: Arc<ActuatorRegistry>,
    timeout: Duration,
}

impl HardwareSafetyGuard {
    pub fn new(registry: Arc<ActuatorRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Apply every action in `actions`. Never fails.
    pub fn quiesce(&self, actions: &[CleanupAction]) -> QuiesceReport {
        if actions.is_empty() {
            return QuiesceReport::default();
        }

        let (tx, rx) = mpsc::channel();
        let registry = self.registry.clone();
        let batch = actions.to_vec();

        let spawned = thread::Builder::new()
            .name("quiesce".to_string())
            .spawn(move || {
                for action in &batch {
                    // Receiver gone means the caller gave up waiting.
                    if tx.send(apply(&registry, action)).is_err() {
                        return;
                    }
                }
            });

        if let Err(e) = spawned {
            // Cannot get a worker (likely memory pressure): run inline rather
            // than leave actuators energised.
            warn!(error = %e, "quiesce worker spawn failed; running inline");
            let mut report = QuiesceReport::default();
            for action in actions {
                record(&mut report, apply(&self.registry, action));
            }
            log_report(&report);
            return report;
        }

        let deadline = Instant::now() + self.timeout;
        let mut report = QuiesceReport::default();
        let mut received = 0;
        while received < actions.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(outcome) => {
                    record(&mut report, outcome);
                    received += 1;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    report.timed_out = true;
                    error!(
                        timeout_ms = self.timeout.as_millis() as u64,
                        pending = actions.len() - received,
                        "quiesce batch exceeded its bound"
                    );
                    break;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    // Worker panicked inside a driver.
                    error!(pending = actions.len() - received, "quiesce worker aborted");
                    for action in &actions[received..] {
                        report.failed.push(action.target_resource_id.clone());
                    }
                    break;
                }
            }
        }

        log_report(&report);
        report
    }
}

fn apply(registry: &ActuatorRegistry, action: &CleanupAction) -> Outcome {
    let id = &action.target_resource_id;
    let Some(line) = registry.resolve(id) else {
        warn!(resource = %id, "no driver for resource; skipping");
        return Outcome::Skipped(id.clone());
    };
    if !line.is_present() {
        // A pin driven through /dev/gpiomem instead of sysfs also lands here.
        warn!(resource = %id, "resource not present (released or never exported); skipping");
        return Outcome::Skipped(id.clone());
    }
    match line.write_value(&action.quiescent_value) {
        Ok(()) => {
            debug!(resource = %id, value = %action.quiescent_value, "resource quiesced");
            Outcome::Applied(id.clone())
        }
        Err(e) => {
            error!(resource = %id, error = %e, "failed to quiesce resource");
            Outcome::Failed(id.clone())
        }
    }
}

fn record(report: &mut QuiesceReport, outcome: Outcome) {
    match outcome {
        Outcome::Applied(id) => report.applied.push(id),
        Outcome::Skipped(id) => report.skipped.push(id),
        Outcome::Failed(id) => report.failed.push(id),
    }
}

fn log_report(report: &QuiesceReport) {
    info!(
        applied = report.applied.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        timed_out = report.timed_out,
        "quiesce complete"
    );
}
