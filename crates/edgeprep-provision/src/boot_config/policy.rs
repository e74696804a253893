//! [`DirectivePolicy`] – validation rules for boot-config directives.
//!
//! Every directive passes through [`DirectivePolicy::verify`] before the
//! document is touched. Rules are evaluated in insertion order; the first
//! violation returns [`ProvisionError::PolicyViolation`] and nothing is
//! written.

use edgeprep_types::ProvisionError;

use super::MANAGED_KEYS;

/// Minimum `gpu_mem` (MB) that still allows camera capture.
pub const CAMERA_MIN_GPU_MEM_MB: i64 = 128;

/// Keys whose value must be an integer.
const NUMERIC_KEYS: &[&str] = &[
    "arm_freq",
    "over_voltage",
    "core_freq",
    "gpu_mem",
    "temp_soft_limit",
    "force_turbo",
    "hdmi_blanking",
];

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single constraint on a `key=value` directive.
pub trait DirectiveRule: Send + Sync {
    /// Name used in log output.
    fn name(&self) -> &str;

    fn check(&self, key: &str, value: &str) -> Result<(), ProvisionError>;
}

fn violation(key: &str, reason: impl Into<String>) -> ProvisionError {
    ProvisionError::PolicyViolation {
        key: key.to_string(),
        reason: reason.into(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// DirectivePolicy
// ────────────────────────────────────────────────────────────────────────────

/// Rule engine for boot-config directives.
///
/// # Example
///
/// ```
/// use edgeprep_provision::DirectivePolicy;
///
/// let policy = DirectivePolicy::standard(true);
/// assert!(policy.verify("gpu_mem", "128").is_ok());
/// assert!(policy.verify("gpu_mem", "64").is_err());
/// assert!(policy.verify("start_x", "1").is_err());
/// ```
#[derive(Default)]
pub struct DirectivePolicy {
    rules: Vec<Box<dyn DirectiveRule>>,
}

impl DirectivePolicy {
    /// A policy with no rules; accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Managed-key, numeric and (when `camera_attached`) camera rules.
    pub fn standard(camera_attached: bool) -> Self {
        let mut policy = Self::new();
        policy.add_rule(Box::new(ManagedKeyRule));
        policy.add_rule(Box::new(NumericValueRule));
        if camera_attached {
            policy.add_rule(Box::new(CameraGpuMemRule {
                min_mb: CAMERA_MIN_GPU_MEM_MB,
            }));
        }
        policy
    }

    pub fn add_rule(&mut self, rule: Box<dyn DirectiveRule>) {
        self.rules.push(rule);
    }

    pub fn verify(&self, key: &str, value: &str) -> Result<(), ProvisionError> {
        for rule in &self.rules {
            rule.check(key, value)?;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Rejects keys outside the managed set.
pub struct ManagedKeyRule;

impl DirectiveRule for ManagedKeyRule {
    fn name(&self) -> &str {
        "managed_key"
    }

    fn check(&self, key: &str, value: &str) -> Result<(), ProvisionError> {
        if !MANAGED_KEYS.contains(&key) {
            return Err(violation(key, "not a managed boot-config key"));
        }
        if value.trim().is_empty() || value.contains('\n') {
            return Err(violation(key, "value must be a single non-empty line"));
        }
        Ok(())
    }
}

/// Rejects non-integer values for numeric keys.
pub struct NumericValueRule;

impl DirectiveRule for NumericValueRule {
    fn name(&self) -> &str {
        "numeric_value"
    }

    fn check(&self, key: &str, value: &str) -> Result<(), ProvisionError> {
        if NUMERIC_KEYS.contains(&key) && value.trim().parse::<i64>().is_err() {
            return Err(violation(key, format!("'{value}' is not an integer")));
        }
        Ok(())
    }
}

/// Keeps `gpu_mem` at or above what camera capture needs.
pub struct CameraGpuMemRule {
    pub min_mb: i64,
}

impl DirectiveRule for CameraGpuMemRule {
    fn name(&self) -> &str {
        "camera_gpu_mem"
    }

    fn check(&self, key: &str, value: &str) -> Result<(), ProvisionError> {
        if key != "gpu_mem" {
            return Ok(());
        }
        match value.trim().parse::<i64>() {
            Ok(mb) if mb >= self.min_mb => Ok(()),
            Ok(mb) => Err(violation(
                key,
                format!("{mb} MB is below the camera minimum of {} MB", self.min_mb),
            )),
            Err(_) => Err(violation(key, format!("'{value}' is not an integer"))),
        }
    }
}
