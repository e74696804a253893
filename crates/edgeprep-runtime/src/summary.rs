//! [`RunSummary`] – the structured result of one `edgeprep run`.
//!
//! The summary is always produced, whatever failed. It is what the binary
//! prints on stdout and what the process exit code is derived from.

use chrono::{DateTime, Utc};
use edgeprep_orchestrator::BootstrapReport;
use edgeprep_provision::{BootConfigChange, SwapReport};
use edgeprep_types::{OverlayMount, ProvisionError, UnitState, exit_code};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not requested by the plan.
    Skipped,
    Ok,
    Failed,
}

/// Outcome of one leaf step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome<T> {
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProvisionError>,
}

impl<T> StepOutcome<T> {
    pub fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            value: None,
            error: None,
        }
    }

    pub fn from_result(result: Result<T, ProvisionError>) -> Self {
        match result {
            Ok(value) => Self {
                status: StepStatus::Ok,
                value: Some(value),
                error: None,
            },
            Err(error) => Self {
                status: StepStatus::Failed,
                value: None,
                error: Some(error),
            },
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

impl<T> Default for StepOutcome<T> {
    fn default() -> Self {
        Self::skipped()
    }
}

/// An error attributed to the component that raised it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentError {
    pub component: String,
    pub error: ProvisionError,
}

/// Mount outcome for one planned overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayOutcome {
    pub path: String,
    #[serde(flatten)]
    pub outcome: StepOutcome<OverlayMount>,
}

/// Results of the leaf components, in run order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeafResults {
    pub boot_config: StepOutcome<BootConfigChange>,
    pub swap: StepOutcome<SwapReport>,
    /// Cores now running the requested governor.
    pub governor: StepOutcome<Vec<u32>>,
    pub overlays: Vec<OverlayOutcome>,
    /// Tunables applied live.
    pub sysctl: StepOutcome<Vec<String>>,
}

impl LeafResults {
    /// Leaf errors in run order.
    pub fn errors(&self) -> Vec<ComponentError> {
        let mut errors = Vec::new();
        let mut push = |component: String, error: &Option<ProvisionError>| {
            if let Some(error) = error {
                errors.push(ComponentError {
                    component,
                    error: error.clone(),
                });
            }
        };
        push("boot_config".into(), &self.boot_config.error);
        push("swap".into(), &self.swap.error);
        push("governor".into(), &self.governor.error);
        for overlay in &self.overlays {
            push(format!("overlay {}", overlay.path), &overlay.outcome.error);
        }
        push("sysctl".into(), &self.sysctl.error);
        errors
    }

    pub fn reboot_required(&self) -> bool {
        self.boot_config
            .value
            .as_ref()
            .is_some_and(BootConfigChange::needs_reboot)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub leaves: LeafResults,
    pub services: BootstrapReport,
    pub reboot_required: bool,
    /// Every error of the run, leaves first, then service bring-up.
    pub errors: Vec<ComponentError>,
    pub exit_code: i32,
}

impl RunSummary {
    pub fn new(
        started_at: DateTime<Utc>,
        leaves: LeafResults,
        services: BootstrapReport,
    ) -> Self {
        let mut errors = leaves.errors();
        for failure in &services.failures {
            errors.push(ComponentError {
                component: "services".to_string(),
                error: failure.clone(),
            });
        }
        if let Some(fatal) = &services.fatal
            && !services.failures.contains(fatal)
        {
            errors.push(ComponentError {
                component: "services".to_string(),
                error: fatal.clone(),
            });
        }
        let exit_code = exit_code_for(&errors);
        Self {
            started_at,
            finished_at: Utc::now(),
            reboot_required: leaves.reboot_required(),
            leaves,
            services,
            errors,
            exit_code,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == exit_code::SUCCESS
    }

    /// Unit names grouped by terminal state.
    pub fn units_in(&self, state: UnitState) -> Vec<&str> {
        self.services.units_in(state)
    }
}

/// `FatalStartup` wins; otherwise the first error in run order.
pub fn exit_code_for(errors: &[ComponentError]) -> i32 {
    if errors
        .iter()
        .any(|e| matches!(e.error, ProvisionError::FatalStartup { .. }))
    {
        return exit_code::FATAL_STARTUP;
    }
    errors
        .first()
        .map(|e| e.error.exit_code())
        .unwrap_or(exit_code::SUCCESS)
}
