//! The `edgeprep run` pipeline.
//!
//! Leaf components run first, each independently: a failure in one is
//! recorded and the next is still attempted. Service bring-up follows once
//! every leaf has reported, and the whole run folds into a [`RunSummary`].

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use edgeprep_orchestrator::{ServiceLifecycleOrchestrator, ServiceManifest};
use edgeprep_provision::boot_unit::DEFAULT_UNIT_DIR;
use edgeprep_provision::sysctl::DEFAULT_SYSCTL_FILE;
use edgeprep_provision::tmpfs::DEFAULT_RESERVE_FRACTION;
use edgeprep_provision::{
    BootUnitWriter, CommandRunner, ConfigMutator, DirectivePolicy, GovernorController,
    SwapManager, SwapPolicy, SysctlTuner, TmpfsProvisioner,
};
use edgeprep_types::HostRoot;
use tracing::{error, info, info_span, warn};

use crate::plan::ProvisionPlan;
use crate::summary::{LeafResults, OverlayOutcome, RunSummary, StepOutcome};

pub const DEFAULT_STATE_DIR: &str = "/var/lib/edgeprep";

/// Where and how the leaf components touch the host.
#[derive(Clone)]
pub struct HostContext {
    pub root: HostRoot,
    /// Host path for edgeprep's own state (swap marker).
    pub state_dir: PathBuf,
    /// Host path boot units are written to.
    pub unit_dir: PathBuf,
    pub sysctl_file: PathBuf,
    pub swap_policy: SwapPolicy,
    pub tmpfs_reserve_fraction: f64,
    pub runner: Arc<dyn CommandRunner>,
}

impl HostContext {
    pub fn new(root: HostRoot, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            root,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            unit_dir: PathBuf::from(DEFAULT_UNIT_DIR),
            sysctl_file: PathBuf::from(DEFAULT_SYSCTL_FILE),
            swap_policy: SwapPolicy::default(),
            tmpfs_reserve_fraction: DEFAULT_RESERVE_FRACTION,
            runner,
        }
    }

    pub fn boot_units(&self) -> BootUnitWriter {
        BootUnitWriter::new(self.root.clone(), self.unit_dir.clone(), self.runner.clone())
    }

    pub fn swap_manager(&self) -> SwapManager {
        SwapManager::new(
            self.root.clone(),
            self.state_dir.clone(),
            self.swap_policy.clone(),
            self.runner.clone(),
            self.boot_units(),
        )
    }

    pub fn governor(&self) -> GovernorController {
        GovernorController::new(self.root.clone(), self.boot_units())
    }

    pub fn tmpfs(&self) -> TmpfsProvisioner {
        TmpfsProvisioner::new(self.root.clone(), self.runner.clone(), self.tmpfs_reserve_fraction)
    }

    pub fn sysctl(&self) -> SysctlTuner {
        SysctlTuner::new(self.root.clone(), self.sysctl_file.clone())
    }
}

/// Run every leaf step the plan asks for. Never stops early.
pub fn run_leaves(plan: &ProvisionPlan, ctx: &HostContext) -> LeafResults {
    let mut results = LeafResults::default();

    if let Some(boot) = &plan.boot_config {
        let _span = info_span!("boot_config").entered();
        let mut mutator = ConfigMutator::new(DirectivePolicy::standard(boot.camera_attached));
        results.boot_config = StepOutcome::from_result(
            mutator.apply_directives(&ctx.root.path(&boot.path), &boot.directives),
        );
    }

    if let Some(swap) = &plan.swap {
        let _span = info_span!("swap").entered();
        results.swap = StepOutcome::from_result(ctx.swap_manager().provision(
            swap.size_bytes(),
            swap.algorithm,
            swap.priority,
        ));
    }

    if let Some(mode) = plan.governor {
        let _span = info_span!("governor").entered();
        results.governor = StepOutcome::from_result(ctx.governor().set_governor(mode));
    }

    if !plan.overlays.is_empty() {
        let _span = info_span!("overlays").entered();
        let mut tmpfs = ctx.tmpfs();
        for overlay in &plan.overlays {
            results.overlays.push(OverlayOutcome {
                path: overlay.path.display().to_string(),
                outcome: StepOutcome::from_result(
                    tmpfs.mount_overlay(&overlay.path, overlay.mount().size_limit),
                ),
            });
        }
    }

    if !plan.sysctl.is_empty() {
        let _span = info_span!("sysctl").entered();
        results.sysctl = StepOutcome::from_result(ctx.sysctl().apply_tunables(&plan.sysctl));
    }

    for failure in results.errors() {
        warn!(component = %failure.component, error = %failure.error, "provisioning step failed");
    }
    results
}

/// Provision the host, then bring up the services of `manifest`.
pub async fn run(
    plan: &ProvisionPlan,
    manifest: &ServiceManifest,
    ctx: &HostContext,
    orchestrator: &mut ServiceLifecycleOrchestrator,
) -> RunSummary {
    let started_at = Utc::now();
    info!(root = %ctx.root.as_path().display(), "provisioning run started");

    let leaf_plan = plan.clone();
    let leaf_ctx = ctx.clone();
    let leaves = match tokio::task::spawn_blocking(move || run_leaves(&leaf_plan, &leaf_ctx)).await {
        Ok(leaves) => leaves,
        Err(e) => {
            error!(error = %e, "provisioning task aborted");
            LeafResults::default()
        }
    };

    let services = orchestrator.bootstrap(manifest).await;
    let summary = RunSummary::new(started_at, leaves, services);
    info!(
        exit_code = summary.exit_code,
        errors = summary.errors.len(),
        reboot_required = summary.reboot_required,
        "provisioning run finished"
    );
    summary
}
