//! [`ServiceLifecycleOrchestrator`] – ranked, readiness-gated bring-up.
//!
//! Units are installed and enabled, then started strictly one at a time in
//! ascending rank. After each start the orchestrator polls the unit's
//! readiness until it is `Running` or its bound elapses; the bound is the
//! unit's ready timeout, clipped to what is left of the overall deadline.
//!
//! Any termination of a unit that drives actuators (timeout, failed start,
//! shutdown, crash, OOM kill) runs its cleanup actions through the
//! [`HardwareSafetyGuard`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use edgeprep_hal::{ActuatorRegistry, HardwareSafetyGuard};
//! use edgeprep_orchestrator::{ScriptedManager, ServiceLifecycleOrchestrator, ServiceManifest};
//! use edgeprep_types::{ServiceUnit, UnitState};
//!
//! # tokio_test_runtime(async {
//! let guard = HardwareSafetyGuard::new(
//!     Arc::new(ActuatorRegistry::without_gpio()),
//!     std::time::Duration::from_millis(500),
//! );
//! let mut orchestrator = ServiceLifecycleOrchestrator::new(
//!     Arc::new(ScriptedManager::new()),
//!     Arc::new(guard),
//!     "/usr/bin/edgeprep",
//! );
//! let manifest = ServiceManifest::new(vec![ServiceUnit::new("gps", "/opt/firmware/gps", 1)]);
//! let report = orchestrator.bootstrap(&manifest).await;
//! assert_eq!(report.state("gps"), Some(UnitState::Running));
//! # });
//! # fn tokio_test_runtime(f: impl std::future::Future<Output = ()>) {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use edgeprep_hal::{HardwareSafetyGuard, QuiesceReport};
use edgeprep_types::{Criticality, ProvisionError, ServiceUnit, TerminationCause, UnitState};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tracing::{error, info, warn};

use crate::manager::{Readiness, ServiceManager};
use crate::manifest::ServiceManifest;
use crate::state::{UnitRecord, UnitTable};
use crate::unit_file::render_unit;

/// Interval between readiness probes.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(100);

// ────────────────────────────────────────────────────────────────────────────
// Reports
// ────────────────────────────────────────────────────────────────────────────

/// Final view of one unit after a bring-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub name: String,
    pub state: UnitState,
    pub criticality: Criticality,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Cleanup run for this unit during the bring-up, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiesce: Option<QuiesceReport>,
}

/// Result of [`ServiceLifecycleOrchestrator::bootstrap`]. Always produced,
/// even when the bring-up aborts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapReport {
    pub units: Vec<UnitOutcome>,
    /// Recorded unit failures, in the order they happened.
    pub failures: Vec<ProvisionError>,
    /// Set when the bring-up was aborted.
    pub fatal: Option<ProvisionError>,
    pub deadline_expired: bool,
}

impl BootstrapReport {
    pub fn state(&self, name: &str) -> Option<UnitState> {
        self.units.iter().find(|u| u.name == name).map(|u| u.state)
    }

    /// Names of units that ended in `state`.
    pub fn units_in(&self, state: UnitState) -> Vec<&str> {
        self.units
            .iter()
            .filter(|u| u.state == state)
            .map(|u| u.name.as_str())
            .collect()
    }

    /// The abort error if any, otherwise the first recorded failure.
    pub fn result(&self) -> Result<(), ProvisionError> {
        match (&self.fatal, self.failures.first()) {
            (Some(fatal), _) => Err(fatal.clone()),
            (None, Some(first)) => Err(first.clone()),
            (None, None) => Ok(()),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ────────────────────────────────────────────────────────────────────────────

enum StartOutcome {
    Running,
    Failed(ProvisionError),
    /// The overall deadline ran out while waiting.
    DeadlineExpired(ProvisionError),
}

pub struct ServiceLifecycleOrchestrator {
    manager: Arc<dyn ServiceManager>,
    guard: Arc<HardwareSafetyGuard>,
    quiesce_bin: PathBuf,
    probe_interval: Duration,
    table: UnitTable,
    quiesced: Vec<(String, QuiesceReport)>,
}

impl ServiceLifecycleOrchestrator {
    /// `quiesce_bin` is the `edgeprep` binary referenced from rendered
    /// units' `ExecStopPost=`.
    pub fn new(
        manager: Arc<dyn ServiceManager>,
        guard: Arc<HardwareSafetyGuard>,
        quiesce_bin: impl Into<PathBuf>,
    ) -> Self {
        Self {
            manager,
            guard,
            quiesce_bin: quiesce_bin.into(),
            probe_interval: PROBE_INTERVAL,
            table: UnitTable::default(),
            quiesced: Vec::new(),
        }
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn state(&self, name: &str) -> Option<UnitState> {
        self.table.state(name)
    }

    pub fn record(&self, name: &str) -> Option<&UnitRecord> {
        self.table.get(name)
    }

    /// Install, enable and start every unit of `manifest`.
    pub async fn bootstrap(&mut self, manifest: &ServiceManifest) -> BootstrapReport {
        let mut report = BootstrapReport::default();
        if let Err(e) = manifest.validate() {
            error!(error = %e, "service manifest rejected");
            report.fatal = Some(e);
            return report;
        }

        let started = Instant::now();
        let deadline = started + manifest.deadline();
        let order: Vec<ServiceUnit> = manifest.start_order().into_iter().cloned().collect();
        self.table = UnitTable::new(order.clone());
        self.quiesced.clear();
        info!(units = order.len(), deadline_secs = manifest.deadline_secs, "bring-up started");

        // Phase 1: install and enable everything.
        for unit in &order {
            if let Err(e) = self.install(unit).await {
                error!(unit = %unit.name, error = %e, "unit installation failed");
                self.table.fail(&unit.name, e.to_string());
                if unit.criticality == Criticality::Critical {
                    report.fatal = Some(ProvisionError::FatalStartup {
                        unit: unit.name.clone(),
                        reason: e.to_string(),
                    });
                    report.failures.push(e);
                    report.units = self.outcomes();
                    return report;
                }
                report.failures.push(e);
            }
        }

        // Phase 2: ranked, readiness-gated starts.
        for unit in &order {
            let name = unit.name.as_str();
            if self.table.state(name) != Some(UnitState::Enabled) {
                // Installation failed; already recorded as Failed.
                continue;
            }

            if Instant::now() >= deadline {
                report.deadline_expired = true;
                report.fatal = Some(ProvisionError::FatalStartup {
                    unit: unit.name.clone(),
                    reason: "bring-up deadline expired before start".to_string(),
                });
                warn!(unit = %name, "bring-up deadline expired");
                break;
            }

            if let Some(dep) = self.failed_dependency(unit) {
                let reason = format!("dependency {dep} failed");
                warn!(unit = %name, dependency = %dep, "not starting unit");
                self.table.fail(name, reason.clone());
                if unit.criticality == Criticality::Critical {
                    report.fatal = Some(ProvisionError::FatalStartup {
                        unit: unit.name.clone(),
                        reason,
                    });
                    break;
                }
                continue;
            }

            let bound = manifest
                .ready_timeout(unit)
                .min(deadline.saturating_duration_since(Instant::now()));
            match self.start_unit(unit, bound, deadline).await {
                StartOutcome::Running => {}
                StartOutcome::Failed(e) => {
                    let critical = unit.criticality == Criticality::Critical;
                    if critical {
                        report.fatal = Some(ProvisionError::FatalStartup {
                            unit: unit.name.clone(),
                            reason: e.to_string(),
                        });
                    }
                    report.failures.push(e);
                    if critical {
                        break;
                    }
                }
                StartOutcome::DeadlineExpired(e) => {
                    report.deadline_expired = true;
                    report.fatal = Some(ProvisionError::FatalStartup {
                        unit: unit.name.clone(),
                        reason: format!("bring-up deadline expired: {e}"),
                    });
                    report.failures.push(e);
                    break;
                }
            }
        }

        report.units = self.outcomes();
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            running = report.units_in(UnitState::Running).len(),
            failed = report.units_in(UnitState::Failed).len(),
            aborted = report.fatal.is_some(),
            "bring-up finished"
        );
        report
    }

    async fn install(&mut self, unit: &ServiceUnit) -> Result<(), ProvisionError> {
        let rendered = render_unit(unit, &self.quiesce_bin);
        self.manager.install(unit, &rendered).await?;
        self.table.transition(&unit.name, UnitState::Installed);
        self.manager.enable(&unit.name).await?;
        self.table.transition(&unit.name, UnitState::Enabled);
        Ok(())
    }

    /// First in-manifest dependency that did not reach `Running`.
    fn failed_dependency(&self, unit: &ServiceUnit) -> Option<String> {
        unit.dependencies
            .iter()
            .find(|dep| {
                self.table
                    .state(dep)
                    .is_some_and(|s| s != UnitState::Running)
            })
            .cloned()
    }

    async fn start_unit(&mut self, unit: &ServiceUnit, bound: Duration, deadline: Instant) -> StartOutcome {
        let name = unit.name.as_str();
        self.table.transition(name, UnitState::Starting);
        info!(unit = %name, rank = unit.start_rank, bound_ms = bound.as_millis() as u64, "starting unit");

        if let Err(e) = self.manager.start(name).await {
            error!(unit = %name, error = %e, "start request failed");
            self.table.fail(name, e.to_string());
            self.quiesce_unit(unit).await;
            return StartOutcome::Failed(e);
        }

        let began = Instant::now();
        let until = began + bound;
        loop {
            match self.manager.probe(name).await {
                Ok(Readiness::Ready) => {
                    self.table.transition(name, UnitState::Running);
                    info!(unit = %name, waited_ms = began.elapsed().as_millis() as u64, "unit running");
                    return StartOutcome::Running;
                }
                Ok(Readiness::Failed) => {
                    let e = ProvisionError::FatalStartup {
                        unit: unit.name.clone(),
                        reason: "exited during start".to_string(),
                    };
                    error!(unit = %name, "unit exited during start");
                    self.table.fail(name, "exited during start");
                    self.quiesce_unit(unit).await;
                    return StartOutcome::Failed(e);
                }
                Ok(Readiness::NotReady) => {}
                Err(e) => warn!(unit = %name, error = %e, "readiness probe failed"),
            }

            let now = Instant::now();
            if now >= until {
                break;
            }
            sleep(self.probe_interval.min(until - now)).await;
        }

        let waited_ms = began.elapsed().as_millis() as u64;
        let timeout = ProvisionError::ProbeTimeout {
            unit: unit.name.clone(),
            waited_ms,
        };
        error!(unit = %name, waited_ms, "unit not ready within bound; stopping");
        self.table.fail(name, format!("not ready after {waited_ms} ms"));
        if let Err(e) = self.manager.stop(name).await {
            warn!(unit = %name, error = %e, "stop after timeout failed");
        }
        self.quiesce_unit(unit).await;

        if Instant::now() >= deadline {
            StartOutcome::DeadlineExpired(timeout)
        } else {
            StartOutcome::Failed(timeout)
        }
    }

    /// Run the unit's cleanup actions on a blocking thread.
    async fn quiesce_unit(&mut self, unit: &ServiceUnit) -> QuiesceReport {
        if !unit.controls_actuators() {
            return QuiesceReport::default();
        }
        let guard = self.guard.clone();
        let actions = unit.cleanup.clone();
        let report = match tokio::task::spawn_blocking(move || guard.quiesce(&actions)).await {
            Ok(report) => report,
            Err(e) => {
                error!(unit = %unit.name, error = %e, "quiesce task aborted");
                QuiesceReport {
                    failed: unit.cleanup.iter().map(|a| a.target_resource_id.clone()).collect(),
                    ..QuiesceReport::default()
                }
            }
        };
        self.quiesced.push((unit.name.clone(), report.clone()));
        report
    }

    /// Stop `name` and quiesce its actuators.
    ///
    /// The cleanup actions run even if the stop request fails or the unit
    /// was not running.
    pub async fn shutdown(&mut self, name: &str) -> Result<QuiesceReport, ProvisionError> {
        let Some(record) = self.table.get(name) else {
            return Err(ProvisionError::InvalidManifest {
                reason: format!("unknown unit '{name}'"),
            });
        };
        let unit = record.unit.clone();
        let state = record.state;

        let mut stop_error = None;
        if matches!(state, UnitState::Running | UnitState::Starting) {
            self.table.transition(name, UnitState::Stopping);
            match self.manager.stop(name).await {
                Ok(()) => {
                    self.table.transition(name, UnitState::Stopped);
                }
                Err(e) => {
                    error!(unit = %name, error = %e, "stop failed");
                    self.table.fail(name, e.to_string());
                    stop_error = Some(e);
                }
            }
        }
        let report = self.quiesce_unit(&unit).await;
        info!(unit = %name, state = %self.table.state(name).unwrap_or(state), "unit shut down");
        match stop_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Stop every running unit, highest rank first.
    pub async fn shutdown_all(&mut self) -> Vec<(String, QuiesceReport)> {
        let running: Vec<String> = self
            .table
            .records()
            .iter()
            .rev()
            .filter(|r| matches!(r.state, UnitState::Running | UnitState::Starting))
            .map(|r| r.unit.name.clone())
            .collect();
        let mut reports = Vec::new();
        for name in running {
            let report = match self.shutdown(&name).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(unit = %name, error = %e, "shutdown reported an error");
                    self.quiesced
                        .iter()
                        .rev()
                        .find(|(n, _)| n == &name)
                        .map(|(_, r)| r.clone())
                        .unwrap_or_default()
                }
            };
            reports.push((name, report));
        }
        reports
    }

    /// Record an exit the orchestrator did not initiate and quiesce.
    pub async fn handle_termination(&mut self, name: &str, cause: TerminationCause) -> QuiesceReport {
        let Some(record) = self.table.get(name) else {
            warn!(unit = %name, ?cause, "termination of unknown unit");
            return QuiesceReport::default();
        };
        let unit = record.unit.clone();
        let state = record.state;

        if matches!(state, UnitState::Running | UnitState::Starting | UnitState::Stopping) {
            match cause {
                TerminationCause::Graceful => {
                    if state != UnitState::Stopping {
                        self.table.transition(name, UnitState::Stopping);
                    }
                    self.table.transition(name, UnitState::Stopped);
                }
                TerminationCause::Crash | TerminationCause::OomKill => {
                    let reason = match cause {
                        TerminationCause::OomKill => "killed by the OOM killer",
                        _ => "crashed",
                    };
                    self.table.fail(name, reason);
                }
            }
        }
        warn!(unit = %name, ?cause, state = %self.table.state(name).unwrap_or(state), "unit terminated");
        self.quiesce_unit(&unit).await
    }

    fn outcomes(&self) -> Vec<UnitOutcome> {
        self.table
            .records()
            .iter()
            .map(|r| UnitOutcome {
                name: r.unit.name.clone(),
                state: r.state,
                criticality: r.unit.criticality,
                failure: r.failure.clone(),
                quiesce: self
                    .quiesced
                    .iter()
                    .rev()
                    .find(|(n, _)| n == &r.unit.name)
                    .map(|(_, q)| q.clone()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use edgeprep_hal::{ActuatorRegistry, SimLine};
    use edgeprep_types::CleanupAction;

    use super::*;
    use crate::scripted::{Script, ScriptedManager};

    const BOUND: Duration = Duration::from_secs(2);

    fn unit(name: &str, rank: u32) -> ServiceUnit {
        let mut u = ServiceUnit::new(name, format!("/opt/firmware/{name}"), rank);
        u.ready_timeout_secs = Some(BOUND.as_secs());
        u
    }

    fn actuator_unit(name: &str, rank: u32, line: &str) -> ServiceUnit {
        let mut u = unit(name, rank);
        u.cleanup.push(CleanupAction::new(line, "0"));
        u
    }

    struct Rig {
        manager: Arc<ScriptedManager>,
        orchestrator: ServiceLifecycleOrchestrator,
        lines: Vec<Arc<SimLine>>,
    }

    fn rig(manager: ScriptedManager, line_ids: &[&str]) -> Rig {
        let manager = Arc::new(manager);
        let mut registry = ActuatorRegistry::without_gpio();
        let lines: Vec<Arc<SimLine>> = line_ids.iter().map(|id| Arc::new(SimLine::new(*id, "1"))).collect();
        for line in &lines {
            registry.register(line.clone());
        }
        let guard = HardwareSafetyGuard::new(Arc::new(registry), Duration::from_millis(500));
        let orchestrator =
            ServiceLifecycleOrchestrator::new(manager.clone(), Arc::new(guard), "/usr/bin/edgeprep");
        Rig {
            manager,
            orchestrator,
            lines,
        }
    }

    fn abc() -> ServiceManifest {
        ServiceManifest::new(vec![unit("c", 3), unit("a", 1), unit("b", 2)])
    }

    #[tokio::test(start_paused = true)]
    async fn next_unit_waits_for_previous_readiness() {
        let mut rig = rig(
            ScriptedManager::new()
                .with_script("a", Script::ReadyAfter(Duration::from_millis(700)))
                .with_script("b", Script::ReadyAfter(Duration::from_millis(300))),
            &[],
        );
        let report = rig.orchestrator.bootstrap(&abc()).await;
        assert!(report.result().is_ok());

        let a = rig.orchestrator.record("a").unwrap();
        let b = rig.orchestrator.record("b").unwrap();
        let c = rig.orchestrator.record("c").unwrap();
        let a_running = a.entered(UnitState::Running).unwrap();
        let b_starting = b.entered(UnitState::Starting).unwrap();
        assert!(b_starting >= a_running);
        assert!(c.entered(UnitState::Starting).unwrap() >= b.entered(UnitState::Running).unwrap());
        // Readiness gating, not a fixed sleep: B starts well before the bound.
        let a_start = a.entered(UnitState::Starting).unwrap();
        assert!(b_starting - a_start < BOUND);
        assert!(b_starting - a_start >= Duration::from_millis(700));
        assert_eq!(
            rig.manager.call_log()[6..],
            ["start a".to_string(), "start b".to_string(), "start c".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn best_effort_timeout_continues_after_bound() {
        let mut rig = rig(ScriptedManager::new().with_script("a", Script::NeverReady), &[]);
        let report = rig.orchestrator.bootstrap(&abc()).await;

        let a = rig.orchestrator.record("a").unwrap();
        let b = rig.orchestrator.record("b").unwrap();
        let waited = b.entered(UnitState::Starting).unwrap() - a.entered(UnitState::Starting).unwrap();
        assert!(waited >= BOUND);
        assert!(waited < BOUND + PROBE_INTERVAL * 2);

        assert_eq!(report.state("a"), Some(UnitState::Failed));
        assert_eq!(report.units_in(UnitState::Running), vec!["b", "c"]);
        assert!(report.fatal.is_none());
        assert!(matches!(report.failures[..], [ProvisionError::ProbeTimeout { ref unit, .. }] if unit == "a"));
        assert!(rig.manager.call_log().contains(&"stop a".to_string()));
        assert!(matches!(report.result(), Err(ProvisionError::ProbeTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn critical_failure_aborts_and_leaves_rest_enabled() {
        let mut manifest = abc();
        manifest.units.iter_mut().find(|u| u.name == "b").unwrap().criticality = Criticality::Critical;
        let mut rig = rig(ScriptedManager::new().with_script("b", Script::NeverReady), &[]);

        let report = rig.orchestrator.bootstrap(&manifest).await;
        assert_eq!(report.state("a"), Some(UnitState::Running));
        assert_eq!(report.state("b"), Some(UnitState::Failed));
        assert_eq!(report.state("c"), Some(UnitState::Enabled));
        assert!(matches!(report.fatal, Some(ProvisionError::FatalStartup { ref unit, .. }) if unit == "b"));
        assert!(!rig.manager.call_log().contains(&"start c".to_string()));
        assert!(rig.orchestrator.record("c").unwrap().entered(UnitState::Starting).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn overall_deadline_clips_unit_bound() {
        let mut manifest = abc();
        manifest.deadline_secs = 1;
        let mut rig = rig(ScriptedManager::new().with_script("a", Script::NeverReady), &[]);

        let report = rig.orchestrator.bootstrap(&manifest).await;
        assert!(report.deadline_expired);
        assert!(matches!(report.fatal, Some(ProvisionError::FatalStartup { ref unit, .. }) if unit == "a"));
        assert_eq!(report.state("a"), Some(UnitState::Failed));
        assert_eq!(report.state("b"), Some(UnitState::Enabled));
        assert_eq!(report.state("c"), Some(UnitState::Enabled));
        let a = rig.orchestrator.record("a").unwrap();
        let failed_at = a.entered(UnitState::Failed).unwrap();
        assert!(failed_at - a.entered(UnitState::Starting).unwrap() <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_actuator_unit_is_quiesced() {
        let manifest = ServiceManifest::new(vec![actuator_unit("facial", 1, "buzzer")]);
        let mut rig = rig(ScriptedManager::new().with_script("facial", Script::NeverReady), &["buzzer"]);

        let report = rig.orchestrator.bootstrap(&manifest).await;
        assert_eq!(rig.lines[0].value(), "0");
        let outcome = &report.units[0];
        assert_eq!(outcome.quiesce.as_ref().unwrap().applied, vec!["buzzer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn dependency_failure_skips_dependent() {
        let mut b = unit("b", 2);
        b.dependencies = vec!["a".into(), "network-online.target".into()];
        let manifest = ServiceManifest::new(vec![unit("a", 1), b, unit("c", 3)]);
        let mut rig = rig(ScriptedManager::new().with_script("a", Script::FailStart), &[]);

        let report = rig.orchestrator.bootstrap(&manifest).await;
        assert_eq!(report.state("b"), Some(UnitState::Failed));
        assert_eq!(report.units[1].failure.as_deref(), Some("dependency a failed"));
        assert!(!rig.manager.call_log().contains(&"start b".to_string()));
        assert_eq!(report.state("c"), Some(UnitState::Running));
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn install_failure_is_recorded_and_never_started() {
        let mut b = unit("b", 2);
        b.dependencies = vec!["a".into()];
        let manifest = ServiceManifest::new(vec![unit("a", 1), b, unit("c", 3)]);
        let mut rig = rig(ScriptedManager::new().with_script("a", Script::FailInstall), &[]);

        let report = rig.orchestrator.bootstrap(&manifest).await;
        assert!(report.fatal.is_none());
        assert_eq!(report.state("a"), Some(UnitState::Failed));
        assert!(report.units[0].failure.as_deref().unwrap().contains("scripted install failure"));
        let log = rig.manager.call_log();
        assert!(!log.contains(&"enable a".to_string()));
        assert!(!log.contains(&"start a".to_string()));
        assert_eq!(report.state("b"), Some(UnitState::Failed));
        assert_eq!(report.units[1].failure.as_deref(), Some("dependency a failed"));
        assert_eq!(report.state("c"), Some(UnitState::Running));
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exit_during_start_fails_immediately() {
        let manifest = ServiceManifest::new(vec![unit("a", 1)]);
        let mut rig = rig(
            ScriptedManager::new().with_script("a", Script::ExitAfter(Duration::from_millis(250))),
            &[],
        );
        let report = rig.orchestrator.bootstrap(&manifest).await;
        let a = rig.orchestrator.record("a").unwrap();
        let took = a.entered(UnitState::Failed).unwrap() - a.entered(UnitState::Starting).unwrap();
        assert!(took < Duration::from_millis(500));
        assert_eq!(report.state("a"), Some(UnitState::Failed));
    }

    #[tokio::test]
    async fn invalid_manifest_touches_nothing() {
        let mut rig = rig(ScriptedManager::new(), &[]);
        let report = rig
            .orchestrator
            .bootstrap(&ServiceManifest::new(vec![unit("a", 1), unit("a", 2)]))
            .await;
        assert!(matches!(report.fatal, Some(ProvisionError::InvalidManifest { .. })));
        assert!(rig.manager.call_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_always_quiesces() {
        let manifest = ServiceManifest::new(vec![
            actuator_unit("facial", 1, "gpio12"),
            actuator_unit("alerts", 2, "gpio4"),
        ]);
        let mut rig = rig(ScriptedManager::new(), &["gpio12", "gpio4"]);
        rig.orchestrator.bootstrap(&manifest).await;

        let reports = rig.orchestrator.shutdown_all().await;
        let order: Vec<&str> = reports.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(order, vec!["alerts", "facial"]);
        assert!(rig.lines.iter().all(|l| l.value() == "0"));
        assert_eq!(rig.orchestrator.state("facial"), Some(UnitState::Stopped));

        // Not running any more, still quiesced.
        let again = rig.orchestrator.shutdown("facial").await.unwrap();
        assert_eq!(again.applied, vec!["gpio12"]);
        assert!(rig.orchestrator.shutdown("ghost").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn crash_and_oom_kill_quiesce() {
        let manifest = ServiceManifest::new(vec![
            actuator_unit("facial", 1, "gpio12"),
            actuator_unit("alerts", 2, "gpio4"),
        ]);
        let mut rig = rig(ScriptedManager::new(), &["gpio12", "gpio4"]);
        rig.orchestrator.bootstrap(&manifest).await;

        let report = rig.orchestrator.handle_termination("facial", TerminationCause::Crash).await;
        assert_eq!(report.applied, vec!["gpio12"]);
        assert_eq!(rig.orchestrator.state("facial"), Some(UnitState::Failed));

        let report = rig.orchestrator.handle_termination("alerts", TerminationCause::OomKill).await;
        assert_eq!(report.applied, vec!["gpio4"]);
        assert_eq!(
            rig.orchestrator.record("alerts").unwrap().failure.as_deref(),
            Some("killed by the OOM killer")
        );
        assert!(rig.lines.iter().all(|l| l.value() == "0"));
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_exit_ends_stopped() {
        let manifest = ServiceManifest::new(vec![actuator_unit("facial", 1, "gpio12")]);
        let mut rig = rig(ScriptedManager::new(), &["gpio12"]);
        rig.orchestrator.bootstrap(&manifest).await;
        rig.orchestrator
            .handle_termination("facial", TerminationCause::Graceful)
            .await;
        assert_eq!(rig.orchestrator.state("facial"), Some(UnitState::Stopped));
        assert_eq!(rig.lines[0].value(), "0");
    }
}
