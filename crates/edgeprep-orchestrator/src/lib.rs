//! `edgeprep-orchestrator` – service bring-up and teardown.
//!
//! Takes the service manifest once the leaf provisioning has finished and
//! brings the units up in rank order, gating each start on the previous
//! unit's readiness. It owns every unit state transition.
//!
//! # Modules
//!
//! - [`orchestrator`] – [`ServiceLifecycleOrchestrator`][orchestrator::ServiceLifecycleOrchestrator]:
//!   ranked bring-up with readiness probing, overall deadline, shutdown and
//!   termination handling. Every termination of an actuator-owning unit is
//!   routed through the
//!   [`HardwareSafetyGuard`][edgeprep_hal::HardwareSafetyGuard].
//! - [`manifest`] – [`ServiceManifest`][manifest::ServiceManifest]: the unit
//!   set, time bounds and validation.
//! - [`manager`] – [`ServiceManager`][manager::ServiceManager]: the seam to
//!   the host's service manager, with the `systemctl`-backed
//!   [`SystemdManager`][manager::SystemdManager].
//! - [`scripted`] – [`ScriptedManager`][scripted::ScriptedManager]: scripted
//!   in-process manager for tests.
//! - [`state`] – [`UnitTable`][state::UnitTable]: checked, timestamped state
//!   transitions.
//! - [`unit_file`] – systemd unit rendering.

pub mod manager;
pub mod manifest;
pub mod orchestrator;
pub mod scripted;
pub mod state;
pub mod unit_file;

pub use manager::{Readiness, ServiceManager, SystemdManager};
pub use manifest::ServiceManifest;
pub use orchestrator::{BootstrapReport, PROBE_INTERVAL, ServiceLifecycleOrchestrator, UnitOutcome};
pub use scripted::{Script, ScriptedManager};
pub use state::{Transition, UnitRecord, UnitTable};
pub use unit_file::render_unit;
