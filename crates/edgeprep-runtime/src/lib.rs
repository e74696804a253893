//! `edgeprep-runtime` – the top-level provisioning run.
//!
//! # Modules
//!
//! - [`plan`] – [`ProvisionPlan`][plan::ProvisionPlan]: which leaf steps a
//!   run performs, as read from the configuration file.
//! - [`run`] – [`run_leaves`][run::run_leaves] applies every leaf step
//!   independently; [`run()`][run::run] follows up with service bring-up.
//!   [`HostContext`][run::HostContext] builds the leaf components for one
//!   host root.
//! - [`summary`] – [`RunSummary`][summary::RunSummary]: the JSON document
//!   printed at the end of a run, and the exit-code rule.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber on stderr with an optional OTLP span exporter.

pub mod plan;
pub mod run;
pub mod summary;
pub mod telemetry;

pub use plan::{BootConfigPlan, OverlayPlan, ProvisionPlan, SwapPlan};
pub use run::{HostContext, run, run_leaves};
pub use summary::{ComponentError, LeafResults, RunSummary, StepOutcome, StepStatus};
