//! `edgeprep-provision` – the leaf provisioning components.
//!
//! Each component owns exactly one resource domain and shares no mutable
//! state with the others, so they can run in any order. Every operation is a
//! synchronous, run-to-completion call that reports its own result.
//!
//! # Modules
//!
//! - [`boot_config`] – [`ConfigMutator`][boot_config::ConfigMutator]:
//!   idempotent editor for the firmware boot configuration (`config.txt`),
//!   gated by a [`DirectivePolicy`][boot_config::DirectivePolicy].
//! - [`swap`] – [`SwapManager`][swap::SwapManager]: zram swap device
//!   provisioning and teardown.
//! - [`governor`] – [`GovernorController`][governor::GovernorController]:
//!   per-core cpufreq governor control.
//! - [`tmpfs`] – [`TmpfsProvisioner`][tmpfs::TmpfsProvisioner]: RAM-backed
//!   overlays with a free-memory reservation check.
//! - [`sysctl`] – [`SysctlTuner`][sysctl::SysctlTuner]: kernel tunables in a
//!   dedicated `sysctl.d` file.
//!
//! Supporting pieces: [`document`] (transactional text documents with
//! backup-before-first-write), [`host`] (external command seam),
//! [`boot_unit`] (oneshot units that re-apply settings at boot) and
//! [`meminfo`].

pub mod boot_config;
pub mod boot_unit;
pub mod document;
pub mod governor;
pub mod host;
pub mod meminfo;
pub mod swap;
pub mod sysctl;
pub mod tmpfs;

pub use boot_config::{BootConfigChange, ConfigMutator, DirectivePolicy};
pub use boot_unit::{BootUnit, BootUnitWriter};
pub use document::{BackupLedger, Document};
pub use governor::GovernorController;
pub use host::{CommandRunner, RecordingRunner, SystemRunner};
pub use meminfo::MemoryInfo;
pub use swap::{SwapManager, SwapPolicy, SwapReport, SwapStatus};
pub use sysctl::SysctlTuner;
pub use tmpfs::TmpfsProvisioner;
