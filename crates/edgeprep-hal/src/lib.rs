//! `edgeprep-hal` – actuator access and the hardware safety guard.
//!
//! # Modules
//!
//! - [`line`] – [`OutputLine`][line::OutputLine]: a writable actuator
//!   resource (GPIO pin, PWM channel, relay) addressed by a stable id.
//! - [`gpio`] – [`SysfsGpio`][gpio::SysfsGpio]: driver for lines exported
//!   under `/sys/class/gpio`.
//! - [`sim`] – [`SimLine`][sim::SimLine]: in-process line for tests.
//! - [`registry`] – [`ActuatorRegistry`][registry::ActuatorRegistry]:
//!   resolves resource ids to drivers.
//! - [`guard`] – [`HardwareSafetyGuard`][guard::HardwareSafetyGuard]: drives
//!   actuators to their quiescent value on unit termination. Never fails.

use thiserror::Error;

pub mod gpio;
pub mod guard;
pub mod line;
pub mod registry;
pub mod sim;

pub use gpio::SysfsGpio;
pub use guard::{HardwareSafetyGuard, QuiesceReport};
pub use line::OutputLine;
pub use registry::ActuatorRegistry;
pub use sim::SimLine;

/// Driver-level failure on a single actuator resource.
#[derive(Error, Debug)]
pub enum HalError {
    #[error("Resource {0} is not present")]
    Missing(String),

    #[error("I/O on {resource}: {source}")]
    Io {
        resource: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Resource {resource} rejected value '{value}'")]
    Rejected { resource: String, value: String },
}
