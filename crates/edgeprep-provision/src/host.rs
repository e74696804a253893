//! External command seam.
//!
//! Leaf components never spawn processes directly; they go through a
//! [`CommandRunner`]. [`SystemRunner`] executes for real, [`RecordingRunner`]
//! records the command lines and answers from scripted handlers for tests.

use std::process::Command;
use std::sync::Mutex;

use edgeprep_types::ProvisionError;
use tracing::debug;

/// Runs a host program to completion and returns its stdout.
pub trait CommandRunner: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ProvisionError::HostCommand`] if the program cannot be
    /// spawned or exits non-zero.
    fn run(&self, program: &str, args: &[&str]) -> Result<String, ProvisionError>;
}

fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Executes commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, ProvisionError> {
        let line = command_line(program, args);
        debug!(command = %line, "running host command");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| ProvisionError::HostCommand {
                command: line.clone(),
                details: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(ProvisionError::HostCommand {
                command: line,
                details: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

type Handler = Box<dyn Fn(&[&str]) -> Result<String, ProvisionError> + Send + Sync>;

/// Records every command line instead of executing it.
///
/// Programs without a handler succeed with empty output.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    handlers: Vec<(String, Handler)>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer invocations of `program` with `handler`.
    pub fn with_handler(
        mut self,
        program: &str,
        handler: impl Fn(&[&str]) -> Result<String, ProvisionError> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.push((program.to_string(), Box::new(handler)));
        self
    }

    /// Command lines seen so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Command lines that start with `prefix`.
    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, ProvisionError> {
        let line = command_line(program, args);
        debug!(command = %line, "recorded host command");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line);
        }
        match self.handlers.iter().find(|(p, _)| p == program) {
            Some((_, handler)) => handler(args),
            None => Ok(String::new()),
        }
    }
}
