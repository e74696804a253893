//! [`ScriptedManager`] – in-process [`ServiceManager`] with scripted unit
//! behaviour.
//!
//! Timing is measured with `tokio::time::Instant`, so tests can run on a
//! paused clock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use edgeprep_types::{ProvisionError, ServiceUnit};
use tokio::time::Instant;

use crate::manager::{Readiness, ServiceManager};

/// How a scripted unit behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// `install` fails; the unit never gets further.
    FailInstall,
    /// Ready this long after `start`.
    ReadyAfter(Duration),
    /// Stays in the activating state forever.
    NeverReady,
    /// `start` itself fails.
    FailStart,
    /// Exits this long after `start`, before becoming ready.
    ExitAfter(Duration),
}

/// One call observed by a [`ScriptedManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: &'static str,
    pub unit: String,
    pub at: Instant,
}

#[derive(Default)]
pub struct ScriptedManager {
    scripts: HashMap<String, Script>,
    started: Mutex<HashMap<String, Instant>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedManager {
    /// Every unit becomes ready immediately.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, unit: &str, script: Script) -> Self {
        self.scripts.insert(unit.to_string(), script);
        self
    }

    fn script(&self, unit: &str) -> Script {
        self.scripts
            .get(unit)
            .copied()
            .unwrap_or(Script::ReadyAfter(Duration::ZERO))
    }

    fn record(&self, verb: &'static str, unit: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(Call {
                verb,
                unit: unit.to_string(),
                at: Instant::now(),
            });
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// `"verb unit"` strings, oldest first.
    pub fn call_log(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|c| format!("{} {}", c.verb, c.unit))
            .collect()
    }

    /// When `unit` was last started.
    pub fn started_at(&self, unit: &str) -> Option<Instant> {
        self.started.lock().ok()?.get(unit).copied()
    }
}

#[async_trait]
impl ServiceManager for ScriptedManager {
    async fn install(&self, unit: &ServiceUnit, _rendered: &str) -> Result<(), ProvisionError> {
        self.record("install", &unit.name);
        if self.script(&unit.name) == Script::FailInstall {
            return Err(ProvisionError::HostCommand {
                command: format!("install {}", unit.name),
                details: "scripted install failure".to_string(),
            });
        }
        Ok(())
    }

    async fn enable(&self, name: &str) -> Result<(), ProvisionError> {
        self.record("enable", name);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), ProvisionError> {
        self.record("start", name);
        if self.script(name) == Script::FailStart {
            return Err(ProvisionError::HostCommand {
                command: format!("start {name}"),
                details: "scripted start failure".to_string(),
            });
        }
        if let Ok(mut started) = self.started.lock() {
            started.insert(name.to_string(), Instant::now());
        }
        Ok(())
    }

    async fn probe(&self, name: &str) -> Result<Readiness, ProvisionError> {
        let Some(since) = self.started_at(name) else {
            return Ok(Readiness::NotReady);
        };
        let elapsed = since.elapsed();
        Ok(match self.script(name) {
            Script::ReadyAfter(after) if elapsed >= after => Readiness::Ready,
            Script::ExitAfter(after) if elapsed >= after => Readiness::Failed,
            Script::FailStart => Readiness::Failed,
            _ => Readiness::NotReady,
        })
    }

    async fn stop(&self, name: &str) -> Result<(), ProvisionError> {
        self.record("stop", name);
        if let Ok(mut started) = self.started.lock() {
            started.remove(name);
        }
        Ok(())
    }
}
