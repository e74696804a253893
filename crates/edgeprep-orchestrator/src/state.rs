//! Per-unit lifecycle records.
//!
//! [`UnitTable`] is the only place unit states change. Every transition is
//! checked against [`UnitState::can_transition_to`] and timestamped, which is
//! what the ordering guarantees are tested against.

use edgeprep_types::{ServiceUnit, UnitState};
use tokio::time::Instant;
use tracing::{debug, error};

/// One state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: UnitState,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct UnitRecord {
    pub unit: ServiceUnit,
    pub state: UnitState,
    pub history: Vec<Transition>,
    /// Why the unit ended `Failed`.
    pub failure: Option<String>,
}

impl UnitRecord {
    fn new(unit: ServiceUnit) -> Self {
        Self {
            unit,
            state: UnitState::Uninstalled,
            history: vec![Transition {
                state: UnitState::Uninstalled,
                at: Instant::now(),
            }],
            failure: None,
        }
    }

    /// When the unit first entered `state`.
    pub fn entered(&self, state: UnitState) -> Option<Instant> {
        self.history.iter().find(|t| t.state == state).map(|t| t.at)
    }
}

/// Unit records in start order.
#[derive(Debug, Default)]
pub struct UnitTable {
    records: Vec<UnitRecord>,
}

impl UnitTable {
    pub fn new(units: Vec<ServiceUnit>) -> Self {
        Self {
            records: units.into_iter().map(UnitRecord::new).collect(),
        }
    }

    pub fn records(&self) -> &[UnitRecord] {
        &self.records
    }

    pub fn get(&self, name: &str) -> Option<&UnitRecord> {
        self.records.iter().find(|r| r.unit.name == name)
    }

    pub fn state(&self, name: &str) -> Option<UnitState> {
        self.get(name).map(|r| r.state)
    }

    /// Move `name` to `next`. Illegal edges are refused and logged.
    pub fn transition(&mut self, name: &str, next: UnitState) -> bool {
        let Some(record) = self.records.iter_mut().find(|r| r.unit.name == name) else {
            error!(unit = %name, "transition for unknown unit");
            return false;
        };
        if !record.state.can_transition_to(next) {
            error!(unit = %name, from = %record.state, to = %next, "illegal unit transition refused");
            return false;
        }
        debug!(unit = %name, from = %record.state, to = %next, "unit transition");
        record.state = next;
        record.history.push(Transition {
            state: next,
            at: Instant::now(),
        });
        true
    }

    /// Move `name` to `Failed` and remember why.
    pub fn fail(&mut self, name: &str, reason: impl Into<String>) -> bool {
        if !self.transition(name, UnitState::Failed) {
            return false;
        }
        if let Some(record) = self.records.iter_mut().find(|r| r.unit.name == name) {
            record.failure = Some(reason.into());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> UnitTable {
        UnitTable::new(vec![ServiceUnit::new("a", "/bin/a", 1)])
    }

    #[test]
    fn legal_chain_is_recorded() {
        let mut t = table();
        for next in [UnitState::Installed, UnitState::Enabled, UnitState::Starting, UnitState::Running] {
            assert!(t.transition("a", next));
        }
        let record = t.get("a").unwrap();
        assert_eq!(record.history.len(), 5);
        assert!(record.entered(UnitState::Running).is_some());
    }

    #[test]
    fn illegal_transition_is_refused() {
        let mut t = table();
        assert!(!t.transition("a", UnitState::Running));
        assert_eq!(t.state("a"), Some(UnitState::Uninstalled));
        assert!(!t.transition("ghost", UnitState::Installed));
    }

    #[test]
    fn fail_records_reason() {
        let mut t = table();
        t.transition("a", UnitState::Installed);
        t.transition("a", UnitState::Enabled);
        assert!(t.fail("a", "dependency b failed"));
        let record = t.get("a").unwrap();
        assert_eq!(record.state, UnitState::Failed);
        assert_eq!(record.failure.as_deref(), Some("dependency b failed"));
    }
}
