//! [`ServiceManifest`] – the set of units handed to the orchestrator.

use std::collections::HashMap;
use std::time::Duration;

use edgeprep_types::{ProvisionError, ServiceUnit};
use serde::{Deserialize, Serialize};

fn default_ready_timeout_secs() -> u64 {
    30
}

fn default_deadline_secs() -> u64 {
    300
}

/// Units plus the bring-up time bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceManifest {
    /// Readiness ceiling for units without their own `ready_timeout_secs`.
    #[serde(default = "default_ready_timeout_secs")]
    pub default_ready_timeout_secs: u64,
    /// Bound on the whole bring-up.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default)]
    pub units: Vec<ServiceUnit>,
}

impl Default for ServiceManifest {
    fn default() -> Self {
        Self {
            default_ready_timeout_secs: default_ready_timeout_secs(),
            deadline_secs: default_deadline_secs(),
            units: Vec::new(),
        }
    }
}

fn invalid(reason: impl Into<String>) -> ProvisionError {
    ProvisionError::InvalidManifest {
        reason: reason.into(),
    }
}

fn valid_unit_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

impl ServiceManifest {
    pub fn new(units: Vec<ServiceUnit>) -> Self {
        Self {
            units,
            ..Self::default()
        }
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Readiness ceiling for `unit`.
    pub fn ready_timeout(&self, unit: &ServiceUnit) -> Duration {
        Duration::from_secs(unit.ready_timeout_secs.unwrap_or(self.default_ready_timeout_secs))
    }

    pub fn unit(&self, name: &str) -> Option<&ServiceUnit> {
        self.units.iter().find(|u| u.name == name)
    }

    /// Units in start order: ascending rank, ties broken by name.
    pub fn start_order(&self) -> Vec<&ServiceUnit> {
        let mut units: Vec<&ServiceUnit> = self.units.iter().collect();
        units.sort_by(|a, b| a.start_rank.cmp(&b.start_rank).then_with(|| a.name.cmp(&b.name)));
        units
    }

    /// Reject manifests the orchestrator cannot sequence.
    ///
    /// Dependencies naming a unit outside the manifest are external units and
    /// are passed through to the service manager unchecked.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        let mut ranks: HashMap<&str, u32> = HashMap::new();
        for unit in &self.units {
            if !valid_unit_name(&unit.name) {
                return Err(invalid(format!("invalid unit name '{}'", unit.name)));
            }
            if ranks.insert(unit.name.as_str(), unit.start_rank).is_some() {
                return Err(invalid(format!("duplicate unit name '{}'", unit.name)));
            }
            if !unit.executable_path.is_absolute() {
                return Err(invalid(format!(
                    "{}: executable path {} is not absolute",
                    unit.name,
                    unit.executable_path.display()
                )));
            }
            if !(-20..=19).contains(&unit.niceness) {
                return Err(invalid(format!("{}: niceness {} out of range", unit.name, unit.niceness)));
            }
            if !(1..=10_000).contains(&unit.resource_weight) {
                return Err(invalid(format!(
                    "{}: resource weight {} out of range 1..=10000",
                    unit.name, unit.resource_weight
                )));
            }
            if unit.cleanup.iter().any(|a| a.target_resource_id.trim().is_empty()) {
                return Err(invalid(format!("{}: cleanup action without a resource", unit.name)));
            }
        }

        for unit in &self.units {
            for dep in &unit.dependencies {
                if dep == &unit.name {
                    return Err(invalid(format!("{} depends on itself", unit.name)));
                }
                if let Some(&dep_rank) = ranks.get(dep.as_str())
                    && dep_rank >= unit.start_rank
                {
                    return Err(invalid(format!(
                        "{} (rank {}) depends on {dep} (rank {dep_rank}); dependencies must start earlier",
                        unit.name, unit.start_rank
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use edgeprep_types::CleanupAction;

    use super::*;

    fn unit(name: &str, rank: u32) -> ServiceUnit {
        ServiceUnit::new(name, format!("/opt/firmware/{name}"), rank)
    }

    #[test]
    fn start_order_is_by_rank_then_name() {
        let manifest = ServiceManifest::new(vec![unit("c", 3), unit("b", 1), unit("a", 1)]);
        let names: Vec<&str> = manifest.start_order().into_iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn duplicate_names_rejected() {
        let manifest = ServiceManifest::new(vec![unit("a", 1), unit("a", 2)]);
        assert!(matches!(manifest.validate(), Err(ProvisionError::InvalidManifest { .. })));
    }

    #[test]
    fn dependency_must_have_lower_rank() {
        let mut b = unit("b", 1);
        b.dependencies.push("a".into());
        let manifest = ServiceManifest::new(vec![unit("a", 1), b.clone()]);
        assert!(manifest.validate().is_err());

        b.start_rank = 2;
        let manifest = ServiceManifest::new(vec![unit("a", 1), b]);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn external_dependencies_pass_through() {
        let mut a = unit("a", 1);
        a.dependencies.push("network-online.target".into());
        assert!(ServiceManifest::new(vec![a]).validate().is_ok());
    }

    #[test]
    fn field_ranges_are_checked() {
        let mut a = unit("a", 1);
        a.niceness = -21;
        assert!(ServiceManifest::new(vec![a.clone()]).validate().is_err());
        a.niceness = 0;
        a.resource_weight = 0;
        assert!(ServiceManifest::new(vec![a.clone()]).validate().is_err());
        a.resource_weight = 100;
        a.executable_path = "relative/bin".into();
        assert!(ServiceManifest::new(vec![a.clone()]).validate().is_err());
        a.executable_path = "/bin/true".into();
        a.cleanup.push(CleanupAction::new(" ", "0"));
        assert!(ServiceManifest::new(vec![a]).validate().is_err());
    }

    #[test]
    fn deserialises_with_defaults() {
        let manifest: ServiceManifest = toml::from_str(
            r#"
            [[units]]
            name = "facial"
            executable_path = "/usr/bin/python3"
            args = ["/opt/firmware/facial.py"]
            start_rank = 1
            "#,
        )
        .unwrap();
        assert_eq!(manifest.default_ready_timeout_secs, 30);
        assert_eq!(manifest.deadline(), Duration::from_secs(300));
        assert_eq!(manifest.units[0].args, vec!["/opt/firmware/facial.py"]);
    }
}
