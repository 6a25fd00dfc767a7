//! Release requirement and disruption registry
//!
//! Releases carry `requirements` (key → required value) and `disruptions`
//! (keys). The engine asks a `RequirementChecker` whether each requirement
//! holds and whether a disruption key needs operator approval.

use crate::controller::version::parse_version;
use semver::Version;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RequirementError {
    #[error("requirement {0:?} is not registered")]
    NotRegistered(String),

    #[error("{0}")]
    NotMet(String),
}

/// Trait for requirement checks
///
/// Production code uses `RequirementRegistry` populated at startup.
/// Tests register closures on the same registry.
pub trait RequirementChecker: Send + Sync {
    /// `Ok(true)` when the requirement holds
    fn check_requirement(&self, key: &str, value: &str) -> Result<bool, RequirementError>;

    /// Reason text when `key` names a disruptive change
    fn has_disruption(&self, key: &str) -> Option<String>;
}

type CheckFn = Box<dyn Fn(&str) -> Result<bool, RequirementError> + Send + Sync>;

#[derive(Default)]
pub struct RequirementRegistry {
    checks: HashMap<String, CheckFn>,
    disruptions: HashMap<String, String>,
}

impl RequirementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, key: impl Into<String>, check: F)
    where
        F: Fn(&str) -> Result<bool, RequirementError> + Send + Sync + 'static,
    {
        self.checks.insert(key.into(), Box::new(check));
    }

    pub fn register_disruption(&mut self, key: impl Into<String>, reason: impl Into<String>) {
        self.disruptions.insert(key.into(), reason.into());
    }

    /// Register disruption reasons in bulk (e.g. parsed from configuration)
    pub fn with_disruptions(mut self, disruptions: HashMap<String, String>) -> Self {
        self.disruptions.extend(disruptions);
        self
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.checks.contains_key(key)
    }
}

impl RequirementChecker for RequirementRegistry {
    fn check_requirement(&self, key: &str, value: &str) -> Result<bool, RequirementError> {
        let check = self
            .checks
            .get(key)
            .ok_or_else(|| RequirementError::NotRegistered(key.to_string()))?;
        check(value)
    }

    fn has_disruption(&self, key: &str) -> Option<String> {
        self.disruptions.get(key).cloned()
    }
}

/// Check that `current` is at least the version named by the requirement value
///
/// Used for requirements such as `kubernetes: "1.29"`; a two-part value is
/// treated as `major.minor.0`.
pub fn min_version_check(
    subject: &'static str,
    current: Version,
) -> impl Fn(&str) -> Result<bool, RequirementError> + Send + Sync {
    move |value: &str| {
        let required = parse_min_version(value).ok_or_else(|| {
            RequirementError::NotMet(format!("invalid {} version requirement {:?}", subject, value))
        })?;
        if current >= required {
            Ok(true)
        } else {
            Err(RequirementError::NotMet(format!(
                "{} version {} is lower than required {}",
                subject, current, required
            )))
        }
    }
}

fn parse_min_version(raw: &str) -> Option<Version> {
    if let Ok(v) = parse_version(raw) {
        return Some(v);
    }
    parse_version(&format!("{}.0", raw.trim())).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_requirement_is_distinguishable() {
        let registry = RequirementRegistry::new();
        assert_eq!(
            registry.check_requirement("kubernetes", "1.29"),
            Err(RequirementError::NotRegistered("kubernetes".to_string()))
        );
    }

    #[test]
    fn test_registered_closure_is_called_with_value() {
        let mut registry = RequirementRegistry::new();
        registry.register("ingress", |value| Ok(value == "enabled"));

        assert_eq!(registry.check_requirement("ingress", "enabled"), Ok(true));
        assert_eq!(registry.check_requirement("ingress", "disabled"), Ok(false));
        assert!(registry.is_registered("ingress"));
    }

    #[test]
    fn test_min_version_check() {
        let mut registry = RequirementRegistry::new();
        registry.register(
            "kubernetes",
            min_version_check("kubernetes", Version::new(1, 29, 4)),
        );

        assert_eq!(registry.check_requirement("kubernetes", "1.28"), Ok(true));
        assert_eq!(registry.check_requirement("kubernetes", "1.29"), Ok(true));
        assert!(matches!(
            registry.check_requirement("kubernetes", "1.30"),
            Err(RequirementError::NotMet(msg)) if msg.contains("lower than required")
        ));
        assert!(matches!(
            registry.check_requirement("kubernetes", "soon"),
            Err(RequirementError::NotMet(_))
        ));
    }

    #[test]
    fn test_disruptions() {
        let registry = RequirementRegistry::new().with_disruptions(HashMap::from([(
            "ingressNginx".to_string(),
            "ingress controller pods will be restarted".to_string(),
        )]));

        assert_eq!(
            registry.has_disruption("ingressNginx").as_deref(),
            Some("ingress controller pods will be restarted")
        );
        assert_eq!(registry.has_disruption("cni"), None);
    }
}
