//! Release capability trait
//!
//! The updater engine only sees releases through this trait, so the same
//! scheduling logic drives `PlatformRelease` and `ModuleRelease`.

use crate::controller::version::{parse_version, VersionError};
use crate::crd::release::{ModuleRelease, PlatformRelease, ReleasePhase, ReleaseStatus};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use semver::Version;
use std::collections::BTreeMap;
use tracing::warn;

pub const ANNOTATION_FORCE: &str = "updates.kulta.io/force";
pub const ANNOTATION_APPLY_NOW: &str = "updates.kulta.io/apply-now";
pub const ANNOTATION_APPROVED: &str = "updates.kulta.io/approved";
pub const ANNOTATION_DISRUPTION_APPROVED: &str = "updates.kulta.io/disruption-approved";
pub const ANNOTATION_SUSPEND: &str = "updates.kulta.io/suspend";
pub const ANNOTATION_NOTIFIED: &str = "updates.kulta.io/notified";
pub const ANNOTATION_IS_UPDATING: &str = "updates.kulta.io/is-updating";
pub const ANNOTATION_NOTIFICATION_SHIFT: &str = "updates.kulta.io/notification-time-shift";
pub const ANNOTATION_CHANGE_CAUSE: &str = "updates.kulta.io/change-cause";

/// Label carrying the module name on `ModuleRelease` objects
pub const LABEL_MODULE: &str = "updates.kulta.io/module";

/// Bookkeeping flags persisted on the predicted release
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseData {
    pub is_updating: bool,
    pub notified: bool,
}

/// Capability set the updater needs from a release record
///
/// Override flags (`force`, `apply-now`, approvals, `suspend`) and release
/// data are read from annotations, so implementors only expose the raw
/// annotation map.
pub trait Release: Clone + Send + Sync + 'static {
    fn name(&self) -> String;
    fn raw_version(&self) -> &str;
    fn status(&self) -> Option<&ReleaseStatus>;
    fn apply_after_raw(&self) -> Option<&str>;
    fn cooldown_until_raw(&self) -> Option<&str>;
    fn requirements(&self) -> &BTreeMap<String, String>;
    fn disruptions(&self) -> &[String];
    fn changelog_link(&self) -> Option<&str>;
    fn annotation(&self, key: &str) -> Option<&str>;

    fn version(&self) -> Result<Version, VersionError> {
        parse_version(self.raw_version())
    }

    fn phase(&self) -> Option<ReleasePhase> {
        self.status().and_then(|s| s.phase)
    }

    fn message(&self) -> &str {
        self.status().map(|s| s.message.as_str()).unwrap_or("")
    }

    fn approved(&self) -> bool {
        self.status().map(|s| s.approved).unwrap_or(false)
    }

    fn apply_after(&self) -> Option<DateTime<Utc>> {
        self.apply_after_raw().and_then(parse_timestamp)
    }

    fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        self.cooldown_until_raw().and_then(parse_timestamp)
    }

    fn force(&self) -> bool {
        self.annotation_flag(ANNOTATION_FORCE)
    }

    fn apply_now(&self) -> bool {
        self.annotation_flag(ANNOTATION_APPLY_NOW)
    }

    fn manually_approved(&self) -> bool {
        self.annotation_flag(ANNOTATION_APPROVED)
    }

    fn disruption_approved(&self) -> bool {
        self.annotation_flag(ANNOTATION_DISRUPTION_APPROVED)
    }

    fn suspend(&self) -> bool {
        self.annotation_flag(ANNOTATION_SUSPEND)
    }

    fn notification_shift(&self) -> bool {
        self.annotation_flag(ANNOTATION_NOTIFICATION_SHIFT)
    }

    fn release_data(&self) -> ReleaseData {
        ReleaseData {
            is_updating: self.annotation_flag(ANNOTATION_IS_UPDATING),
            notified: self.annotation_flag(ANNOTATION_NOTIFIED),
        }
    }

    fn annotation_flag(&self, key: &str) -> bool {
        self.annotation(key) == Some("true")
    }
}

/// Parse an RFC3339 timestamp, logging and ignoring malformed values
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            warn!(value = %raw, error = %e, "Ignoring malformed timestamp");
            None
        }
    }
}

/// A release paired with its parsed version
#[derive(Debug, Clone)]
pub struct Versioned<R> {
    pub version: Version,
    pub release: R,
}

/// Parse and sort releases ascending by version
///
/// Releases with an unparseable version are dropped with a warning; they can
/// never be ordered and therefore never deployed.
pub fn sort_by_version<R: Release>(releases: Vec<R>) -> Vec<Versioned<R>> {
    let mut sorted: Vec<Versioned<R>> = releases
        .into_iter()
        .filter_map(|release| match release.version() {
            Ok(version) => Some(Versioned { version, release }),
            Err(e) => {
                warn!(release = %release.name(), error = %e, "Skipping release with invalid version");
                None
            }
        })
        .collect();
    sorted.sort_by(|a, b| a.version.cmp(&b.version));
    sorted
}

impl Release for PlatformRelease {
    fn name(&self) -> String {
        self.name_any()
    }

    fn raw_version(&self) -> &str {
        &self.spec.version
    }

    fn status(&self) -> Option<&ReleaseStatus> {
        self.status.as_ref()
    }

    fn apply_after_raw(&self) -> Option<&str> {
        self.spec.apply_after.as_deref()
    }

    fn cooldown_until_raw(&self) -> Option<&str> {
        self.spec.cooldown_until.as_deref()
    }

    fn requirements(&self) -> &BTreeMap<String, String> {
        &self.spec.requirements
    }

    fn disruptions(&self) -> &[String] {
        &self.spec.disruptions
    }

    fn changelog_link(&self) -> Option<&str> {
        self.spec.changelog_link.as_deref()
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().get(key).map(String::as_str)
    }
}

impl Release for ModuleRelease {
    fn name(&self) -> String {
        self.name_any()
    }

    fn raw_version(&self) -> &str {
        &self.spec.version
    }

    fn status(&self) -> Option<&ReleaseStatus> {
        self.status.as_ref()
    }

    fn apply_after_raw(&self) -> Option<&str> {
        self.spec.apply_after.as_deref()
    }

    // Modules have no upstream cooldown
    fn cooldown_until_raw(&self) -> Option<&str> {
        None
    }

    fn requirements(&self) -> &BTreeMap<String, String> {
        &self.spec.requirements
    }

    fn disruptions(&self) -> &[String] {
        &[]
    }

    fn changelog_link(&self) -> Option<&str> {
        self.spec.changelog_link.as_deref()
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().get(key).map(String::as_str)
    }
}
