use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// PlatformRelease is one version of the platform known to the cluster
///
/// Created by the release channel checker, promoted to `Deployed` by the updater.
/// Timestamps are RFC3339 strings.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "updates.kulta.io",
    version = "v1alpha1",
    kind = "PlatformRelease",
    status = "ReleaseStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Transition", "type":"date", "jsonPath":".status.transitionTime"}"#,
    printcolumn = r#"{"name":"Message", "type":"string", "jsonPath":".status.message"}"#
)]
pub struct PlatformReleaseSpec {
    /// Semantic version, e.g. "v1.30.2"
    pub version: String,

    /// Do not deploy before this instant (canary wave or notification shift)
    #[serde(rename = "applyAfter", skip_serializing_if = "Option::is_none")]
    pub apply_after: Option<String>,

    /// Do not deploy before this instant (upstream cooldown)
    #[serde(rename = "cooldownUntil", skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<String>,

    /// Named preconditions checked against the requirement registry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requirements: BTreeMap<String, String>,

    /// Disruption keys requiring approval when disruption mode is Manual
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disruptions: Vec<String>,

    #[serde(rename = "changelogLink", skip_serializing_if = "Option::is_none")]
    pub changelog_link: Option<String>,
}

/// ModuleRelease is one version of an add-on module
///
/// Shares status and scheduling semantics with `PlatformRelease`, so the same
/// updater engine drives both.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "updates.kulta.io",
    version = "v1alpha1",
    kind = "ModuleRelease",
    status = "ReleaseStatus",
    printcolumn = r#"{"name":"Module", "type":"string", "jsonPath":".spec.moduleName"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Message", "type":"string", "jsonPath":".status.message"}"#
)]
pub struct ModuleReleaseSpec {
    #[serde(rename = "moduleName")]
    pub module_name: String,

    pub version: String,

    #[serde(rename = "applyAfter", skip_serializing_if = "Option::is_none")]
    pub apply_after: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requirements: BTreeMap<String, String>,

    #[serde(rename = "changelogLink", skip_serializing_if = "Option::is_none")]
    pub changelog_link: Option<String>,
}

/// Status shared by all release kinds
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ReleaseStatus {
    /// Lifecycle phase (unset for freshly created releases)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<ReleasePhase>,

    /// Human-readable explanation of the current phase
    #[serde(default)]
    pub message: String,

    /// Whether the release is cleared to deploy under the current update mode
    #[serde(default)]
    pub approved: bool,

    /// RFC3339 time of the last phase change
    #[serde(rename = "transitionTime", skip_serializing_if = "Option::is_none")]
    pub transition_time: Option<String>,
}

/// Release lifecycle phase
///
/// Allowed transitions: Pending → Deployed → Superseded, Pending ↔ Suspended,
/// Pending → Skipped. Superseded and Skipped are terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum ReleasePhase {
    Pending,
    Deployed,
    Superseded,
    Suspended,
    Skipped,
}

impl ReleasePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleasePhase::Pending => "Pending",
            ReleasePhase::Deployed => "Deployed",
            ReleasePhase::Superseded => "Superseded",
            ReleasePhase::Suspended => "Suspended",
            ReleasePhase::Skipped => "Skipped",
        }
    }

    /// Terminal phases kept only for history; garbage collection prunes them
    pub fn is_prunable(&self) -> bool {
        matches!(self, ReleasePhase::Superseded | ReleasePhase::Skipped)
    }
}

impl std::fmt::Display for ReleasePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "release_test.rs"]
mod tests;
