//! Release fixtures shared by controller tests

use crate::crd::release::{PlatformRelease, PlatformReleaseSpec, ReleasePhase, ReleaseStatus};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

pub struct ReleaseBuilder {
    release: PlatformRelease,
}

/// Start a `PlatformRelease` named after its version
pub fn release(version: &str) -> ReleaseBuilder {
    ReleaseBuilder {
        release: PlatformRelease {
            metadata: ObjectMeta {
                name: Some(version.to_string()),
                ..Default::default()
            },
            spec: PlatformReleaseSpec {
                version: version.to_string(),
                ..Default::default()
            },
            status: None,
        },
    }
}

impl ReleaseBuilder {
    pub fn phase(mut self, phase: ReleasePhase) -> Self {
        self.status().phase = Some(phase);
        self
    }

    pub fn message(mut self, message: &str) -> Self {
        self.status().message = message.to_string();
        self
    }

    pub fn approved(mut self, approved: bool) -> Self {
        self.status().approved = approved;
        self
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.release
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn flag(self, key: &str) -> Self {
        self.annotation(key, "true")
    }

    pub fn apply_after(mut self, rfc3339: &str) -> Self {
        self.release.spec.apply_after = Some(rfc3339.to_string());
        self
    }

    pub fn cooldown_until(mut self, rfc3339: &str) -> Self {
        self.release.spec.cooldown_until = Some(rfc3339.to_string());
        self
    }

    pub fn requirement(mut self, key: &str, value: &str) -> Self {
        self.release
            .spec
            .requirements
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn disruption(mut self, key: &str) -> Self {
        self.release.spec.disruptions.push(key.to_string());
        self
    }

    pub fn build(self) -> PlatformRelease {
        self.release
    }

    fn status(&mut self) -> &mut ReleaseStatus {
        self.release.status.get_or_insert_with(Default::default)
    }
}

pub fn pending(version: &str) -> PlatformRelease {
    release(version).phase(ReleasePhase::Pending).build()
}

pub fn deployed(version: &str) -> PlatformRelease {
    release(version).phase(ReleasePhase::Deployed).build()
}
