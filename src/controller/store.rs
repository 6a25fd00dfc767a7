//! Release store adapter
//!
//! Every mutation the updater performs goes through `ReleaseStore`, so the
//! engine can be driven against Kubernetes in production and an in-memory
//! store in tests.

use crate::controller::clock::Clock;
use crate::controller::release::{
    Release, ReleaseData, ANNOTATION_CHANGE_CAUSE, ANNOTATION_IS_UPDATING, ANNOTATION_NOTIFIED,
    LABEL_MODULE,
};
use crate::controller::version::format_version;
use crate::crd::release::{
    ModuleRelease, ModuleReleaseSpec, PlatformRelease, PlatformReleaseSpec, ReleasePhase,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use semver::Version;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("deploy target {0} not found")]
    TargetNotFound(String),

    #[error("release {0} not found")]
    ReleaseNotFound(String),

    #[error("store error: {0}")]
    Other(String),
}

/// Description of a release to create from channel metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseDraft {
    pub version: Version,
    pub apply_after: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub requirements: BTreeMap<String, String>,
    pub disruptions: Vec<String>,
    pub changelog_link: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

impl ReleaseDraft {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            apply_after: None,
            cooldown_until: None,
            requirements: BTreeMap::new(),
            disruptions: Vec::new(),
            changelog_link: None,
            annotations: BTreeMap::new(),
        }
    }

    /// Object name, e.g. "v1.31.0"
    pub fn name(&self) -> String {
        format_version(&self.version)
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Trait for release persistence and the deploy action
///
/// Production code uses `KubeReleaseStore` (Kubernetes API).
/// Tests use `MockReleaseStore` which mutates releases in memory.
#[async_trait]
pub trait ReleaseStore<R: Release>: Send + Sync {
    async fn list_releases(&self) -> Result<Vec<R>, StoreError>;

    async fn update_status(
        &self,
        release: &R,
        message: &str,
        phase: ReleasePhase,
    ) -> Result<(), StoreError>;

    async fn set_approved(&self, release: &R, approved: bool) -> Result<(), StoreError>;

    /// Merge annotations; `None` removes the key
    async fn patch_annotations(
        &self,
        release: &R,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<(), StoreError>;

    async fn patch_apply_after(
        &self,
        release: &R,
        apply_after: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn save_release_data(&self, release: &R, data: ReleaseData) -> Result<(), StoreError>;

    /// Roll the managed workload to the release version
    async fn deploy(&self, release: &R) -> Result<(), StoreError>;

    async fn create_release(&self, draft: &ReleaseDraft) -> Result<(), StoreError>;

    async fn delete_release(&self, release: &R) -> Result<(), StoreError>;

    /// Whether the currently deployed version is up and ready
    async fn is_target_ready(&self) -> Result<bool, StoreError>;
}

/// Release kinds the Kubernetes store can create
pub trait KubeRelease:
    Release + Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize
{
    fn from_draft(draft: &ReleaseDraft, module: Option<&str>) -> Self;
}

fn draft_metadata(draft: &ReleaseDraft, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(draft.name()),
        annotations: (!draft.annotations.is_empty()).then(|| draft.annotations.clone()),
        labels: (!labels.is_empty()).then_some(labels),
        ..Default::default()
    }
}

impl KubeRelease for PlatformRelease {
    fn from_draft(draft: &ReleaseDraft, _module: Option<&str>) -> Self {
        PlatformRelease {
            metadata: draft_metadata(draft, BTreeMap::new()),
            spec: PlatformReleaseSpec {
                version: draft.name(),
                apply_after: draft.apply_after.map(format_timestamp),
                cooldown_until: draft.cooldown_until.map(format_timestamp),
                requirements: draft.requirements.clone(),
                disruptions: draft.disruptions.clone(),
                changelog_link: draft.changelog_link.clone(),
            },
            status: None,
        }
    }
}

impl KubeRelease for ModuleRelease {
    fn from_draft(draft: &ReleaseDraft, module: Option<&str>) -> Self {
        let module_name = module.unwrap_or_default().to_string();
        let mut meta = draft_metadata(
            draft,
            BTreeMap::from([(LABEL_MODULE.to_string(), module_name.clone())]),
        );
        // Module releases of different modules share one namespace of names
        meta.name = Some(format!("{}-{}", module_name, draft.name()));
        ModuleRelease {
            metadata: meta,
            spec: ModuleReleaseSpec {
                module_name,
                version: draft.name(),
                apply_after: draft.apply_after.map(format_timestamp),
                requirements: draft.requirements.clone(),
                changelog_link: draft.changelog_link.clone(),
            },
            status: None,
        }
    }
}

/// Workload rolled to a new image when a release deploys
///
/// Configuration from environment variables:
/// - KULTA_UPDATER_TARGET_NAMESPACE (default: "kulta-system")
/// - KULTA_UPDATER_TARGET_DEPLOYMENT (required to enable deploys)
/// - KULTA_UPDATER_TARGET_CONTAINER (default: deployment name)
/// - KULTA_UPDATER_IMAGE_REPOSITORY (required to enable deploys)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployTarget {
    pub namespace: String,
    pub deployment: String,
    pub container: String,
    pub repository: String,
}

impl DeployTarget {
    pub fn from_env() -> Option<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("KULTA_UPDATER_{}", name)).filter(|v| !v.trim().is_empty())
        };
        let deployment = var("TARGET_DEPLOYMENT")?;
        let repository = var("IMAGE_REPOSITORY")?;
        Some(DeployTarget {
            namespace: var("TARGET_NAMESPACE").unwrap_or_else(|| "kulta-system".to_string()),
            container: var("TARGET_CONTAINER").unwrap_or_else(|| deployment.clone()),
            deployment,
            repository,
        })
    }

    /// Image reference for a version, e.g. "registry.example.com/platform:v1.31.0"
    pub fn image_for(&self, version: &Version) -> String {
        format!("{}:{}", self.repository, format_version(version))
    }
}

/// Build the strategic-merge patch that rolls the target container
fn build_deploy_patch(target: &DeployTarget, version: &Version) -> Value {
    json!({
        "metadata": {
            "annotations": {
                ANNOTATION_CHANGE_CAUSE: format!("release {}", format_version(version))
            }
        },
        "spec": {
            "template": {
                "spec": {
                    "containers": [{
                        "name": target.container,
                        "image": target.image_for(version)
                    }]
                }
            }
        }
    })
}

/// Ready when every desired replica reports ready and the rollout is observed
fn deployment_is_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };

    let observed = match (deployment.metadata.generation, status.observed_generation) {
        (Some(generation), Some(observed)) => observed >= generation,
        _ => true,
    };

    observed
        && status.ready_replicas.unwrap_or(0) >= desired
        && status.updated_replicas.unwrap_or(0) >= desired
}

fn annotations_patch(annotations: BTreeMap<String, Option<String>>) -> Value {
    let map: Map<String, Value> = annotations
        .into_iter()
        .map(|(k, v)| (k, v.map(Value::String).unwrap_or(Value::Null)))
        .collect();
    json!({ "metadata": { "annotations": map } })
}

/// Kubernetes-backed store for a cluster-scoped release kind
pub struct KubeReleaseStore<K> {
    api: Api<K>,
    client: kube::Client,
    target: Option<DeployTarget>,
    module: Option<String>,
    clock: Arc<dyn Clock>,
}

impl<K: KubeRelease> KubeReleaseStore<K> {
    pub fn new(client: kube::Client, target: Option<DeployTarget>, clock: Arc<dyn Clock>) -> Self {
        Self {
            api: Api::all(client.clone()),
            client,
            target,
            module: None,
            clock,
        }
    }

    /// Scope listing and creation to one module's releases
    pub fn for_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    fn list_params(&self) -> ListParams {
        match &self.module {
            Some(module) => ListParams::default().labels(&format!("{}={}", LABEL_MODULE, module)),
            None => ListParams::default(),
        }
    }

    async fn patch_object(&self, release: &K, patch: Value) -> Result<(), StoreError> {
        self.api
            .patch(
                &release.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn patch_status(&self, release: &K, status: Value) -> Result<(), StoreError> {
        self.api
            .patch_status(
                &release.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&json!({ "status": status })),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<K: KubeRelease> ReleaseStore<K> for KubeReleaseStore<K> {
    async fn list_releases(&self) -> Result<Vec<K>, StoreError> {
        let list = self.api.list(&self.list_params()).await?;
        Ok(list.items)
    }

    async fn update_status(
        &self,
        release: &K,
        message: &str,
        phase: ReleasePhase,
    ) -> Result<(), StoreError> {
        let mut status = json!({
            "phase": phase,
            "message": message,
        });
        if release.phase() != Some(phase) {
            status["transitionTime"] = Value::String(format_timestamp(self.clock.now()));
        }

        info!(
            release = %Release::name(release),
            phase = %phase,
            message = %message,
            "Updating release status"
        );
        self.patch_status(release, status).await
    }

    async fn set_approved(&self, release: &K, approved: bool) -> Result<(), StoreError> {
        self.patch_status(release, json!({ "approved": approved }))
            .await
    }

    async fn patch_annotations(
        &self,
        release: &K,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<(), StoreError> {
        self.patch_object(release, annotations_patch(annotations))
            .await
    }

    async fn patch_apply_after(
        &self,
        release: &K,
        apply_after: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.patch_object(
            release,
            json!({ "spec": { "applyAfter": format_timestamp(apply_after) } }),
        )
        .await
    }

    async fn save_release_data(&self, release: &K, data: ReleaseData) -> Result<(), StoreError> {
        self.patch_annotations(
            release,
            BTreeMap::from([
                (
                    ANNOTATION_IS_UPDATING.to_string(),
                    Some(data.is_updating.to_string()),
                ),
                (
                    ANNOTATION_NOTIFIED.to_string(),
                    Some(data.notified.to_string()),
                ),
            ]),
        )
        .await
    }

    async fn deploy(&self, release: &K) -> Result<(), StoreError> {
        let Some(target) = &self.target else {
            info!(
                release = %Release::name(release),
                "No deploy target configured, recording release as deployed"
            );
            return Ok(());
        };

        let version = release
            .version()
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &target.namespace);

        match deployments
            .patch(
                &target.deployment,
                &PatchParams::default(),
                &Patch::Strategic(&build_deploy_patch(target, &version)),
            )
            .await
        {
            Ok(_) => {
                info!(
                    release = %Release::name(release),
                    deployment = %target.deployment,
                    image = %target.image_for(&version),
                    "Deployment image updated"
                );
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 404 => Err(StoreError::TargetNotFound(
                format!("{}/{}", target.namespace, target.deployment),
            )),
            Err(e) => Err(StoreError::KubeError(e)),
        }
    }

    async fn create_release(&self, draft: &ReleaseDraft) -> Result<(), StoreError> {
        let object = K::from_draft(draft, self.module.as_deref());
        match self.api.create(&PostParams::default(), &object).await {
            Ok(_) => {
                info!(release = %draft.name(), "Release created");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                debug!(release = %draft.name(), "Release already exists");
                Ok(())
            }
            Err(e) => Err(StoreError::KubeError(e)),
        }
    }

    async fn delete_release(&self, release: &K) -> Result<(), StoreError> {
        match self
            .api
            .delete(&release.name_any(), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(StoreError::KubeError(e)),
        }
    }

    async fn is_target_ready(&self) -> Result<bool, StoreError> {
        let Some(target) = &self.target else {
            return Ok(true);
        };
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &target.namespace);
        match deployments.get_opt(&target.deployment).await? {
            Some(deployment) => Ok(deployment_is_ready(&deployment)),
            None => Ok(false),
        }
    }
}

/// In-memory store for testing - applies every write to its releases
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MockReleaseStore {
    inner: Arc<std::sync::Mutex<MockState>>,
}

#[cfg(test)]
#[derive(Default)]
pub struct MockState {
    pub releases: Vec<PlatformRelease>,
    pub status_writes: Vec<(String, ReleasePhase, String)>,
    pub deployed: Vec<String>,
    pub created: Vec<ReleaseDraft>,
    pub deleted: Vec<String>,
    pub target_not_ready: bool,
    pub fail_deploy: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockReleaseStore {
    pub fn new(releases: Vec<PlatformRelease>) -> Self {
        let store = Self::default();
        store.inner.lock().unwrap().releases = releases;
        store
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.inner.lock().unwrap()
    }

    pub fn set_target_ready(&self, ready: bool) {
        self.state().target_not_ready = !ready;
    }

    pub fn get(&self, name: &str) -> PlatformRelease {
        self.state()
            .releases
            .iter()
            .find(|r| r.name_any() == name)
            .cloned()
            .unwrap_or_else(|| panic!("release {} not in mock store", name))
    }

    pub fn phase_of(&self, name: &str) -> Option<ReleasePhase> {
        self.get(name).phase()
    }

    pub fn message_of(&self, name: &str) -> String {
        self.get(name).message().to_string()
    }

    fn with_release<F>(&self, name: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut PlatformRelease),
    {
        let mut state = self.state();
        let release = state
            .releases
            .iter_mut()
            .find(|r| r.name_any() == name)
            .ok_or_else(|| StoreError::ReleaseNotFound(name.to_string()))?;
        f(release);
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl ReleaseStore<PlatformRelease> for MockReleaseStore {
    async fn list_releases(&self) -> Result<Vec<PlatformRelease>, StoreError> {
        Ok(self.state().releases.clone())
    }

    async fn update_status(
        &self,
        release: &PlatformRelease,
        message: &str,
        phase: ReleasePhase,
    ) -> Result<(), StoreError> {
        let name = release.name_any();
        self.with_release(&name, |r| {
            let status = r.status.get_or_insert_with(Default::default);
            status.phase = Some(phase);
            status.message = message.to_string();
        })?;
        self.state()
            .status_writes
            .push((name, phase, message.to_string()));
        Ok(())
    }

    async fn set_approved(
        &self,
        release: &PlatformRelease,
        approved: bool,
    ) -> Result<(), StoreError> {
        self.with_release(&release.name_any(), |r| {
            r.status.get_or_insert_with(Default::default).approved = approved;
        })
    }

    async fn patch_annotations(
        &self,
        release: &PlatformRelease,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<(), StoreError> {
        self.with_release(&release.name_any(), |r| {
            let current = r.metadata.annotations.get_or_insert_with(BTreeMap::new);
            for (key, value) in annotations {
                match value {
                    Some(v) => {
                        current.insert(key, v);
                    }
                    None => {
                        current.remove(&key);
                    }
                }
            }
        })
    }

    async fn patch_apply_after(
        &self,
        release: &PlatformRelease,
        apply_after: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_release(&release.name_any(), |r| {
            r.spec.apply_after = Some(format_timestamp(apply_after));
        })
    }

    async fn save_release_data(
        &self,
        release: &PlatformRelease,
        data: ReleaseData,
    ) -> Result<(), StoreError> {
        self.patch_annotations(
            release,
            BTreeMap::from([
                (
                    ANNOTATION_IS_UPDATING.to_string(),
                    Some(data.is_updating.to_string()),
                ),
                (
                    ANNOTATION_NOTIFIED.to_string(),
                    Some(data.notified.to_string()),
                ),
            ]),
        )
        .await
    }

    async fn deploy(&self, release: &PlatformRelease) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.fail_deploy {
            return Err(StoreError::Other("deploy failed".into()));
        }
        state.deployed.push(release.name_any());
        Ok(())
    }

    async fn create_release(&self, draft: &ReleaseDraft) -> Result<(), StoreError> {
        let mut state = self.state();
        state.created.push(draft.clone());
        state
            .releases
            .push(PlatformRelease::from_draft(draft, None));
        Ok(())
    }

    async fn delete_release(&self, release: &PlatformRelease) -> Result<(), StoreError> {
        let name = release.name_any();
        let mut state = self.state();
        state.releases.retain(|r| r.name_any() != name);
        state.deleted.push(name);
        Ok(())
    }

    async fn is_target_ready(&self) -> Result<bool, StoreError> {
        Ok(!self.state().target_not_ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};

    fn target() -> DeployTarget {
        DeployTarget {
            namespace: "kulta-system".into(),
            deployment: "platform".into(),
            container: "manager".into(),
            repository: "registry.example.com/platform".into(),
        }
    }

    #[test]
    fn test_deploy_target_from_vars() {
        let vars = |key: &str| match key {
            "KULTA_UPDATER_TARGET_DEPLOYMENT" => Some("platform".to_string()),
            "KULTA_UPDATER_IMAGE_REPOSITORY" => Some("registry.example.com/platform".to_string()),
            _ => None,
        };
        let t = DeployTarget::from_vars(vars).unwrap();
        assert_eq!(t.namespace, "kulta-system");
        assert_eq!(t.container, "platform");

        assert_eq!(DeployTarget::from_vars(|_| None), None);
    }

    #[test]
    fn test_deploy_patch_sets_image_by_container_name() {
        let patch = build_deploy_patch(&target(), &Version::new(1, 31, 0));
        let container = &patch["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["name"], "manager");
        assert_eq!(container["image"], "registry.example.com/platform:v1.31.0");
        assert_eq!(
            patch["metadata"]["annotations"][ANNOTATION_CHANGE_CAUSE],
            "release v1.31.0"
        );
    }

    #[test]
    fn test_annotations_patch_nulls_removed_keys() {
        let patch = annotations_patch(BTreeMap::from([
            ("a".to_string(), Some("true".to_string())),
            ("b".to_string(), None),
        ]));
        assert_eq!(patch["metadata"]["annotations"]["a"], "true");
        assert!(patch["metadata"]["annotations"]["b"].is_null());
    }

    #[test]
    fn test_deployment_readiness() {
        let mut deployment = Deployment {
            metadata: ObjectMeta {
                generation: Some(3),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            status: None,
        };
        assert!(!deployment_is_ready(&deployment));

        deployment.status = Some(DeploymentStatus {
            observed_generation: Some(3),
            ready_replicas: Some(1),
            updated_replicas: Some(2),
            ..Default::default()
        });
        assert!(!deployment_is_ready(&deployment));

        deployment.status = Some(DeploymentStatus {
            observed_generation: Some(3),
            ready_replicas: Some(2),
            updated_replicas: Some(2),
            ..Default::default()
        });
        assert!(deployment_is_ready(&deployment));

        deployment.metadata.generation = Some(4);
        assert!(!deployment_is_ready(&deployment));
    }

    #[test]
    fn test_platform_release_from_draft() {
        let mut draft = ReleaseDraft::new(Version::new(1, 31, 0));
        draft.disruptions = vec!["ingressNginx".into()];
        draft.apply_after = DateTime::parse_from_rfc3339("2026-03-02T10:00:00Z")
            .ok()
            .map(|t| t.with_timezone(&Utc));

        let release = PlatformRelease::from_draft(&draft, None);
        assert_eq!(release.name_any(), "v1.31.0");
        assert_eq!(release.spec.version, "v1.31.0");
        assert_eq!(release.spec.apply_after.as_deref(), Some("2026-03-02T10:00:00Z"));
        assert_eq!(release.spec.disruptions, vec!["ingressNginx".to_string()]);
        assert!(release.status.is_none());
    }

    #[test]
    fn test_module_release_from_draft_is_labelled() {
        let draft = ReleaseDraft::new(Version::new(0, 4, 2));
        let release = ModuleRelease::from_draft(&draft, Some("ingress"));
        assert_eq!(release.name_any(), "ingress-v0.4.2");
        assert_eq!(release.spec.module_name, "ingress");
        assert_eq!(
            release.labels().get(LABEL_MODULE).map(String::as_str),
            Some("ingress")
        );
    }

    #[tokio::test]
    async fn test_mock_store_applies_writes() {
        let store = MockReleaseStore::new(vec![PlatformRelease::from_draft(
            &ReleaseDraft::new(Version::new(1, 30, 0)),
            None,
        )]);
        let release = store.get("v1.30.0");

        store
            .update_status(&release, "", ReleasePhase::Deployed)
            .await
            .unwrap();
        store
            .save_release_data(
                &release,
                ReleaseData {
                    is_updating: true,
                    notified: false,
                },
            )
            .await
            .unwrap();

        let updated = store.get("v1.30.0");
        assert_eq!(updated.phase(), Some(ReleasePhase::Deployed));
        assert!(updated.release_data().is_updating);
        assert_eq!(store.state().status_writes.len(), 1);
    }
}
