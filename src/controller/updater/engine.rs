//! Release update orchestrator
//!
//! One pass: normalize the release set, predict the candidate, classify it,
//! gate it on requirements, disruptions and deploy time, then either
//! postpone it with an explanatory status or deploy it and settle the
//! phases of everything it replaces.

use crate::controller::clock::Clock;
use crate::controller::notification::{NotificationError, NotificationSink, WebhookData};
use crate::controller::release::{
    sort_by_version, Release, ReleaseData, Versioned, ANNOTATION_APPLY_NOW,
    ANNOTATION_DISRUPTION_APPROVED, ANNOTATION_FORCE, ANNOTATION_NOTIFICATION_SHIFT,
    ANNOTATION_SUSPEND,
};
use crate::controller::requirements::{RequirementChecker, RequirementError};
use crate::controller::settings::{DisruptionApprovalMode, NotificationReleaseType, Settings};
use crate::controller::store::{ReleaseStore, StoreError};
use crate::controller::updater::deploy_time::{DeployTimeChecker, DeployTimeResult};
use crate::controller::updater::task::{Task, TaskCalculator, TaskError, TaskType};
use crate::controller::version::{format_version, is_greater, same_line};
use crate::crd::release::ReleasePhase;
use crate::server::metrics::{SharedMetrics, BLOCKED_DISRUPTION, BLOCKED_REQUIREMENT};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const SKIPPED_MESSAGE: &str = "Skipped because a newer release is already deployed";
pub const SUSPENDED_MESSAGE: &str = "Release is suspended";

/// Requeue used when a block carries no time of its own
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("release {0} is not pending")]
    NotPending(String),

    #[error("release {0} is already deployed")]
    AlreadyDeployed(String),

    #[error("requirements not met: {0}")]
    RequirementsNotMet(String),

    #[error("disruption approval required: {0}")]
    DisruptionApprovalRequired(String),

    #[error("release not ready for deploy: {message}")]
    NotReadyForDeploy {
        message: String,
        retry_after: Duration,
    },

    #[error("release store error: {0}")]
    Store(#[from] StoreError),

    #[error("release notification failed: {0}")]
    Notification(#[from] NotificationError),
}

impl UpdaterError {
    /// Policy blocks are expected outcomes, not failures
    pub fn is_policy_block(&self) -> bool {
        matches!(
            self,
            UpdaterError::RequirementsNotMet(_)
                | UpdaterError::DisruptionApprovalRequired(_)
                | UpdaterError::NotReadyForDeploy { .. }
        )
    }

    /// Read/write races resolved by the next pass
    pub fn is_race(&self) -> bool {
        matches!(
            self,
            UpdaterError::NotPending(_) | UpdaterError::AlreadyDeployed(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            UpdaterError::NotReadyForDeploy { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<TaskError> for UpdaterError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::NotPending(name) => UpdaterError::NotPending(name),
            TaskError::AlreadyDeployed(name) => UpdaterError::AlreadyDeployed(name),
            TaskError::NotFound(name) => UpdaterError::Store(StoreError::ReleaseNotFound(name)),
        }
    }
}

/// What a pass did when it did not block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing pending above the deployed release
    UpToDate,
    Deployed(String),
    Awaiting { release: String, message: String },
    Skipped(String),
}

/// Indices into the version-sorted release list
#[derive(Debug, Default)]
struct Prediction {
    deployed: Option<usize>,
    forced: Option<usize>,
    predicted: Option<usize>,
    skipped_patches: Vec<usize>,
    stale: Vec<usize>,
    /// First release held back by its requirements, with its status message
    requirement_block: Option<(usize, String)>,
}

pub struct Updater<R: Release> {
    store: Arc<dyn ReleaseStore<R>>,
    requirements: Arc<dyn RequirementChecker>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    metrics: Option<SharedMetrics>,
}

impl<R: Release> Updater<R> {
    pub fn new(
        store: Arc<dyn ReleaseStore<R>>,
        requirements: Arc<dyn RequirementChecker>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            requirements,
            notifier,
            clock,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<SharedMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Run one update pass against a settings snapshot
    pub async fn run(&self, settings: &Settings) -> Result<UpdateOutcome, UpdaterError> {
        let mut releases = self.store.list_releases().await?;
        if self.normalize(&releases, settings).await? {
            releases = self.store.list_releases().await?;
        }

        let sorted = sort_by_version(releases);
        if sorted.is_empty() {
            return Ok(UpdateOutcome::UpToDate);
        }

        let prediction = self.predict(&sorted).await?;

        for &index in &prediction.stale {
            self.set_status(&sorted[index].release, ReleasePhase::Skipped, SKIPPED_MESSAGE)
                .await?;
        }

        if let Some(forced) = prediction.forced {
            if prediction.deployed.map_or(true, |d| forced > d) {
                return self.deploy_forced(&sorted, forced).await;
            }
        }

        if prediction.deployed == Some(sorted.len() - 1) {
            debug!("Newest release is deployed");
            return Ok(UpdateOutcome::UpToDate);
        }

        let Some(predicted) = prediction.predicted else {
            if let Some((_, message)) = prediction.requirement_block {
                return Err(UpdaterError::RequirementsNotMet(message));
            }
            return Ok(UpdateOutcome::UpToDate);
        };

        let candidate = &sorted[predicted];
        // A release held by its requirements must not make the candidate look stale
        let blocked = prediction.requirement_block.as_ref().map(|(i, _)| *i);
        let all: Vec<R> = sorted
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != blocked)
            .map(|(_, v)| v.release.clone())
            .collect();
        let task = TaskCalculator::new(settings.is_lts_channel()).calculate(&candidate.release, &all)?;
        let name = candidate.release.name();
        info!(
            release = %name,
            task = %task.task_type,
            is_patch = task.is_patch,
            queue_depth = task.queue_depth,
            "Calculated release task"
        );

        match task.task_type {
            TaskType::Skip => {
                self.set_status(&candidate.release, ReleasePhase::Skipped, SKIPPED_MESSAGE)
                    .await?;
                Ok(UpdateOutcome::Skipped(name))
            }
            TaskType::Await => {
                self.set_status(&candidate.release, ReleasePhase::Pending, &task.message)
                    .await?;
                Ok(UpdateOutcome::Awaiting {
                    release: name,
                    message: task.message,
                })
            }
            TaskType::Process => {
                self.process(settings, &sorted, &prediction, predicted, &task)
                    .await
            }
        }
    }

    /// Returns true when any release was written
    async fn normalize(&self, releases: &[R], settings: &Settings) -> Result<bool, UpdaterError> {
        let mut changed = false;
        let mut waiting_manual = 0usize;

        for release in releases {
            let name = release.name();
            let mut phase = release.phase();

            if phase.is_none() {
                debug!(release = %name, "Initializing release phase");
                self.store
                    .update_status(release, "", ReleasePhase::Pending)
                    .await?;
                self.store.set_approved(release, true).await?;
                phase = Some(ReleasePhase::Pending);
                changed = true;
            }

            if phase == Some(ReleasePhase::Pending) && release.suspend() {
                info!(release = %name, "Suspending release");
                self.store
                    .update_status(release, SUSPENDED_MESSAGE, ReleasePhase::Suspended)
                    .await?;
                self.store
                    .patch_annotations(
                        release,
                        BTreeMap::from([(ANNOTATION_SUSPEND.to_string(), None)]),
                    )
                    .await?;
                changed = true;
                continue;
            }

            if settings.in_manual_mode() && phase == Some(ReleasePhase::Pending) {
                let approved = release.manually_approved();
                if release.approved() != approved {
                    self.store.set_approved(release, approved).await?;
                    changed = true;
                }
                if !approved {
                    waiting_manual += 1;
                }
                if let Some(metrics) = &self.metrics {
                    metrics.set_release_waiting_manual(&name, !approved);
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_pending_manual_releases(waiting_manual);
        }
        Ok(changed)
    }

    async fn predict(&self, sorted: &[Versioned<R>]) -> Result<Prediction, UpdaterError> {
        let mut prediction = Prediction {
            deployed: sorted
                .iter()
                .rposition(|v| v.release.phase() == Some(ReleasePhase::Deployed)),
            forced: sorted.iter().rposition(|v| {
                v.release.phase() == Some(ReleasePhase::Pending) && v.release.force()
            }),
            ..Default::default()
        };
        let deployed_version = prediction.deployed.map(|d| &sorted[d].version);
        let mut closed = false;

        for (index, entry) in sorted.iter().enumerate() {
            if entry.release.phase() != Some(ReleasePhase::Pending) {
                continue;
            }
            if deployed_version.is_some_and(|d| !is_greater(&entry.version, d)) {
                prediction.stale.push(index);
                continue;
            }
            if closed {
                continue;
            }
            if let Some(previous) = prediction.predicted {
                if !same_line(&sorted[previous].version, &entry.version) {
                    closed = true;
                    continue;
                }
            }

            if let Err(message) = self.check_requirements(&entry.release) {
                self.set_status(&entry.release, ReleasePhase::Pending, &message)
                    .await?;
                prediction.requirement_block = Some((index, message));
                closed = true;
                continue;
            }

            if let Some(previous) = prediction.predicted {
                prediction.skipped_patches.push(previous);
            }
            prediction.predicted = Some(index);
        }

        Ok(prediction)
    }

    /// First failing requirement as a status message
    fn check_requirements(&self, release: &R) -> Result<(), String> {
        let name = release.name();
        let mut result = Ok(());
        for (key, value) in release.requirements() {
            let message = match self.requirements.check_requirement(key, value) {
                Ok(true) => continue,
                Ok(false) => format!(
                    "\"{}\" requirement for release \"{}\" not met: expected {}",
                    key,
                    release.raw_version(),
                    value
                ),
                Err(RequirementError::NotRegistered(_)) => {
                    error!(release = %name, requirement = %key, "Requirement is not registered");
                    format!("\"{}\" requirement is not registered", key)
                }
                Err(RequirementError::NotMet(reason)) => format!(
                    "\"{}\" requirement for release \"{}\" not met: {}",
                    key,
                    release.raw_version(),
                    reason
                ),
            };
            warn!(release = %name, requirement = %key, reason = %message, "Release requirement not met");
            result = Err(message);
            break;
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_release_blocked(&name, BLOCKED_REQUIREMENT, result.is_err());
        }
        result
    }

    async fn process(
        &self,
        settings: &Settings,
        sorted: &[Versioned<R>],
        prediction: &Prediction,
        predicted: usize,
        task: &Task,
    ) -> Result<UpdateOutcome, UpdaterError> {
        let candidate = &sorted[predicted].release;
        let previous = prediction.deployed.map(|d| &sorted[d].release);
        let skipped: Vec<&R> = prediction
            .skipped_patches
            .iter()
            .map(|&i| &sorted[i].release)
            .collect();

        if task.is_single {
            info!(release = %candidate.name(), "Deploying single release");
            return self.deploy(candidate, previous, &skipped).await;
        }

        if !task.is_patch {
            self.check_disruptions(settings, candidate).await?;
        }

        let now = self.clock.now();
        let notifies = settings.notification.webhook_url.is_some()
            && (!task.is_patch
                || settings.notification.release_type == NotificationReleaseType::All);
        let mut data = candidate.release_data();
        if !notifies {
            // The lead-time gate only applies to releases that get a notification
            data.notified = true;
        }

        let checker = DeployTimeChecker::new(settings, now);
        let result = if task.is_patch {
            checker.process_patch(candidate, data)
        } else {
            let ready = self.store.is_target_ready().await?;
            checker.process_minor(candidate, data, ready, task.deployed.as_ref())
        };

        if notifies && !data.notified {
            self.notify(settings, candidate, &result).await?;
        }

        if let Some(message) = result.awaiting_target {
            self.set_status(candidate, ReleasePhase::Pending, &message)
                .await?;
            return Err(UpdaterError::NotReadyForDeploy {
                message,
                retry_after: DEFAULT_RETRY_AFTER,
            });
        }

        if result.reason.is_delayed() {
            return self.postpone(candidate, &result, now).await;
        }

        self.deploy(candidate, previous, &skipped).await
    }

    async fn check_disruptions(&self, settings: &Settings, release: &R) -> Result<(), UpdaterError> {
        let name = release.name();
        let reasons: Vec<String> = if settings.disruption_approval_mode
            == DisruptionApprovalMode::Auto
            || release.disruption_approved()
        {
            Vec::new()
        } else {
            release
                .disruptions()
                .iter()
                .filter_map(|key| self.requirements.has_disruption(key))
                .collect()
        };

        if let Some(metrics) = &self.metrics {
            metrics.set_release_blocked(&name, BLOCKED_DISRUPTION, !reasons.is_empty());
        }
        if reasons.is_empty() {
            return Ok(());
        }

        let message = format!(
            "Release requires disruption approval (`kubectl annotate {}Release {} {}=true`): {}",
            settings.subject.as_str(),
            name,
            ANNOTATION_DISRUPTION_APPROVED,
            reasons.join(", ")
        );
        info!(release = %name, reasons = ?reasons, "Release blocked by disruption approval");
        self.set_status(release, ReleasePhase::Pending, &message)
            .await?;
        Err(UpdaterError::DisruptionApprovalRequired(message))
    }

    async fn notify(
        &self,
        settings: &Settings,
        release: &R,
        result: &DeployTimeResult,
    ) -> Result<(), UpdaterError> {
        let payload = WebhookData::new(
            settings.subject,
            release.raw_version(),
            release.requirements(),
            release.changelog_link(),
            // manual approval resets apply_time; announce the lead-time floor instead
            result.apply_after.unwrap_or(result.apply_time),
        );

        if let Err(e) = self.notifier.notify(&payload).await {
            warn!(release = %release.name(), error = %e, "Release notification failed");
            let message = format!("Release is blocked, failed to send release notification: {}", e);
            self.set_status(release, ReleasePhase::Pending, &message)
                .await?;
            return Err(UpdaterError::Notification(e));
        }

        info!(release = %release.name(), apply_time = %result.apply_time, "Release notification sent");
        if let Some(apply_after) = result.apply_after {
            self.store.patch_apply_after(release, apply_after).await?;
            self.store
                .patch_annotations(
                    release,
                    BTreeMap::from([(
                        ANNOTATION_NOTIFICATION_SHIFT.to_string(),
                        Some("true".to_string()),
                    )]),
                )
                .await?;
        }
        self.store
            .save_release_data(
                release,
                ReleaseData {
                    is_updating: false,
                    notified: true,
                },
            )
            .await?;
        Ok(())
    }

    async fn postpone(
        &self,
        release: &R,
        result: &DeployTimeResult,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, UpdaterError> {
        // An apply time of "now" means the gate clears on approval, not at a time
        let apply_time = (result.apply_time > now).then_some(result.apply_time);
        let message = result.reason.message(&release.name(), apply_time);
        info!(
            release = %release.name(),
            reason = %result.reason,
            apply_time = %result.apply_time,
            "Release deploy postponed"
        );
        self.set_status(release, ReleasePhase::Pending, &message)
            .await?;

        let retry_after = (result.apply_time - now).to_std().unwrap_or(Duration::ZERO);
        Err(UpdaterError::NotReadyForDeploy {
            message,
            retry_after,
        })
    }

    async fn deploy(
        &self,
        release: &R,
        previous: Option<&R>,
        skipped: &[&R],
    ) -> Result<UpdateOutcome, UpdaterError> {
        let name = release.name();
        self.store
            .save_release_data(
                release,
                ReleaseData {
                    is_updating: true,
                    notified: false,
                },
            )
            .await?;
        self.store.deploy(release).await?;
        self.set_status(release, ReleasePhase::Deployed, "").await?;
        if release.apply_now() {
            self.store
                .patch_annotations(
                    release,
                    BTreeMap::from([(ANNOTATION_APPLY_NOW.to_string(), None)]),
                )
                .await?;
        }

        if let Some(previous) = previous {
            self.set_status(previous, ReleasePhase::Superseded, "")
                .await?;
        }
        for patch in skipped {
            self.set_status(patch, ReleasePhase::Skipped, SKIPPED_MESSAGE)
                .await?;
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_release_waiting_manual(&name, false);
        }
        info!(
            release = %name,
            superseded = ?previous.map(|p| p.name()),
            skipped = skipped.len(),
            "Release deployed"
        );
        Ok(UpdateOutcome::Deployed(name))
    }

    async fn deploy_forced(
        &self,
        sorted: &[Versioned<R>],
        forced: usize,
    ) -> Result<UpdateOutcome, UpdaterError> {
        let release = &sorted[forced].release;
        info!(
            release = %release.name(),
            version = %format_version(&sorted[forced].version),
            "Force deploying release"
        );

        self.store
            .save_release_data(
                release,
                ReleaseData {
                    is_updating: true,
                    notified: false,
                },
            )
            .await?;
        self.store.deploy(release).await?;
        self.set_status(release, ReleasePhase::Deployed, "").await?;
        self.store
            .patch_annotations(
                release,
                BTreeMap::from([
                    (ANNOTATION_FORCE.to_string(), None),
                    (ANNOTATION_APPLY_NOW.to_string(), None),
                ]),
            )
            .await?;

        for older in &sorted[..forced] {
            match older.release.phase() {
                Some(ReleasePhase::Deployed) => {
                    self.set_status(&older.release, ReleasePhase::Superseded, "")
                        .await?
                }
                Some(ReleasePhase::Pending) => {
                    self.set_status(&older.release, ReleasePhase::Skipped, SKIPPED_MESSAGE)
                        .await?
                }
                _ => {}
            }
        }

        Ok(UpdateOutcome::Deployed(release.name()))
    }

    /// Status write that is a no-op when phase and message are unchanged
    async fn set_status(
        &self,
        release: &R,
        phase: ReleasePhase,
        message: &str,
    ) -> Result<(), UpdaterError> {
        if release.phase() == Some(phase) && release.message() == message {
            return Ok(());
        }
        self.store.update_status(release, message, phase).await?;
        Ok(())
    }
}
