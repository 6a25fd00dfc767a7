//! Release channel checker
//!
//! Polls the release channel, and turns the channel tip into a new release
//! record. Canary waves, cooldown and notification shifts are stamped onto
//! the record here; the updater only reads them back.

use crate::controller::canary::{calculate_release_delay, CanaryError, CanarySettings};
use crate::controller::clock::Clock;
use crate::controller::release::{parse_timestamp, sort_by_version, Release, ANNOTATION_SUSPEND};
use crate::controller::settings::{Settings, SettingsError};
use crate::controller::step::{next_version, StepError};
use crate::controller::store::{ReleaseDraft, ReleaseStore, StoreError};
use crate::controller::version::{
    format_version, is_greater, is_updating_sequence, line_key, parse_version, same_line,
    VersionError,
};
use crate::crd::release::ReleasePhase;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_CHANNEL_CHECK_INTERVAL: Duration = Duration::from_secs(3 * 60 * 60);
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("release metadata fetch failed: {0}")]
    Fetch(String),

    #[error("invalid release metadata: {0}")]
    InvalidMetadata(String),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("pre-release version {0} is not allowed in a release channel")]
    PreRelease(String),

    #[error("step resolution failed: {0}")]
    Step(#[from] StepError),

    #[error("canary settings invalid: {0}")]
    Canary(#[from] CanaryError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Release metadata published per channel and per tag
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseMetadata {
    pub version: String,
    /// Canary settings keyed by channel name
    #[serde(default)]
    pub canary: BTreeMap<String, CanarySettings>,
    #[serde(default)]
    pub requirements: BTreeMap<String, String>,
    /// Disruption keys per release line ("major.minor")
    #[serde(default)]
    pub disruptions: BTreeMap<String, Vec<String>>,
    /// RFC3339 instant before which the release must not deploy
    #[serde(default)]
    pub cooldown: Option<String>,
    #[serde(default)]
    pub suspend: bool,
    #[serde(default)]
    pub changelog_link: Option<String>,
}

impl ReleaseMetadata {
    /// Parsed version; pre-release versions are rejected
    pub fn release_version(&self) -> Result<Version, RegistrarError> {
        if self.version.trim().is_empty() {
            return Err(RegistrarError::InvalidMetadata(
                "version is missing".to_string(),
            ));
        }
        let version = parse_version(&self.version)?;
        if !version.pre.is_empty() {
            return Err(RegistrarError::PreRelease(self.version.clone()));
        }
        Ok(version)
    }
}

/// Trait for reading release channel metadata
///
/// Production code uses `HttpMetadataSource`.
/// Tests use an in-memory source.
#[async_trait]
pub trait ReleaseMetadataSource: Send + Sync {
    /// Metadata for a channel name ("stable") or a tag ("v1.31.4")
    async fn fetch_metadata(&self, channel_or_tag: &str) -> Result<ReleaseMetadata, RegistrarError>;

    /// All published tags, e.g. ["v1.30.0", "v1.31.4"]
    async fn list_tags(&self) -> Result<Vec<String>, RegistrarError>;
}

/// Fetches `<base>/<channel>/metadata.json` and `<base>/tags.json`
pub struct HttpMetadataSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMetadataSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Failed to build metadata HTTP client, using default");
                reqwest::Client::new()
            }
        };
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, RegistrarError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RegistrarError::Fetch(format!("GET {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RegistrarError::Fetch(format!("GET {}: HTTP {}", url, status)));
        }

        response
            .json()
            .await
            .map_err(|e| RegistrarError::InvalidMetadata(format!("{}: {}", url, e)))
    }
}

#[async_trait]
impl ReleaseMetadataSource for HttpMetadataSource {
    async fn fetch_metadata(&self, channel_or_tag: &str) -> Result<ReleaseMetadata, RegistrarError> {
        let url = format!("{}/{}/metadata.json", self.base_url, channel_or_tag);
        self.get_json(&url).await
    }

    async fn list_tags(&self) -> Result<Vec<String>, RegistrarError> {
        let url = format!("{}/tags.json", self.base_url);
        self.get_json(&url).await
    }
}

/// What a channel check did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Created(String),
    AlreadyExists(String),
}

/// Registers the channel tip (or the next safe step towards it)
pub struct ReleaseRegistrar<R, S> {
    source: Arc<dyn ReleaseMetadataSource>,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    _release: PhantomData<fn() -> R>,
}

impl<R, S> ReleaseRegistrar<R, S>
where
    R: Release,
    S: ReleaseStore<R>,
{
    pub fn new(source: Arc<dyn ReleaseMetadataSource>, store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            store,
            clock,
            _release: PhantomData,
        }
    }

    /// Run one channel check
    pub async fn check_channel(&self, settings: &Settings) -> Result<CheckOutcome, RegistrarError> {
        let now = self.clock.now();
        let channel = settings.release_channel.as_str();

        let mut metadata = self.source.fetch_metadata(channel).await?;
        let tip = metadata.release_version()?;
        info!(channel = %channel, version = %tip, "Fetched release channel metadata");

        let releases = sort_by_version(self.store.list_releases().await?);

        // Channel rolled back: pending releases newer than the tip are withdrawn
        for entry in &releases {
            if is_greater(&entry.version, &tip) && entry.release.phase() == Some(ReleasePhase::Pending) {
                info!(release = %entry.release.name(), tip = %tip, "Deleting release newer than channel tip");
                self.store.delete_release(&entry.release).await?;
            }
        }
        let releases: Vec<_> = releases
            .into_iter()
            .filter(|e| !(is_greater(&e.version, &tip) && e.release.phase() == Some(ReleasePhase::Pending)))
            .collect();

        let deployed = releases
            .iter()
            .rev()
            .find(|e| e.release.phase() == Some(ReleasePhase::Deployed));

        let direct = releases.is_empty()
            || settings.is_lts_channel()
            || deployed
                .map(|d| is_updating_sequence(&d.version, &tip))
                .unwrap_or(true);

        let target = if direct {
            tip.clone()
        } else {
            // `deployed` is Some here: `direct` is true whenever it is None
            let actual = deployed
                .map(|d| d.version.clone())
                .unwrap_or_else(|| tip.clone());
            let tags = self.source.list_tags().await?;
            let step = next_version(&actual, &tip, &tags)?;
            if step != tip {
                info!(actual = %actual, tip = %tip, step = %step, "Registering intermediate release");
                metadata = self.source.fetch_metadata(&format_version(&step)).await?;
                let step_version = metadata.release_version()?;
                if step_version != step {
                    return Err(RegistrarError::InvalidMetadata(format!(
                        "metadata for {} reports version {}",
                        format_version(&step),
                        step_version
                    )));
                }
            }
            step
        };

        if let Some(existing) = releases.iter().find(|e| e.version == target) {
            self.sync_suspend(&existing.release, metadata.suspend).await?;
            return Ok(CheckOutcome::AlreadyExists(existing.release.name()));
        }

        let same_minor: Vec<&R> = releases
            .iter()
            .filter(|e| same_line(&e.version, &target) && is_greater(&target, &e.version))
            .map(|e| &e.release)
            .collect();

        let draft = self.build_draft(settings, &metadata, target, &same_minor, now)?;
        self.store.create_release(&draft).await?;
        Ok(CheckOutcome::Created(draft.name()))
    }

    fn build_draft(
        &self,
        settings: &Settings,
        metadata: &ReleaseMetadata,
        version: Version,
        same_minor: &[&R],
        now: DateTime<Utc>,
    ) -> Result<ReleaseDraft, RegistrarError> {
        let mut draft = ReleaseDraft::new(version);

        draft.cooldown_until = match metadata.cooldown.as_deref() {
            Some(raw) => parse_timestamp(raw),
            None => same_minor.iter().rev().find_map(|r| r.cooldown_until()),
        };

        let canary = metadata
            .canary
            .get(&settings.release_channel)
            .cloned()
            .unwrap_or_default();
        let reference = draft.cooldown_until.map_or(now, |c| c.max(now));
        draft.apply_after = calculate_release_delay(
            &canary,
            &settings.cluster_id,
            &draft.name(),
            reference,
        )?;

        // Keep a notification-shifted apply time from an earlier patch of this line
        let shifted = same_minor
            .iter()
            .filter(|r| r.notification_shift())
            .filter_map(|r| r.apply_after())
            .filter(|t| *t > now)
            .max();
        if let Some(shifted) = shifted {
            debug!(release = %draft.name(), apply_after = %shifted, "Inheriting notification shift");
            draft.apply_after = Some(draft.apply_after.map_or(shifted, |a| a.max(shifted)));
        }

        draft.disruptions = metadata
            .disruptions
            .get(&line_key(&draft.version))
            .cloned()
            .unwrap_or_default();
        draft.requirements = metadata.requirements.clone();
        draft.changelog_link = metadata.changelog_link.clone();
        if metadata.suspend {
            draft
                .annotations
                .insert(ANNOTATION_SUSPEND.to_string(), "true".to_string());
        }

        Ok(draft)
    }

    async fn sync_suspend(&self, release: &R, suspend: bool) -> Result<(), RegistrarError> {
        match (suspend, release.phase()) {
            (true, Some(ReleasePhase::Pending)) | (true, None) => {
                info!(release = %release.name(), "Suspending release from channel metadata");
                self.store
                    .patch_annotations(
                        release,
                        BTreeMap::from([(ANNOTATION_SUSPEND.to_string(), Some("true".to_string()))]),
                    )
                    .await?;
            }
            (false, Some(ReleasePhase::Suspended)) => {
                info!(release = %release.name(), "Resuming suspended release");
                self.store
                    .update_status(release, "", ReleasePhase::Pending)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }
    /// Check the channel on a fixed interval until shutdown
    ///
    /// Settings are reloaded before every check; invalid settings and check
    /// failures are logged and retried on the next tick.
    pub async fn run<F>(
        self,
        interval: Duration,
        settings: F,
        mut shutdown: crate::server::ShutdownSignal,
    ) where
        F: Fn() -> Result<Settings, SettingsError> + Send + Sync,
    {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let settings = match settings() {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(error = %e, "Skipping channel check, invalid settings (non-fatal)");
                            continue;
                        }
                    };
                    match self.check_channel(&settings).await {
                        Ok(outcome) => debug!(outcome = ?outcome, "Channel check finished"),
                        Err(e) => warn!(error = %e, "Channel check failed (non-fatal)"),
                    }
                }
                _ = shutdown.wait() => {
                    info!("Channel poll loop stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "registrar_test.rs"]
mod tests;
