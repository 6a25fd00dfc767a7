//! Pending-release task calculation
//!
//! Classifies one Pending release as skip, await or process by looking only
//! at its neighbours in version order, the Deployed release and the highest
//! forced release.

use crate::controller::release::{sort_by_version, Release, Versioned};
use crate::controller::version::{format_version, is_greater, same_line};
use crate::crd::release::ReleasePhase;
use semver::Version;
use thiserror::Error;
use tracing::debug;

/// Minor versions an LTS channel may jump in one step
pub const LTS_MAX_MINOR_DIFF: u64 = 10;

#[derive(Debug, Error, PartialEq)]
pub enum TaskError {
    #[error("release {0} phase is not Pending")]
    NotPending(String),

    #[error("release {0} is already deployed")]
    AlreadyDeployed(String),

    #[error("release {0} not found among listed releases")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Skip,
    Await,
    Process,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TaskType::Skip => "skip",
            TaskType::Await => "await",
            TaskType::Process => "process",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedReleaseInfo {
    pub name: String,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub task_type: TaskType,
    pub message: String,
    pub is_patch: bool,
    pub is_single: bool,
    pub is_latest: bool,
    /// Number of releases strictly newer than the candidate
    pub queue_depth: usize,
    pub deployed: Option<DeployedReleaseInfo>,
}

impl Task {
    fn new(task_type: TaskType) -> Self {
        Task {
            task_type,
            message: String::new(),
            is_patch: false,
            is_single: false,
            is_latest: false,
            queue_depth: 0,
            deployed: None,
        }
    }

    fn skip() -> Self {
        Self::new(TaskType::Skip)
    }
}

pub struct TaskCalculator {
    lts_channel: bool,
}

impl TaskCalculator {
    pub fn new(lts_channel: bool) -> Self {
        Self { lts_channel }
    }

    /// Classify `candidate` against all known releases
    ///
    /// # Returns
    /// * `Ok(Task)` - Exactly one task for the candidate
    /// * `Err(TaskError::NotPending)` - Candidate is not Pending
    /// * `Err(TaskError::AlreadyDeployed)` - Candidate is the Deployed version
    pub fn calculate<R: Release>(&self, candidate: &R, releases: &[R]) -> Result<Task, TaskError> {
        let name = candidate.name();
        if candidate.phase() != Some(ReleasePhase::Pending) {
            return Err(TaskError::NotPending(name));
        }

        if releases.len() == 1 {
            return Ok(Task {
                is_single: true,
                is_latest: true,
                ..Task::new(TaskType::Process)
            });
        }

        let version = candidate
            .version()
            .map_err(|_| TaskError::NotFound(name.clone()))?;
        let sorted = sort_by_version(releases.to_vec());

        let forced = sorted.iter().rev().find(|r| r.release.force());
        if let Some(forced) = forced {
            if is_greater(&forced.version, &version) {
                debug!(release = %name, forced = %forced.version, "Skipping: newer release is forced");
                return Ok(Task::skip());
            }
        }

        let deployed = sorted
            .iter()
            .find(|r| r.release.phase() == Some(ReleasePhase::Deployed));
        let deployed_info = deployed.map(|d| DeployedReleaseInfo {
            name: d.release.name(),
            version: d.version.clone(),
        });

        if let Some(d) = deployed {
            if is_greater(&d.version, &version) {
                debug!(release = %name, deployed = %d.version, "Skipping: deployed release is newer");
                return Ok(Task::skip());
            }
            if d.version == version {
                return Err(TaskError::AlreadyDeployed(name));
            }
        }

        let index = sorted
            .binary_search_by(|r| r.version.cmp(&version))
            .map_err(|_| TaskError::NotFound(name.clone()))?;
        let queue_depth = sorted.len() - 1 - index;
        let is_latest = queue_depth == 0;

        let with_context = |task_type: TaskType, message: String, is_patch: bool| Task {
            task_type,
            message,
            is_patch,
            is_single: false,
            is_latest,
            queue_depth,
            deployed: deployed_info.clone(),
        };

        let mut is_patch = true;
        if index > 0 {
            let prev = &sorted[index - 1];
            let prev_line_changed = !same_line(&prev.version, &version);
            let deployed_line_changed = deployed.is_some_and(|d| !same_line(&d.version, &version));

            if prev_line_changed || deployed_line_changed {
                is_patch = false;
                if let Some(message) =
                    self.await_reason(&version, prev, prev_line_changed, deployed)
                {
                    debug!(release = %name, reason = %message, "Release awaiting");
                    return Ok(with_context(TaskType::Await, message, false));
                }
            }
        }

        if let Some(next) = sorted.get(index + 1) {
            if !same_line(&next.version, &version) {
                return Ok(with_context(TaskType::Process, String::new(), is_patch));
            }
            debug!(release = %name, next = %next.version, "Skipping: newer patch in the same line");
            return Ok(Task {
                is_patch,
                ..Task::skip()
            });
        }

        Ok(with_context(TaskType::Process, String::new(), is_patch))
    }

    /// Why a minor or major bump has to wait, if it does
    fn await_reason<R: Release>(
        &self,
        version: &Version,
        prev: &Versioned<R>,
        prev_line_changed: bool,
        deployed: Option<&Versioned<R>>,
    ) -> Option<String> {
        // An older patch of the same line is never awaited; it gets skipped
        let prev_pending = matches!(
            prev.release.phase(),
            Some(ReleasePhase::Pending) | Some(ReleasePhase::Suspended)
        );
        if prev_line_changed && prev_pending {
            let message = prev.release.message();
            if message.contains("awaiting") {
                return Some(message.to_string());
            }
            return Some(format!(
                "awaiting for {} release to be deployed",
                format_version(&prev.version)
            ));
        }

        // Deployed is the reference when present; otherwise the predecessor
        let reference = deployed.map(|d| &d.version).unwrap_or(&prev.version);

        if version.major == reference.major {
            if self.lts_channel {
                if version.minor > reference.minor + LTS_MAX_MINOR_DIFF {
                    return Some(format!(
                        "minor version is greater than deployed {} by {}, it's more than acceptable channel limitation",
                        format_version(reference),
                        version.minor - reference.minor
                    ));
                }
            } else if version.minor > reference.minor + 1 {
                return Some(format!(
                    "minor version is greater than deployed {} by one",
                    format_version(reference)
                ));
            }
        } else if version.major > reference.major && !(reference.major == 0 && version.major == 1)
        {
            return Some(format!(
                "major version is greater than deployed {}",
                format_version(reference)
            ));
        }

        None
    }
}
