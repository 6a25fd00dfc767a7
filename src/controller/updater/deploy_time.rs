//! Deploy time calculation
//!
//! Folds the timing gates (cooldown, canary, notification lead time, update
//! windows, manual approval) into one apply time and a delay reason mask.
//! Each gate may only push the apply time later; manual approval resets it
//! to `now` because approval is a gate, not a schedule.

use crate::controller::delay_reason::DeployDelayReason;
use crate::controller::release::{Release, ReleaseData};
use crate::controller::settings::{Settings, UpdateMode};
use crate::controller::updater::task::DeployedReleaseInfo;
use crate::controller::version::format_version;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct DeployTimeResult {
    pub apply_time: DateTime<Utc>,
    /// New `applyAfter` floor to persist (set when notification pushed the time)
    pub apply_after: Option<DateTime<Utc>>,
    pub reason: DeployDelayReason,
    /// Set when the deployed release is not ready; blocks regardless of `reason`
    pub awaiting_target: Option<String>,
}

impl DeployTimeResult {
    fn immediate(now: DateTime<Utc>) -> Self {
        Self {
            apply_time: now,
            apply_after: None,
            reason: DeployDelayReason::NO_DELAY,
            awaiting_target: None,
        }
    }
}

/// Which mode consults a gate
#[derive(Clone, Copy)]
struct Gates {
    cooldown: bool,
    canary: bool,
    window: bool,
    manual_approval: bool,
}

pub struct DeployTimeChecker<'a> {
    settings: &'a Settings,
    now: DateTime<Utc>,
}

impl<'a> DeployTimeChecker<'a> {
    pub fn new(settings: &'a Settings, now: DateTime<Utc>) -> Self {
        Self { settings, now }
    }

    /// Deploy time for a patch of the deployed release line
    pub fn process_patch<R: Release>(&self, release: &R, data: ReleaseData) -> DeployTimeResult {
        let mode = self.settings.mode;
        self.calculate(
            release,
            data,
            Gates {
                cooldown: false,
                canary: true,
                window: mode == UpdateMode::AutoPatch,
                manual_approval: mode == UpdateMode::Manual,
            },
        )
    }

    /// Deploy time for a minor (or major) release
    pub fn process_minor<R: Release>(
        &self,
        release: &R,
        data: ReleaseData,
        target_ready: bool,
        deployed: Option<&DeployedReleaseInfo>,
    ) -> DeployTimeResult {
        let mode = self.settings.mode;
        let mut result = self.calculate(
            release,
            data,
            Gates {
                cooldown: true,
                canary: mode != UpdateMode::Manual,
                window: mode == UpdateMode::Auto,
                manual_approval: mode != UpdateMode::Auto,
            },
        );

        if !target_ready {
            let message = match deployed {
                Some(d) => format!("awaiting for {} to be ready", format_version(&d.version)),
                None => "awaiting for the deployment target to be ready".to_string(),
            };
            info!(release = %release.name(), reason = %message, "Deployment target not ready");
            result.awaiting_target = Some(message);
        }

        result
    }

    fn calculate<R: Release>(&self, release: &R, data: ReleaseData, gates: Gates) -> DeployTimeResult {
        let now = self.now;
        if release.force() || release.apply_now() {
            return DeployTimeResult::immediate(now);
        }

        let name = release.name();
        let mut result = DeployTimeResult::immediate(now);

        if gates.cooldown {
            if let Some(cooldown) = release.cooldown_until().filter(|c| now < *c) {
                warn!(release = %name, until = %cooldown, "Release in cooldown");
                result.apply_time = result.apply_time.max(cooldown);
                result.reason = result.reason.add(DeployDelayReason::COOLDOWN);
            }
        }

        // A notification-shifted applyAfter is a lead-time floor in every mode
        if release.notification_shift() {
            if let Some(floor) = release.apply_after().filter(|a| now < *a) {
                info!(release = %name, until = %floor, "Release held by notification lead time");
                result.apply_time = result.apply_time.max(floor);
                result.reason = result.reason.add(DeployDelayReason::NOTIFICATION);
            }
        } else if gates.canary {
            if let Some(apply_after) = release.apply_after().filter(|a| now < *a) {
                warn!(release = %name, until = %apply_after, "Release postponed by canary process");
                result.apply_time = result.apply_time.max(apply_after);
                result.reason = result.reason.add(DeployDelayReason::CANARY);
            }
        }

        if !data.notified {
            if let Some(lead) = self.settings.notification.minimal_time() {
                let min_apply_time = now + lead;
                if min_apply_time >= result.apply_time {
                    result.apply_time = min_apply_time;
                    result.apply_after = Some(min_apply_time);
                    result.reason = result.reason.add(DeployDelayReason::NOTIFICATION);
                }
            }
        }

        if gates.window && !self.settings.windows.is_allowed(result.apply_time) {
            result.apply_time = self.settings.windows.next_allowed_time(result.apply_time);
            result.reason = result.reason.add(DeployDelayReason::OUT_OF_WINDOW);
        }

        if gates.manual_approval && !release.manually_approved() {
            info!(release = %name, "Release is waiting for manual approval");
            result.apply_time = now;
            result.reason = result.reason.add(DeployDelayReason::MANUAL_APPROVAL);
        }

        result
    }
}
