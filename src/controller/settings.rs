//! Update settings snapshot
//!
//! Read fresh from the environment on every reconciliation pass and never
//! mutated by the engine. Configuration variables:
//! - `KULTA_UPDATER_MODE`: `Auto`, `AutoPatch` (default) or `Manual`
//! - `KULTA_UPDATER_WINDOWS`: JSON list of `{"from":"HH:MM","to":"HH:MM","days":["Mon"]}`
//! - `KULTA_UPDATER_RELEASE_CHANNEL`: channel name, e.g. `stable`
//! - `KULTA_UPDATER_CLUSTER_ID`: identity used for canary waves
//! - `KULTA_UPDATER_DISRUPTION_APPROVAL_MODE`: `Auto` (default) or `Manual`
//! - `KULTA_UPDATER_NOTIFICATION_WEBHOOK`: webhook URL
//! - `KULTA_UPDATER_NOTIFICATION_MIN_TIME`: minimal lead time, e.g. `2h`
//! - `KULTA_UPDATER_NOTIFICATION_RELEASE_TYPE`: `All` or `Minor` (default)
//! - `KULTA_UPDATER_NOTIFICATION_BASIC_USER` / `_BASIC_PASSWORD` or `_BEARER_TOKEN`

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("invalid update window {index}: {reason}")]
    InvalidWindow { index: usize, reason: String },

    #[error("invalid update windows JSON: {0}")]
    WindowsJson(String),

    #[error("invalid duration for {key}: {value:?}")]
    InvalidDuration { key: String, value: String },

    #[error("notification auth: basic and bearer auth are mutually exclusive")]
    ConflictingAuth,

    #[error("notification auth: basic auth requires both user and password")]
    IncompleteBasicAuth,
}

/// How releases are applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateMode {
    /// Apply every release automatically (within windows)
    Auto,
    /// Apply patches automatically, ask for approval of minor releases
    #[default]
    AutoPatch,
    /// Register releases but never apply without approval
    Manual,
}

impl UpdateMode {
    /// Unknown values fall back to `AutoPatch`
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Auto" => UpdateMode::Auto,
            "AutoPatch" => UpdateMode::AutoPatch,
            "Manual" => UpdateMode::Manual,
            other => {
                if !other.is_empty() {
                    warn!(mode = %other, "Unknown update mode, using AutoPatch");
                }
                UpdateMode::AutoPatch
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisruptionApprovalMode {
    #[default]
    Auto,
    Manual,
}

/// Which releases trigger a webhook notification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NotificationReleaseType {
    All,
    #[default]
    Minor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationAuth {
    Basic { user: String, password: String },
    Bearer { token: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub minimal_notification_time: Option<Duration>,
    pub auth: Option<NotificationAuth>,
    pub release_type: NotificationReleaseType,
}

impl NotificationConfig {
    pub fn is_configured(&self) -> bool {
        *self != NotificationConfig::default()
    }

    pub fn minimal_time(&self) -> Option<ChronoDuration> {
        self.minimal_notification_time
            .and_then(|d| ChronoDuration::from_std(d).ok())
            .filter(|d| *d > ChronoDuration::zero())
    }
}

/// Raw window as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateWindowSpec {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub days: Vec<String>,
}

/// Daily time range (UTC) during which automatic deployment is allowed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateWindow {
    pub from: NaiveTime,
    pub to: NaiveTime,
    /// Empty means every day
    pub days: Vec<Weekday>,
}

impl UpdateWindow {
    fn applies_on(&self, day: Weekday) -> bool {
        self.days.is_empty() || self.days.contains(&day)
    }

    fn contains(&self, t: DateTime<Utc>) -> bool {
        let time = t.time();
        self.applies_on(t.weekday()) && self.from <= time && time < self.to
    }
}

/// Set of update windows; no windows means deployment is always allowed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Windows(pub Vec<UpdateWindow>);

impl Windows {
    pub fn parse(specs: &[UpdateWindowSpec]) -> Result<Self, SettingsError> {
        let mut windows = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let from = parse_clock_time(&spec.from).ok_or_else(|| SettingsError::InvalidWindow {
                index,
                reason: format!("from {:?} is not HH:MM", spec.from),
            })?;
            let to = parse_clock_time(&spec.to).ok_or_else(|| SettingsError::InvalidWindow {
                index,
                reason: format!("to {:?} is not HH:MM", spec.to),
            })?;
            if from >= to {
                return Err(SettingsError::InvalidWindow {
                    index,
                    reason: format!("from {} must be before to {}", spec.from, spec.to),
                });
            }
            let mut days = Vec::with_capacity(spec.days.len());
            for day in &spec.days {
                let parsed = day
                    .parse::<Weekday>()
                    .map_err(|_| SettingsError::InvalidWindow {
                        index,
                        reason: format!("unknown day {:?}", day),
                    })?;
                days.push(parsed);
            }
            windows.push(UpdateWindow { from, to, days });
        }
        Ok(Windows(windows))
    }

    pub fn is_allowed(&self, t: DateTime<Utc>) -> bool {
        self.0.is_empty() || self.0.iter().any(|w| w.contains(t))
    }

    /// Earliest instant at or after `t` that falls inside a window
    pub fn next_allowed_time(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        if self.is_allowed(t) {
            return t;
        }

        let mut best: Option<DateTime<Utc>> = None;
        // A week plus one day covers every weekday-restricted window
        for offset in 0..=7 {
            let date = t.date_naive() + ChronoDuration::days(offset);
            for window in &self.0 {
                if !window.applies_on(date.weekday()) {
                    continue;
                }
                let start = date.and_time(window.from).and_utc();
                if start < t {
                    continue;
                }
                if best.map(|b| start < b).unwrap_or(true) {
                    best = Some(start);
                }
            }
            if best.is_some() {
                break;
            }
        }

        best.unwrap_or(t)
    }
}

fn parse_clock_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

/// Which kind of release the engine is driving; used in notifications
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Subject {
    #[default]
    Platform,
    Module,
}

impl Subject {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::Platform => "Platform",
            Subject::Module => "Module",
        }
    }
}

/// Immutable per-pass settings snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub mode: UpdateMode,
    pub windows: Windows,
    pub notification: NotificationConfig,
    pub disruption_approval_mode: DisruptionApprovalMode,
    pub release_channel: String,
    pub cluster_id: String,
    pub subject: Subject,
}

pub const LTS_CHANNEL: &str = "lts";

impl Settings {
    pub fn in_manual_mode(&self) -> bool {
        self.mode == UpdateMode::Manual
    }

    pub fn is_lts_channel(&self) -> bool {
        self.release_channel.eq_ignore_ascii_case(LTS_CHANNEL)
    }

    /// Load settings from `KULTA_UPDATER_*` environment variables
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary variable lookup
    pub fn from_vars<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("KULTA_UPDATER_{}", name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mode = UpdateMode::parse(var("MODE").as_deref().unwrap_or("AutoPatch"));

        let windows = match var("WINDOWS") {
            Some(raw) => {
                let specs: Vec<UpdateWindowSpec> = serde_json::from_str(&raw)
                    .map_err(|e| SettingsError::WindowsJson(e.to_string()))?;
                Windows::parse(&specs)?
            }
            None => Windows::default(),
        };

        let minimal_notification_time = match var("NOTIFICATION_MIN_TIME") {
            Some(raw) => Some(parse_duration(&raw).ok_or(SettingsError::InvalidDuration {
                key: "KULTA_UPDATER_NOTIFICATION_MIN_TIME".to_string(),
                value: raw,
            })?),
            None => None,
        };

        let basic_user = var("NOTIFICATION_BASIC_USER");
        let basic_password = var("NOTIFICATION_BASIC_PASSWORD");
        let bearer = var("NOTIFICATION_BEARER_TOKEN");
        let auth = match (basic_user, basic_password, bearer) {
            (None, None, None) => None,
            (None, None, Some(token)) => Some(NotificationAuth::Bearer { token }),
            (Some(user), Some(password), None) => Some(NotificationAuth::Basic { user, password }),
            (Some(_), Some(_), Some(_)) | (Some(_), None, Some(_)) | (None, Some(_), Some(_)) => {
                return Err(SettingsError::ConflictingAuth)
            }
            _ => return Err(SettingsError::IncompleteBasicAuth),
        };

        let release_type = match var("NOTIFICATION_RELEASE_TYPE").as_deref() {
            Some("All") => NotificationReleaseType::All,
            _ => NotificationReleaseType::Minor,
        };

        let disruption_approval_mode = match var("DISRUPTION_APPROVAL_MODE").as_deref() {
            Some("Manual") => DisruptionApprovalMode::Manual,
            _ => DisruptionApprovalMode::Auto,
        };

        Ok(Settings {
            mode,
            windows,
            notification: NotificationConfig {
                webhook_url: var("NOTIFICATION_WEBHOOK"),
                minimal_notification_time,
                auth,
                release_type,
            },
            disruption_approval_mode,
            release_channel: var("RELEASE_CHANNEL").unwrap_or_default(),
            cluster_id: var("CLUSTER_ID").unwrap_or_default(),
            subject: Subject::Platform,
        })
    }
}

/// Parse a duration string like "5m", "30s", "1h" into std::time::Duration
///
/// Supported formats:
/// - "30s" → 30 seconds (max 24h = 86400s)
/// - "5m" → 5 minutes (max 1 week = 10080m)
/// - "2h" → 2 hours (max 30 days = 720h)
///
/// Zero, negative and fractional values are rejected.
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let duration_str = duration_str.trim();

    if duration_str.is_empty() {
        return None;
    }

    let unit = duration_str.chars().last()?;
    let number_str = &duration_str[..duration_str.len() - unit.len_utf8()];
    let number: u64 = number_str.parse().ok()?;

    if number == 0 {
        return None;
    }

    match unit {
        's' if number <= 86_400 => Some(Duration::from_secs(number)),
        'm' if number <= 10_080 => number.checked_mul(60).map(Duration::from_secs),
        'h' if number <= 720 => number.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

#[cfg(test)]
#[path = "settings_test.rs"]
mod tests;
