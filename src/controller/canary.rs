//! Canary wave assignment
//!
//! Staggers a fleet's upgrades without coordination: each cluster hashes its
//! identity together with the target version and lands in a stable wave.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CanaryError {
    #[error("canary waves must be greater than zero")]
    ZeroWaves,

    #[error("canary interval must be greater than zero")]
    ZeroInterval,

    #[error(
        "canary rollout spans {0} minutes, more than the {max} allowed",
        max = MAX_CANARY_SPAN_MINUTES
    )]
    SpanTooLong(u128),

    #[error("canary apply time is out of range")]
    OutOfRange,
}

/// Longest delay the last wave may get (30 days)
pub const MAX_CANARY_SPAN_MINUTES: u64 = 30 * 24 * 60;

/// Per-channel canary settings from release metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanarySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub waves: u32,
    /// Wave interval in minutes
    #[serde(default, rename = "intervalMinutes")]
    pub interval_minutes: u64,
}

impl CanarySettings {
    pub fn validate(&self) -> Result<(), CanaryError> {
        if !self.enabled {
            return Ok(());
        }
        if self.waves == 0 {
            return Err(CanaryError::ZeroWaves);
        }
        if self.interval_minutes == 0 {
            return Err(CanaryError::ZeroInterval);
        }
        let span = u128::from(self.waves - 1) * u128::from(self.interval_minutes);
        if span > u128::from(MAX_CANARY_SPAN_MINUTES) {
            return Err(CanaryError::SpanTooLong(span));
        }
        Ok(())
    }
}

/// FNV-1a over the input followed by a 64-bit avalanche finalizer
///
/// FNV alone clusters its low bits for inputs sharing a long prefix (same
/// cluster id, different versions); the finalizer spreads them before `mod`.
pub fn wave_hash(input: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in input.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51afd7ed558ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ceb9fe1a85ec53);
    hash ^= hash >> 33;
    hash
}

/// Wave number in `[0, waves)` for a cluster and version
pub fn calculate_wave(cluster_id: &str, version: &str, waves: u32) -> Result<u64, CanaryError> {
    if waves == 0 {
        return Err(CanaryError::ZeroWaves);
    }
    Ok(wave_hash(&format!("{}{}", cluster_id, version)) % waves as u64)
}

/// Canary `applyAfter` for a release, or `None` when the cluster is in wave 0
///
/// `reference` is the later of now and any inherited cooldown, so the delay
/// never moves a release ahead of its cooldown.
pub fn calculate_release_delay(
    settings: &CanarySettings,
    cluster_id: &str,
    version: &str,
    reference: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, CanaryError> {
    settings.validate()?;
    if !settings.enabled {
        return Ok(None);
    }

    let wave = calculate_wave(cluster_id, version, settings.waves)?;
    if wave == 0 {
        return Ok(None);
    }

    let minutes = wave
        .checked_mul(settings.interval_minutes)
        .and_then(|m| i64::try_from(m).ok())
        .ok_or(CanaryError::OutOfRange)?;
    let delay = ChronoDuration::try_minutes(minutes).ok_or(CanaryError::OutOfRange)?;
    reference
        .checked_add_signed(delay)
        .map(Some)
        .ok_or(CanaryError::OutOfRange)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn settings(waves: u32, interval_minutes: u64) -> CanarySettings {
        CanarySettings {
            enabled: true,
            waves,
            interval_minutes,
        }
    }

    #[test]
    fn test_wave_is_stable() {
        let first = calculate_wave("c0ffee-cluster", "v1.30.0", 6).unwrap();
        for _ in 0..10 {
            assert_eq!(calculate_wave("c0ffee-cluster", "v1.30.0", 6).unwrap(), first);
        }
    }

    #[test]
    fn test_wave_distribution_is_roughly_uniform() {
        let waves = 5u32;
        let samples = 5000;
        let mut buckets = vec![0usize; waves as usize];

        for patch in 0..samples {
            let version = format!("v1.{}.{}", patch / 100, patch % 100);
            let wave = calculate_wave("fixed-cluster-identity", &version, waves).unwrap();
            buckets[wave as usize] += 1;
        }

        let expected = samples / waves as usize;
        for (wave, count) in buckets.iter().enumerate() {
            let deviation = (*count as f64 - expected as f64).abs() / expected as f64;
            assert!(
                deviation < 0.15,
                "wave {} has {} samples, expected about {}",
                wave,
                count,
                expected
            );
        }
    }

    #[test]
    fn test_zero_waves_rejected() {
        assert_eq!(calculate_wave("a", "v1", 0), Err(CanaryError::ZeroWaves));
        assert_eq!(settings(0, 10).validate(), Err(CanaryError::ZeroWaves));
        assert_eq!(settings(3, 0).validate(), Err(CanaryError::ZeroInterval));
    }

    #[test]
    fn test_disabled_canary_has_no_delay() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let disabled = CanarySettings::default();

        assert_eq!(
            calculate_release_delay(&disabled, "cluster", "v1.30.0", now),
            Ok(None)
        );
    }

    #[test]
    fn test_delay_is_wave_times_interval() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let s = settings(4, 30);

        for cluster in ["alpha", "bravo", "charlie", "delta", "echo", "foxtrot"] {
            let wave = calculate_wave(cluster, "v1.30.0", 4).unwrap();
            let delay = calculate_release_delay(&s, cluster, "v1.30.0", now).unwrap();
            if wave == 0 {
                assert_eq!(delay, None);
            } else {
                assert_eq!(
                    delay,
                    Some(now + ChronoDuration::minutes(wave as i64 * 30))
                );
            }
        }
    }

    #[test]
    fn test_single_wave_never_delays() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        assert_eq!(
            calculate_release_delay(&settings(1, 60), "any", "v1.30.0", now),
            Ok(None)
        );
    }

    #[test]
    fn test_oversized_interval_is_rejected_not_panicking() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let huge = settings(1000, 1_000_000_000_000_000);

        assert!(matches!(huge.validate(), Err(CanaryError::SpanTooLong(_))));
        assert!(matches!(
            calculate_release_delay(&huge, "cluster", "v1.30.0", now),
            Err(CanaryError::SpanTooLong(_))
        ));
    }

    #[test]
    fn test_span_limit_is_inclusive() {
        let at_limit = settings(2, MAX_CANARY_SPAN_MINUTES);
        assert_eq!(at_limit.validate(), Ok(()));
        let over = settings(3, MAX_CANARY_SPAN_MINUTES);
        assert!(over.validate().is_err());
    }

    #[test]
    fn test_apply_time_past_calendar_end_is_an_error() {
        let s = settings(4, 30);
        let cluster = (0..64)
            .map(|i| format!("cluster-{}", i))
            .find(|c| calculate_wave(c, "v1.30.0", 4).unwrap() != 0)
            .expect("some cluster lands in a later wave");

        assert_eq!(
            calculate_release_delay(&s, &cluster, "v1.30.0", DateTime::<Utc>::MAX_UTC),
            Err(CanaryError::OutOfRange)
        );
    }
}
