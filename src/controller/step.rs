//! Step-by-step version resolution
//!
//! A cluster never jumps over a minor version: when the channel tip is more
//! than one minor ahead, the next target is the highest patch of the very next
//! minor.

use crate::controller::version::parse_version;
use regex::Regex;
use semver::Version;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum StepError {
    #[error("major version updated: {actual} -> {target}")]
    MajorVersionUpdated { actual: Version, target: Version },

    #[error("next minor version is missed: no v{major}.{minor}.x tag found")]
    NextMinorMissed { major: u64, minor: u64 },

    #[error("invalid tag pattern: {0}")]
    Pattern(String),
}

/// Resolve the next safe target between `actual` and `target`
///
/// # Arguments
/// * `actual` - Currently deployed version
/// * `target` - Release channel tip
/// * `tags` - Known tags in the artifact store (e.g. "v1.31.4")
///
/// # Returns
/// * `Ok(target)` - Same minor or exactly one minor ahead
/// * `Ok(intermediate)` - Highest patch of `actual.minor + 1`
/// * `Err(StepError)` - Major change or the next minor has no tags
pub fn next_version(
    actual: &Version,
    target: &Version,
    tags: &[String],
) -> Result<Version, StepError> {
    if actual.major != target.major {
        return Err(StepError::MajorVersionUpdated {
            actual: actual.clone(),
            target: target.clone(),
        });
    }

    if target.minor <= actual.minor + 1 {
        return Ok(target.clone());
    }

    let next_minor = actual.minor + 1;
    let pattern = format!(r"^v{}\.{}\.(\d+)$", actual.major, next_minor);
    let matcher = Regex::new(&pattern).map_err(|e| StepError::Pattern(e.to_string()))?;

    let best = tags
        .iter()
        .filter(|tag| matcher.is_match(tag))
        .filter_map(|tag| parse_version(tag).ok())
        .max();

    match best {
        Some(version) => {
            debug!(
                actual = %actual,
                target = %target,
                step = %version,
                "Resolved intermediate step"
            );
            Ok(version)
        }
        None => Err(StepError::NextMinorMissed {
            major: actual.major,
            minor: next_minor,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        parse_version(s).unwrap()
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_same_minor_returns_target() {
        assert_eq!(next_version(&v("1.30.0"), &v("1.30.5"), &[]), Ok(v("1.30.5")));
    }

    #[test]
    fn test_next_minor_returns_target() {
        assert_eq!(next_version(&v("1.30.0"), &v("1.31.2"), &[]), Ok(v("1.31.2")));
    }

    #[test]
    fn test_major_change_fails() {
        assert!(matches!(
            next_version(&v("1.30.0"), &v("2.0.0"), &[]),
            Err(StepError::MajorVersionUpdated { .. })
        ));
    }

    #[test]
    fn test_picks_highest_patch_of_next_minor() {
        let known = tags(&[
            "v1.30.0", "v1.31.0", "v1.31.9", "v1.31.10", "v1.31.2", "v1.32.0", "v1.33.1",
        ]);
        assert_eq!(
            next_version(&v("1.30.0"), &v("1.33.1"), &known),
            Ok(v("1.31.10"))
        );
    }

    #[test]
    fn test_ignores_non_matching_tags() {
        let known = tags(&["1.31.5", "v1.31.6-rc.1", "v1.31.1", "v11.31.9", "latest"]);
        assert_eq!(
            next_version(&v("1.30.0"), &v("1.32.0"), &known),
            Ok(v("1.31.1"))
        );
    }

    #[test]
    fn test_missing_next_minor_fails() {
        let known = tags(&["v1.30.0", "v1.32.0"]);
        assert_eq!(
            next_version(&v("1.30.0"), &v("1.32.0"), &known),
            Err(StepError::NextMinorMissed { major: 1, minor: 31 })
        );
    }

    #[test]
    fn test_never_returns_target_when_more_than_one_minor_ahead() {
        let known = tags(&["v1.31.3", "v1.32.0", "v1.33.0", "v1.34.0", "v1.35.0"]);
        for target_minor in 32..=35u64 {
            let target = Version::new(1, target_minor, 0);
            let step = next_version(&v("1.30.4"), &target, &known).unwrap();
            assert_ne!(step, target);
            assert_eq!(step.minor, 31);
        }
    }
}
