//! Semantic version helpers
//!
//! All ordering goes through `semver::Version`'s `Ord`, so pre-release suffixes
//! compare the same way everywhere (`1.30.0-rc.1 < 1.30.0`).

use semver::Version;
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum VersionError {
    #[error("invalid version {0:?}: {1}")]
    Invalid(String, String),
}

/// Parse a version, accepting an optional leading `v`
pub fn parse_version(raw: &str) -> Result<Version, VersionError> {
    let trimmed = raw.trim();
    let stripped = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(stripped).map_err(|e| VersionError::Invalid(raw.to_string(), e.to_string()))
}

/// Canonical `v`-prefixed rendering used for release names and tags
pub fn format_version(version: &Version) -> String {
    format!("v{}", version)
}

/// Ascending comparator
pub fn compare(a: &Version, b: &Version) -> Ordering {
    a.cmp(b)
}

/// Equal major and minor
pub fn same_line(a: &Version, b: &Version) -> bool {
    a.major == b.major && a.minor == b.minor
}

/// `a > b`
pub fn is_greater(a: &Version, b: &Version) -> bool {
    compare(a, b) == Ordering::Greater
}

/// `b` is a newer patch of `a`'s release line
pub fn is_patch_of(a: &Version, b: &Version) -> bool {
    same_line(a, b) && b.patch > a.patch
}

/// Whether `b` is reachable from `a` without skipping a major or minor
pub fn is_updating_sequence(a: &Version, b: &Version) -> bool {
    if a.major + 1 < b.major {
        return false;
    }
    if a.minor + 1 < b.minor {
        return false;
    }
    true
}

/// "major.minor" key used to select per-line metadata such as disruptions
pub fn line_key(version: &Version) -> String {
    format!("{}.{}", version.major, version.minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        parse_version(s).unwrap()
    }

    #[test]
    fn test_parse_accepts_v_prefix() {
        assert_eq!(v("v1.30.2"), Version::new(1, 30, 2));
        assert_eq!(v("1.30.2"), Version::new(1, 30, 2));
        assert_eq!(v(" v0.1.0 "), Version::new(0, 1, 0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_version("v1.30").is_err());
        assert!(parse_version("latest").is_err());
        assert!(parse_version("").is_err());
    }

    #[test]
    fn test_prerelease_orders_before_release() {
        assert!(is_greater(&v("1.30.0"), &v("1.30.0-rc.1")));
        assert!(is_greater(&v("1.30.0-rc.2"), &v("1.30.0-rc.1")));
        assert!(is_greater(&v("1.30.1-alpha"), &v("1.30.0")));
    }

    #[test]
    fn test_sort_ascending() {
        let mut versions = vec![v("1.31.0"), v("1.30.10"), v("1.30.2"), v("0.9.0")];
        versions.sort_by(compare);
        assert_eq!(
            versions,
            vec![v("0.9.0"), v("1.30.2"), v("1.30.10"), v("1.31.0")]
        );
    }

    #[test]
    fn test_same_line_and_patch() {
        assert!(same_line(&v("1.30.0"), &v("1.30.9")));
        assert!(!same_line(&v("1.30.0"), &v("1.31.0")));
        assert!(!same_line(&v("1.30.0"), &v("2.30.0")));

        assert!(is_patch_of(&v("1.30.0"), &v("1.30.1")));
        assert!(!is_patch_of(&v("1.30.1"), &v("1.30.1")));
        assert!(!is_patch_of(&v("1.30.1"), &v("1.31.0")));
    }

    #[test]
    fn test_updating_sequence() {
        assert!(is_updating_sequence(&v("1.30.0"), &v("1.31.5")));
        assert!(is_updating_sequence(&v("1.30.0"), &v("1.30.5")));
        assert!(!is_updating_sequence(&v("1.30.0"), &v("1.32.0")));
        assert!(!is_updating_sequence(&v("1.30.0"), &v("3.0.0")));
    }

    #[test]
    fn test_format_and_line_key() {
        assert_eq!(format_version(&v("1.30.2")), "v1.30.2");
        assert_eq!(line_key(&v("1.30.2")), "1.30");
    }
}
