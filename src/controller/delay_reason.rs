//! Deploy delay reason bitmask
//!
//! Accumulates which gates currently hold a release back. Rendering walks the
//! flags in definition order, so a given mask always yields the same text and
//! status writes stay idempotent.

use chrono::{DateTime, Utc};

/// Bitset over the five delay reasons
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeployDelayReason(u8);

impl DeployDelayReason {
    pub const NO_DELAY: Self = Self(0);
    pub const COOLDOWN: Self = Self(1 << 0);
    pub const CANARY: Self = Self(1 << 1);
    pub const NOTIFICATION: Self = Self(1 << 2);
    pub const OUT_OF_WINDOW: Self = Self(1 << 3);
    pub const MANUAL_APPROVAL: Self = Self(1 << 4);

    /// Definition order: (flag, machine name, human phrase)
    const FLAGS: [(Self, &'static str, &'static str); 5] = [
        (Self::COOLDOWN, "cooldown", "in cooldown"),
        (Self::CANARY, "canary", "postponed by canary process"),
        (Self::NOTIFICATION, "notification", "postponed by notification"),
        (Self::OUT_OF_WINDOW, "outOfWindow", "waiting for the update window"),
        (Self::MANUAL_APPROVAL, "manualApproval", "waiting for manual approval"),
    ];

    #[must_use]
    pub fn add(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    /// Bit test; `NO_DELAY` only matches an empty mask
    pub fn contains(self, flag: Self) -> bool {
        if flag.0 == 0 {
            return self.0 == 0;
        }
        self.0 & flag.0 == flag.0
    }

    pub fn is_delayed(self) -> bool {
        self.0 != 0
    }

    /// Status message for a postponed release
    ///
    /// A zero `apply_time` (`None`) means "as soon as the gate clears" and is
    /// not rendered.
    pub fn message(self, release_name: &str, apply_time: Option<DateTime<Utc>>) -> String {
        let phrases: Vec<&str> = Self::FLAGS
            .iter()
            .filter(|(flag, _, _)| self.contains(*flag))
            .map(|(_, _, phrase)| *phrase)
            .collect();

        let mut message = if phrases.is_empty() {
            format!("Release {} is ready to deploy", release_name)
        } else {
            format!("Release is {}", phrases.join(", "))
        };

        if let Some(at) = apply_time {
            let at = format_apply_time(at);
            if self.contains(Self::MANUAL_APPROVAL) {
                message.push_str(&format!(
                    ". After approval the release will be delayed until {}",
                    at
                ));
            } else {
                message.push_str(&format!(" until {}", at));
            }
        }

        message
    }
}

impl std::fmt::Display for DeployDelayReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 == 0 {
            return f.write_str("noDelay");
        }
        let names: Vec<&str> = Self::FLAGS
            .iter()
            .filter(|(flag, _, _)| self.contains(*flag))
            .map(|(_, name, _)| *name)
            .collect();
        f.write_str(&names.join(", "))
    }
}

/// Fixed, locale-free apply time rendering
pub fn format_apply_time(at: DateTime<Utc>) -> String {
    at.format("%d %b %Y %H:%M UTC").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap()
    }

    #[test]
    fn test_add_is_commutative_and_idempotent() {
        let a = DeployDelayReason::NO_DELAY
            .add(DeployDelayReason::CANARY)
            .add(DeployDelayReason::COOLDOWN);
        let b = DeployDelayReason::NO_DELAY
            .add(DeployDelayReason::COOLDOWN)
            .add(DeployDelayReason::CANARY)
            .add(DeployDelayReason::CANARY);
        assert_eq!(a, b);
    }

    #[test]
    fn test_contains() {
        let r = DeployDelayReason::NO_DELAY.add(DeployDelayReason::NOTIFICATION);
        assert!(r.contains(DeployDelayReason::NOTIFICATION));
        assert!(!r.contains(DeployDelayReason::CANARY));
        assert!(!r.contains(DeployDelayReason::NO_DELAY));
        assert!(DeployDelayReason::NO_DELAY.contains(DeployDelayReason::NO_DELAY));
        assert!(!DeployDelayReason::NO_DELAY.contains(DeployDelayReason::CANARY));
    }

    #[test]
    fn test_display_in_definition_order() {
        let r = DeployDelayReason::NO_DELAY
            .add(DeployDelayReason::OUT_OF_WINDOW)
            .add(DeployDelayReason::COOLDOWN)
            .add(DeployDelayReason::NOTIFICATION);
        assert_eq!(r.to_string(), "cooldown, notification, outOfWindow");
        assert_eq!(DeployDelayReason::NO_DELAY.to_string(), "noDelay");
    }

    #[test]
    fn test_message_with_apply_time() {
        let r = DeployDelayReason::CANARY.add(DeployDelayReason::OUT_OF_WINDOW);
        assert_eq!(
            r.message("v1.30.0", Some(at())),
            "Release is postponed by canary process, waiting for the update window until 01 Mar 2026 13:00 UTC"
        );
    }

    #[test]
    fn test_message_without_apply_time() {
        assert_eq!(
            DeployDelayReason::MANUAL_APPROVAL.message("v1.30.0", None),
            "Release is waiting for manual approval"
        );
    }

    #[test]
    fn test_manual_approval_message_clause() {
        let r = DeployDelayReason::NOTIFICATION.add(DeployDelayReason::MANUAL_APPROVAL);
        assert_eq!(
            r.message("v1.30.0", Some(at())),
            "Release is postponed by notification, waiting for manual approval. After approval the release will be delayed until 01 Mar 2026 13:00 UTC"
        );
    }

    #[test]
    fn test_message_is_stable() {
        let r = DeployDelayReason::COOLDOWN.add(DeployDelayReason::CANARY);
        assert_eq!(r.message("x", Some(at())), r.message("x", Some(at())));
    }
}
