//! Input safety checks applied to caller-supplied strings before they become argv entries.
//!
//! Every value destined to be a positional argument of an external program (paths, branch
//! names, commit messages, filter expressions, tags) must pass [`check_not_flag_like`].
//! Flags the adapter constructs itself are never checked. Length ceilings per
//! [`FieldClass`] are enforced separately by [`InputGuard`].

use std::fmt;

use crate::config::FieldLimits;

/// Why a value was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardReason {
    /// Starts with `-` after trimming, so the program could parse it as an option.
    FlagLike,
    TooLong { limit: usize, actual: usize },
}

impl fmt::Display for GuardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlagLike => f.write_str("value must not start with '-'"),
            Self::TooLong { limit, actual } => {
                write!(f, "value is {actual} characters, limit is {limit}")
            }
        }
    }
}

/// Rejection of a single caller-supplied field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field} '{value}': {reason}")]
pub struct GuardError {
    pub field: String,
    pub value: String,
    pub reason: GuardReason,
}

/// Reject values that would be reinterpreted as command-line flags.
///
/// Leading and trailing whitespace is trimmed before the check, so `" --force"` and
/// `"\t--force"` are rejected just like `"--force"`.
///
/// # Errors
///
/// Returns [`GuardError`] with [`GuardReason::FlagLike`] carrying `field` and the original
/// `value`.
pub fn check_not_flag_like(value: &str, field: &str) -> Result<(), GuardError> {
    if value.trim().starts_with('-') {
        tracing::debug!(field, "rejected flag-like value");
        return Err(GuardError {
            field: field.to_owned(),
            value: value.to_owned(),
            reason: GuardReason::FlagLike,
        });
    }
    Ok(())
}

/// Length class of an input field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    /// Branch names, tags, image names, target labels.
    Identifier,
    Path,
    /// Filter expressions, search queries.
    Text,
    /// Commit messages and other free-form bodies.
    Message,
}

/// Length ceilings plus the flag check, configured once at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputGuard {
    limits: FieldLimits,
}

impl InputGuard {
    #[must_use]
    pub fn new(limits: FieldLimits) -> Self {
        Self { limits }
    }

    #[must_use]
    pub fn limit(&self, class: FieldClass) -> usize {
        match class {
            FieldClass::Identifier => self.limits.identifier,
            FieldClass::Path => self.limits.path,
            FieldClass::Text => self.limits.text,
            FieldClass::Message => self.limits.message,
        }
    }

    /// Enforce the maximum length for `class`, counted in characters.
    ///
    /// # Errors
    ///
    /// Returns [`GuardReason::TooLong`] when the value exceeds the configured limit. The
    /// reported value is cut to the limit so oversized input is not echoed back in full.
    pub fn check_length(
        &self,
        value: &str,
        field: &str,
        class: FieldClass,
    ) -> Result<(), GuardError> {
        let limit = self.limit(class);
        let actual = value.chars().count();
        if actual > limit {
            return Err(GuardError {
                field: field.to_owned(),
                value: value.chars().take(limit.min(64)).collect(),
                reason: GuardReason::TooLong { limit, actual },
            });
        }
        Ok(())
    }

    /// Length check followed by the flag check, for a value that becomes a positional argument.
    ///
    /// # Errors
    ///
    /// Returns the first failing check.
    pub fn check_positional(
        &self,
        value: &str,
        field: &str,
        class: FieldClass,
    ) -> Result<(), GuardError> {
        self.check_length(value, field, class)?;
        check_not_flag_like(value, field)
    }

    /// [`Self::check_positional`] over every element of a list field, e.g. a set of file paths.
    ///
    /// # Errors
    ///
    /// Returns the error for the first rejected element.
    pub fn check_each<S: AsRef<str>>(
        &self,
        values: &[S],
        field: &str,
        class: FieldClass,
    ) -> Result<(), GuardError> {
        values
            .iter()
            .try_for_each(|v| self.check_positional(v.as_ref(), field, class))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_exec_style_flag() {
        let err = check_not_flag_like("--exec=rm -rf /", "source").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("source"));
        assert!(msg.contains("--exec=rm -rf /"));
        assert_eq!(err.reason, GuardReason::FlagLike);
    }

    #[test]
    fn rejects_whitespace_padded_flags() {
        assert!(check_not_flag_like(" --force", "branch").is_err());
        assert!(check_not_flag_like("\t--force", "branch").is_err());
        assert!(check_not_flag_like("\n-f", "branch").is_err());
        assert!(check_not_flag_like("-", "branch").is_err());
    }

    #[test]
    fn error_keeps_original_untrimmed_value() {
        let err = check_not_flag_like("  -rf", "path").unwrap_err();
        assert_eq!(err.value, "  -rf");
        assert_eq!(err.field, "path");
    }

    #[test]
    fn accepts_ordinary_values() {
        assert!(check_not_flag_like("main", "branch").is_ok());
        assert!(check_not_flag_like("src/lib.rs", "path").is_ok());
        assert!(check_not_flag_like("fix: handle -1 offsets", "message").is_ok());
        assert!(check_not_flag_like("", "tag").is_ok());
        assert!(check_not_flag_like("   ", "tag").is_ok());
    }

    #[test]
    fn length_limit_per_class() {
        let guard = InputGuard::new(FieldLimits {
            identifier: 4,
            path: 8,
            text: 16,
            message: 32,
        });
        assert!(guard.check_length("main", "branch", FieldClass::Identifier).is_ok());
        let err = guard
            .check_length("feature", "branch", FieldClass::Identifier)
            .unwrap_err();
        assert_eq!(err.reason, GuardReason::TooLong { limit: 4, actual: 7 });
        assert!(guard.check_length("feature", "path", FieldClass::Path).is_ok());
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        let guard = InputGuard::new(FieldLimits {
            identifier: 3,
            ..FieldLimits::default()
        });
        assert!(guard.check_length("äöü", "tag", FieldClass::Identifier).is_ok());
    }

    #[test]
    fn too_long_error_does_not_echo_full_value() {
        let guard = InputGuard::new(FieldLimits {
            message: 100,
            ..FieldLimits::default()
        });
        let long = "x".repeat(10_000);
        let err = guard.check_length(&long, "message", FieldClass::Message).unwrap_err();
        assert_eq!(err.value.len(), 64);
        assert!(err.to_string().contains("limit is 100"));
    }

    #[test]
    fn positional_checks_length_before_flag() {
        let guard = InputGuard::new(FieldLimits {
            identifier: 2,
            ..FieldLimits::default()
        });
        let err = guard
            .check_positional("--force", "branch", FieldClass::Identifier)
            .unwrap_err();
        assert!(matches!(err.reason, GuardReason::TooLong { .. }));
    }

    #[test]
    fn check_each_reports_first_offender() {
        let guard = InputGuard::default();
        let files = vec!["a.txt", "-b.txt", "--c.txt"];
        let err = guard.check_each(&files, "files", FieldClass::Path).unwrap_err();
        assert_eq!(err.value, "-b.txt");
        assert!(guard.check_each(&["a", "b"], "files", FieldClass::Path).is_ok());
    }

    proptest! {
        #[test]
        fn flag_like_after_trim_always_rejected(
            pad_l in "[ \t\n\r]{0,4}",
            rest in "[^\\s]{0,20}",
            pad_r in "[ \t\n\r]{0,4}",
        ) {
            let value = format!("{pad_l}-{rest}{pad_r}");
            prop_assert!(check_not_flag_like(&value, "field").is_err());
        }

        #[test]
        fn non_flag_after_trim_never_rejected(value in "\\PC{0,40}") {
            prop_assume!(!value.trim().starts_with('-'));
            prop_assert!(check_not_flag_like(&value, "field").is_ok());
        }
    }
}
