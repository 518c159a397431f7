use crate::guard::GuardError;

/// Coarse classification of a [`ToolError`], stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller input was unsafe; retrying with different input may succeed.
    Guard,
    /// The action or target is categorically disallowed for this deployment.
    Policy,
    /// The external program could not be started at all.
    Spawn,
    /// Failure inside the core itself (serialization, registry lookups).
    Internal,
}

/// Errors that can occur while preparing or running a tool call.
///
/// A completed process with a nonzero exit, a timeout, or a truncated capture is not an
/// error: those are fields of [`crate::runner::RunOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error("invalid tool parameters: {message}")]
    InvalidParams { message: String },

    #[error("action '{action}' is not allowed for tool family '{family}'")]
    PolicyDenied { family: String, action: String },

    #[error("path outside allowed roots for tool family '{family}': {path}")]
    RootDenied { family: String, path: String },

    #[error("executable not found: {program}")]
    NotFound { program: String },

    #[error("permission denied executing {program}")]
    PermissionDenied { program: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("working directory does not exist: {path}")]
    InvalidWorkingDir { path: String },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },

    #[error("failed to serialize tool output: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ToolError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Guard(_) | Self::InvalidParams { .. } => ErrorCategory::Guard,
            Self::PolicyDenied { .. } | Self::RootDenied { .. } => ErrorCategory::Policy,
            Self::NotFound { .. }
            | Self::PermissionDenied { .. }
            | Self::Spawn { .. }
            | Self::InvalidWorkingDir { .. }
            | Self::Wait { .. } => ErrorCategory::Spawn,
            Self::Serialize(_) | Self::Registry(_) => ErrorCategory::Internal,
        }
    }

    /// Map a spawn-time I/O error to the matching variant.
    #[must_use]
    pub fn from_spawn(program: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound {
                program: program.to_owned(),
            },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                program: program.to_owned(),
            },
            _ => Self::Spawn {
                program: program.to_owned(),
                source: err,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("tool '{name}' is not registered")]
    UnknownTool { name: String },

    #[error("tool '{name}' is already registered")]
    Duplicate { name: String },

    #[error("tool '{name}' is deferred; call discover_tools first")]
    NotActivated { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::GuardReason;

    #[test]
    fn policy_denied_display() {
        let err = ToolError::PolicyDenied {
            family: "bazel".into(),
            action: "clean --expunge".into(),
        };
        assert_eq!(
            err.to_string(),
            "action 'clean --expunge' is not allowed for tool family 'bazel'"
        );
    }

    #[test]
    fn root_denied_display() {
        let err = ToolError::RootDenied {
            family: "security".into(),
            path: "/etc".into(),
        };
        assert_eq!(
            err.to_string(),
            "path outside allowed roots for tool family 'security': /etc"
        );
    }

    #[test]
    fn guard_error_is_transparent() {
        let err = ToolError::from(GuardError {
            field: "branch".into(),
            value: "--force".into(),
            reason: GuardReason::FlagLike,
        });
        let msg = err.to_string();
        assert!(msg.contains("branch"));
        assert!(msg.contains("--force"));
        assert_eq!(err.category(), ErrorCategory::Guard);
    }

    #[test]
    fn categories_are_disjoint() {
        let policy = ToolError::PolicyDenied {
            family: "f".into(),
            action: "a".into(),
        };
        let root = ToolError::RootDenied {
            family: "f".into(),
            path: "/".into(),
        };
        let missing = ToolError::NotFound {
            program: "nope".into(),
        };
        let registry = ToolError::from(RegistryError::UnknownTool { name: "x".into() });
        assert_eq!(policy.category(), ErrorCategory::Policy);
        assert_eq!(root.category(), ErrorCategory::Policy);
        assert_eq!(missing.category(), ErrorCategory::Spawn);
        assert_eq!(registry.category(), ErrorCategory::Internal);
    }

    #[test]
    fn from_spawn_maps_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = ToolError::from_spawn("terraform", io);
        assert!(matches!(err, ToolError::NotFound { ref program } if program == "terraform"));
        assert_eq!(err.to_string(), "executable not found: terraform");
    }

    #[test]
    fn from_spawn_maps_permission_denied() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ToolError::from_spawn("./script.sh", io);
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
    }

    #[test]
    fn from_spawn_other_kinds_keep_source() {
        let io = std::io::Error::other("fork failed");
        let err = ToolError::from_spawn("git", io);
        assert!(matches!(err, ToolError::Spawn { .. }));
        assert!(err.to_string().contains("fork failed"));
        assert_eq!(err.category(), ErrorCategory::Spawn);
    }

    #[test]
    fn registry_error_display() {
        let err = RegistryError::Duplicate {
            name: "git_status".into(),
        };
        assert_eq!(err.to_string(), "tool 'git_status' is already registered");
    }
}
