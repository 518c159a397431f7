use std::collections::HashMap;

use serde::Deserialize;

use crate::policy::PermissionRule;
use crate::runner::TerminationSignal;
use crate::shape::MeasureKind;

/// Hard ceiling for any single process timeout.
pub const TIMEOUT_CEILING_SECS: u64 = 600;

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    60
}

fn default_max_timeout() -> u64 {
    TIMEOUT_CEILING_SECS
}

fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_kill_grace_ms() -> u64 {
    2_000
}

fn default_identifier_limit() -> usize {
    256
}

fn default_path_limit() -> usize {
    4_096
}

fn default_text_limit() -> usize {
    16_384
}

fn default_message_limit() -> usize {
    65_536
}

fn default_audit_destination() -> String {
    "stdout".into()
}

/// Top-level configuration for tool execution.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub limits: FieldLimits,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub shape: ShapeConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Process runner defaults and ceilings.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_timeout")]
    pub max_timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub kill_signal: TerminationSignal,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout(),
            max_timeout_secs: default_max_timeout(),
            max_output_bytes: default_max_output_bytes(),
            kill_signal: TerminationSignal::default(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

/// Maximum length, in characters, per input field class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FieldLimits {
    #[serde(default = "default_identifier_limit")]
    pub identifier: usize,
    #[serde(default = "default_path_limit")]
    pub path: usize,
    #[serde(default = "default_text_limit")]
    pub text: usize,
    #[serde(default = "default_message_limit")]
    pub message: usize,
}

impl Default for FieldLimits {
    fn default() -> Self {
        Self {
            identifier: default_identifier_limit(),
            path: default_path_limit(),
            text: default_text_limit(),
            message: default_message_limit(),
        }
    }
}

/// Static policy rule sets, keyed by tool family.
///
/// `commands` gates high-risk actions (no matching rule means deny), `roots` narrows the
/// filesystem subtrees a family may target (`"*"` applies to every family), and `exposure`
/// lists the tool names a family advertises (a missing family exposes everything).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub commands: HashMap<String, Vec<PermissionRule>>,
    #[serde(default)]
    pub roots: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub exposure: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ShapeConfig {
    #[serde(default)]
    pub measure: MeasureKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_true")]
    pub lazy: bool,
    /// Families whose tools skip deferral even when `lazy` is set.
    #[serde(default)]
    pub core_families: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lazy: true,
            core_families: Vec::new(),
        }
    }
}

/// Audit trail destination: `"stdout"` routes entries to the `audit` tracing target,
/// anything else is treated as a file path opened in append mode.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_audit_destination")]
    pub destination: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            destination: default_audit_destination(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PermissionAction;

    #[test]
    fn deserialize_omitted_fields_use_defaults() {
        let config: ToolsConfig = toml::from_str("").unwrap();
        assert_eq!(config.runner.default_timeout_secs, 60);
        assert_eq!(config.runner.max_timeout_secs, 600);
        assert_eq!(config.runner.max_output_bytes, 10 * 1024 * 1024);
        assert_eq!(config.runner.kill_signal, TerminationSignal::Term);
        assert_eq!(config.limits, FieldLimits::default());
        assert!(config.policy.commands.is_empty());
        assert_eq!(config.shape.measure, MeasureKind::Chars);
        assert!(config.registry.lazy);
        assert!(config.registry.core_families.is_empty());
        assert!(!config.audit.enabled);
        assert_eq!(config.audit.destination, "stdout");
    }

    #[test]
    fn deserialize_runner_section() {
        let toml_str = r#"
            [runner]
            default_timeout_secs = 30
            max_timeout_secs = 120
            max_output_bytes = 4096
            kill_signal = "SIGKILL"
            kill_grace_ms = 100
        "#;
        let config: ToolsConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.runner.default_timeout_secs, 30);
        assert_eq!(config.runner.max_timeout_secs, 120);
        assert_eq!(config.runner.max_output_bytes, 4096);
        assert_eq!(config.runner.kill_signal, TerminationSignal::Kill);
        assert_eq!(config.runner.kill_grace_ms, 100);
    }

    #[test]
    fn deserialize_policy_tables() {
        let toml_str = r#"
            [policy.commands]
            bazel = [
                { pattern = "clean --expunge", action = "deny" },
                { pattern = "run", action = "allow" },
            ]

            [policy.roots]
            security = ["/srv/repos"]
            "*" = ["/tmp"]

            [policy.exposure]
            git = ["git_status", "git_log*"]
        "#;
        let config: ToolsConfig = toml::from_str(toml_str).unwrap();
        let bazel = &config.policy.commands["bazel"];
        assert_eq!(bazel.len(), 2);
        assert_eq!(bazel[0].action, PermissionAction::Deny);
        assert_eq!(bazel[1].pattern, "run");
        assert_eq!(config.policy.roots["security"], vec!["/srv/repos"]);
        assert_eq!(config.policy.roots["*"], vec!["/tmp"]);
        assert_eq!(config.policy.exposure["git"].len(), 2);
    }

    #[test]
    fn deserialize_limits_partial() {
        let toml_str = r"
            [limits]
            path = 1024
        ";
        let config: ToolsConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.limits.path, 1024);
        assert_eq!(config.limits.identifier, 256);
        assert_eq!(config.limits.message, 65_536);
    }

    #[test]
    fn deserialize_shape_and_registry() {
        let toml_str = r#"
            [shape]
            measure = "tokens"

            [registry]
            lazy = false
            core_families = ["git", "docker"]
        "#;
        let config: ToolsConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.shape.measure, MeasureKind::Tokens);
        assert!(!config.registry.lazy);
        assert_eq!(config.registry.core_families, vec!["git", "docker"]);
    }

    #[test]
    fn unknown_kill_signal_rejected() {
        let toml_str = r#"
            [runner]
            kill_signal = "SIGUSR9"
        "#;
        assert!(toml::from_str::<ToolsConfig>(toml_str).is_err());
    }
}
