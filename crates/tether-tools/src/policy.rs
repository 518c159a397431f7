//! Static allow/deny decisions: which actions may run, which roots may be targeted, and
//! which tools are advertised at all.
//!
//! The gate is built once from [`PolicyConfig`] and shared read-only (`Arc<PolicyGate>`);
//! nothing mutates it after startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::Deserialize;

use crate::config::PolicyConfig;
use crate::error::ToolError;

/// Family key whose roots apply to every tool family.
pub const ANY_FAMILY: &str = "*";

/// Action name a family must allow before shell-interpreted commands may run.
pub const SHELL_ACTION: &str = "shell";

/// Action a permission rule resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Deny,
}

/// Single permission rule: glob `pattern` + action.
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionRule {
    pub pattern: String,
    pub action: PermissionAction,
}

impl PermissionRule {
    #[must_use]
    pub fn allow(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            action: PermissionAction::Allow,
        }
    }

    #[must_use]
    pub fn deny(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            action: PermissionAction::Deny,
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    pattern: Pattern,
    action: PermissionAction,
}

/// Per-call identity a policy decision is made for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyContext {
    pub family: String,
    pub action: String,
    pub target_path: Option<PathBuf>,
    /// High-risk action that must be explicitly allowlisted (arbitrary code execution,
    /// destructive cleans, global installs).
    pub privileged: bool,
}

impl PolicyContext {
    #[must_use]
    pub fn new(family: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            action: action.into(),
            target_path: None,
            privileged: false,
        }
    }

    #[must_use]
    pub fn with_target(mut self, path: impl Into<PathBuf>) -> Self {
        self.target_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}

/// Command allowlist, root allowlist, and tool-exposure allowlist.
#[derive(Debug, Clone, Default)]
pub struct PolicyGate {
    commands: HashMap<String, Vec<CompiledRule>>,
    roots: HashMap<String, Vec<PathBuf>>,
    exposure: HashMap<String, Vec<Pattern>>,
}

impl PolicyGate {
    /// Compile the configured rule sets.
    ///
    /// Roots are canonicalized here so later checks compare resolved paths.
    ///
    /// # Errors
    ///
    /// Returns [`glob::PatternError`] for an invalid command or exposure pattern.
    pub fn from_config(config: &PolicyConfig) -> Result<Self, glob::PatternError> {
        let mut commands = HashMap::with_capacity(config.commands.len());
        for (family, rules) in &config.commands {
            let compiled = rules
                .iter()
                .map(|r| {
                    Ok(CompiledRule {
                        pattern: Pattern::new(&r.pattern.to_lowercase())?,
                        action: r.action,
                    })
                })
                .collect::<Result<Vec<_>, glob::PatternError>>()?;
            commands.insert(family.clone(), compiled);
        }

        let roots = config
            .roots
            .iter()
            .map(|(family, paths)| {
                let resolved = paths
                    .iter()
                    .map(|p| resolve_via_ancestors(Path::new(p)))
                    .collect();
                (family.clone(), resolved)
            })
            .collect();

        let mut exposure = HashMap::with_capacity(config.exposure.len());
        for (family, names) in &config.exposure {
            let compiled = names
                .iter()
                .map(|n| Pattern::new(n))
                .collect::<Result<Vec<_>, _>>()?;
            exposure.insert(family.clone(), compiled);
        }

        Ok(Self {
            commands,
            roots,
            exposure,
        })
    }

    /// Default-deny check for a high-risk action. First matching glob wins; matching is
    /// case-insensitive on the action.
    #[must_use]
    pub fn is_command_allowed(&self, family: &str, action: &str) -> bool {
        let Some(rules) = self.commands.get(family) else {
            return false;
        };
        let normalized = action.trim().to_lowercase();
        rules
            .iter()
            .find(|r| r.pattern.matches(&normalized))
            .is_some_and(|r| r.action == PermissionAction::Allow)
    }

    /// Whether `path` lies under one of the roots configured for `family` (or for `"*"`).
    /// Unrestricted when neither is configured.
    #[must_use]
    pub fn is_root_allowed(&self, path: &Path, family: &str) -> bool {
        let family_roots = self.roots.get(family);
        let global_roots = self.roots.get(ANY_FAMILY);
        if family_roots.is_none() && global_roots.is_none() {
            return true;
        }
        let resolved = resolve_via_ancestors(&absolutize(path));
        family_roots
            .into_iter()
            .chain(global_roots)
            .flatten()
            .any(|root| resolved.starts_with(root))
    }

    /// Startup-time filter deciding whether a tool is advertised to the client.
    #[must_use]
    pub fn is_tool_exposed(&self, family: &str, tool_name: &str) -> bool {
        self.exposure
            .get(family)
            .is_none_or(|patterns| patterns.iter().any(|p| p.matches(tool_name)))
    }

    /// [`Self::is_command_allowed`] as a `Result`.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::PolicyDenied`] when the action is not allowlisted.
    pub fn check_command(&self, family: &str, action: &str) -> Result<(), ToolError> {
        if self.is_command_allowed(family, action) {
            return Ok(());
        }
        tracing::warn!(family, action, "action denied by policy");
        Err(ToolError::PolicyDenied {
            family: family.to_owned(),
            action: action.to_owned(),
        })
    }

    /// [`Self::is_root_allowed`] as a `Result`.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::RootDenied`] with the resolved path.
    pub fn check_root(&self, path: &Path, family: &str) -> Result<(), ToolError> {
        if self.is_root_allowed(path, family) {
            return Ok(());
        }
        let resolved = resolve_via_ancestors(&absolutize(path));
        tracing::warn!(family, path = %resolved.display(), "path outside allowed roots");
        Err(ToolError::RootDenied {
            family: family.to_owned(),
            path: resolved.display().to_string(),
        })
    }

    /// Root check for any target path, plus the command check for privileged actions.
    ///
    /// # Errors
    ///
    /// Returns the first policy denial.
    pub fn authorize(&self, ctx: &PolicyContext) -> Result<(), ToolError> {
        if let Some(ref path) = ctx.target_path {
            self.check_root(path, &ctx.family)?;
        }
        if ctx.privileged {
            self.check_command(&ctx.family, &ctx.action)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn families_with_command_rules(&self) -> Vec<&str> {
        let mut families: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        families.sort_unstable();
        families
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    }
}

/// Resolve `path` one component at a time. Each existing prefix is canonicalized before
/// the next `..` is applied, so `..` steps out of a symlink's target rather than the link
/// itself; components past the first missing one are appended as text.
pub(crate) fn resolve_via_ancestors(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut resolved = PathBuf::new();
    let mut missing = false;
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
                if missing && resolved.exists() {
                    missing = false;
                }
            }
            Component::Normal(name) => {
                resolved.push(name);
                if !missing {
                    match resolved.canonicalize() {
                        Ok(real) => resolved = real,
                        Err(_) => missing = true,
                    }
                }
            }
            other => {
                resolved.push(other.as_os_str());
                if let Ok(real) = resolved.canonicalize() {
                    resolved = real;
                }
            }
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_with_commands(family: &str, rules: Vec<PermissionRule>) -> PolicyGate {
        let mut config = PolicyConfig::default();
        config.commands.insert(family.to_owned(), rules);
        PolicyGate::from_config(&config).unwrap()
    }

    #[test]
    fn family_without_rules_is_denied() {
        let gate = PolicyGate::default();
        assert!(!gate.is_command_allowed("bazel", "run"));
    }

    #[test]
    fn unmatched_action_is_denied() {
        let gate = gate_with_commands("bazel", vec![PermissionRule::allow("run")]);
        assert!(gate.is_command_allowed("bazel", "run"));
        assert!(!gate.is_command_allowed("bazel", "clean --expunge"));
    }

    #[test]
    fn first_matching_rule_wins() {
        let gate = gate_with_commands(
            "bazel",
            vec![
                PermissionRule::deny("clean --expunge"),
                PermissionRule::allow("clean*"),
            ],
        );
        assert!(!gate.is_command_allowed("bazel", "clean --expunge"));
        assert!(gate.is_command_allowed("bazel", "clean"));
    }

    #[test]
    fn action_matching_is_case_insensitive() {
        let gate = gate_with_commands("npm", vec![PermissionRule::allow("install -g*")]);
        assert!(gate.is_command_allowed("npm", "INSTALL -g typescript"));
        assert!(gate.is_command_allowed("npm", "  install -g eslint  "));
    }

    #[test]
    fn family_is_case_sensitive() {
        let gate = gate_with_commands("process", vec![PermissionRule::allow("*")]);
        assert!(gate.is_command_allowed("process", "run"));
        assert!(!gate.is_command_allowed("PROCESS", "run"));
    }

    #[test]
    fn check_command_returns_policy_error() {
        let gate = PolicyGate::default();
        let err = gate.check_command("security", "run").unwrap_err();
        assert!(matches!(err, ToolError::PolicyDenied { .. }));
    }

    #[test]
    fn invalid_pattern_rejected_at_load() {
        let mut config = PolicyConfig::default();
        config
            .commands
            .insert("x".into(), vec![PermissionRule::allow("[unclosed")]);
        assert!(PolicyGate::from_config(&config).is_err());
    }

    #[test]
    fn roots_unrestricted_by_default() {
        let gate = PolicyGate::default();
        assert!(gate.is_root_allowed(Path::new("/etc/passwd"), "security"));
    }

    #[test]
    fn roots_restrict_family() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PolicyConfig::default();
        config.roots.insert(
            "security".into(),
            vec![dir.path().display().to_string()],
        );
        let gate = PolicyGate::from_config(&config).unwrap();

        assert!(gate.is_root_allowed(dir.path(), "security"));
        assert!(gate.is_root_allowed(&dir.path().join("repo/src"), "security"));
        assert!(!gate.is_root_allowed(Path::new("/etc"), "security"));
        assert!(gate.is_root_allowed(Path::new("/etc"), "git"));
    }

    #[test]
    fn global_roots_apply_to_every_family() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PolicyConfig::default();
        config
            .roots
            .insert(ANY_FAMILY.into(), vec![dir.path().display().to_string()]);
        let gate = PolicyGate::from_config(&config).unwrap();
        assert!(gate.is_root_allowed(&dir.path().join("file"), "docker"));
        assert!(!gate.is_root_allowed(Path::new("/usr"), "docker"));
    }

    #[test]
    fn parent_dir_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PolicyConfig::default();
        config
            .roots
            .insert("process".into(), vec![dir.path().display().to_string()]);
        let gate = PolicyGate::from_config(&config).unwrap();
        let escape = dir.path().join("missing/../../..");
        assert!(!gate.is_root_allowed(&escape, "process"));
        let err = gate.check_root(&escape, "process").unwrap_err();
        assert!(matches!(err, ToolError::RootDenied { .. }));
    }

    #[test]
    fn exposure_defaults_to_all() {
        let gate = PolicyGate::default();
        assert!(gate.is_tool_exposed("git", "git_push"));
    }

    #[test]
    fn exposure_filters_by_glob() {
        let mut config = PolicyConfig::default();
        config
            .exposure
            .insert("git".into(), vec!["git_status".into(), "git_log*".into()]);
        config.exposure.insert("docker".into(), Vec::new());
        let gate = PolicyGate::from_config(&config).unwrap();
        assert!(gate.is_tool_exposed("git", "git_status"));
        assert!(gate.is_tool_exposed("git", "git_log_graph"));
        assert!(!gate.is_tool_exposed("git", "git_push"));
        assert!(!gate.is_tool_exposed("docker", "docker_ps"));
        assert!(gate.is_tool_exposed("kubectl", "kubectl_get"));
    }

    #[test]
    fn authorize_skips_command_check_for_unprivileged() {
        let gate = PolicyGate::default();
        let ctx = PolicyContext::new("git", "status");
        assert!(gate.authorize(&ctx).is_ok());
        let ctx = PolicyContext::new("git", "clean -fdx").privileged();
        assert!(matches!(
            gate.authorize(&ctx),
            Err(ToolError::PolicyDenied { .. })
        ));
    }

    #[test]
    fn authorize_checks_root_before_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PolicyConfig::default();
        config
            .roots
            .insert("security".into(), vec![dir.path().display().to_string()]);
        let gate = PolicyGate::from_config(&config).unwrap();
        let ctx = PolicyContext::new("security", "scan")
            .with_target("/etc")
            .privileged();
        assert!(matches!(
            gate.authorize(&ctx),
            Err(ToolError::RootDenied { .. })
        ));
    }

    #[test]
    fn resolve_via_ancestors_keeps_missing_tail() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        let resolved = resolve_via_ancestors(&dir.path().join("a/b/c.txt"));
        assert_eq!(resolved, base.join("a/b/c.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn parent_dir_after_symlink_follows_link_target() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let inner = outside.path().join("deep/inner");
        std::fs::create_dir_all(&inner).unwrap();
        std::os::unix::fs::symlink(&inner, root.path().join("link")).unwrap();

        let mut config = PolicyConfig::default();
        config
            .roots
            .insert("process".into(), vec![root.path().display().to_string()]);
        let gate = PolicyGate::from_config(&config).unwrap();

        let through_link = root.path().join("link/../secret");
        assert_eq!(
            resolve_via_ancestors(&through_link),
            outside.path().canonicalize().unwrap().join("deep/secret")
        );
        assert!(!gate.is_root_allowed(&through_link, "process"));
        assert!(!gate.is_root_allowed(&root.path().join("link"), "process"));
        assert!(gate.is_root_allowed(&root.path().join("sub/../file"), "process"));
    }

    #[test]
    fn families_with_command_rules_sorted() {
        let mut config = PolicyConfig::default();
        config.commands.insert("npm".into(), Vec::new());
        config.commands.insert("bazel".into(), Vec::new());
        let gate = PolicyGate::from_config(&config).unwrap();
        assert_eq!(gate.families_with_command_rules(), vec!["bazel", "npm"]);
    }
}
