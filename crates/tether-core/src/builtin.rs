//! Built-in `process` tool family and tool-call dispatch.
//!
//! `process_run` executes one program with discrete arguments. The full command line is the
//! policy action, so a deployment allowlists it with patterns such as `"git status*"`.
//! `process_run_shell` hands a script to the system shell and is deferred until discovered.

use std::time::Duration;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tether_tools::{
    CommandSpec, DISCOVER_TOOL, DiscoverParams, FieldClass, LazyToolRegistry, OutputEnvelope,
    PolicyContext, RegistryError, SHELL_ACTION, Shapeable, ToolDef, ToolError, ToolHost,
    ToolRegistration, ToolState,
};

pub const PROCESS_FAMILY: &str = "process";
pub const PROCESS_RUN: &str = "process_run";
pub const PROCESS_RUN_SHELL: &str = "process_run_shell";

/// Parameters for `process_run`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProcessRunParams {
    /// Executable name or path
    pub program: String,
    /// Arguments, passed to the program as-is
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory
    pub cwd: Option<String>,
    /// Timeout in seconds, capped by the server maximum
    pub timeout_secs: Option<u64>,
    /// Text written to standard input
    pub stdin: Option<String>,
    /// Run with only PATH from the server environment
    #[serde(default)]
    pub clean_env: bool,
    /// Always return the full structured result
    #[serde(default)]
    pub full_output: bool,
}

/// Parameters for `process_run_shell`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProcessShellParams {
    /// Shell script to execute
    pub script: String,
    /// Positional parameters available to the script as $1, $2, ...
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory
    pub cwd: Option<String>,
    /// Timeout in seconds, capped by the server maximum
    pub timeout_secs: Option<u64>,
    /// Run with only PATH from the server environment
    #[serde(default)]
    pub clean_env: bool,
    /// Always return the full structured result
    #[serde(default)]
    pub full_output: bool,
}

fn process_run_schema() -> schemars::Schema {
    schemars::schema_for!(ProcessRunParams)
}

fn process_shell_schema() -> schemars::Schema {
    schemars::schema_for!(ProcessShellParams)
}

/// Registrations for the built-in family, in advertisement order.
#[must_use]
pub fn registrations() -> Vec<ToolRegistration> {
    vec![
        ToolRegistration::new(
            PROCESS_RUN,
            PROCESS_FAMILY,
            "Run a program with arguments and capture its output",
            process_run_schema,
        )
        .core(),
        ToolRegistration::new(
            PROCESS_RUN_SHELL,
            PROCESS_FAMILY,
            "Run a shell script; requires the shell action to be allowed",
            process_shell_schema,
        ),
    ]
}

#[derive(Debug, Serialize)]
struct DiscoveredTool {
    name: String,
    family: String,
    description: String,
}

/// Result of a `discover_tools` call.
#[derive(Debug, Serialize)]
struct Discovery {
    activated: Vec<DiscoveredTool>,
    remaining: usize,
}

#[derive(Debug, Serialize)]
struct DiscoveryNames {
    activated: Vec<String>,
    remaining: usize,
}

impl Discovery {
    fn new(defs: Vec<ToolDef>, remaining: usize) -> Self {
        Self {
            activated: defs
                .into_iter()
                .map(|d| DiscoveredTool {
                    name: d.name,
                    family: d.family,
                    description: d.description,
                })
                .collect(),
            remaining,
        }
    }
}

impl Shapeable for Discovery {
    type Compact = DiscoveryNames;

    fn format_full(&self) -> String {
        let mut out = format!("Enabled {} tool(s)", self.activated.len());
        for tool in &self.activated {
            out.push_str(&format!("\n- {}: {}", tool.name, tool.description));
        }
        out
    }

    fn project_compact(&self) -> DiscoveryNames {
        DiscoveryNames {
            activated: self.activated.iter().map(|t| t.name.clone()).collect(),
            remaining: self.remaining,
        }
    }

    fn format_compact(&self, compact: &DiscoveryNames) -> String {
        format!(
            "Enabled {} tool(s): {}",
            compact.activated.len(),
            compact.activated.join(", ")
        )
    }

    fn is_empty(&self) -> bool {
        self.activated.is_empty()
    }
}

fn parse<T: DeserializeOwned>(params: serde_json::Value) -> Result<T, ToolError> {
    serde_json::from_value(params).map_err(|e| ToolError::InvalidParams {
        message: e.to_string(),
    })
}

fn with_timeout(secs: Option<u64>, spec: CommandSpec) -> CommandSpec {
    match secs {
        Some(secs) => spec.timeout(Duration::from_secs(secs)),
        None => spec,
    }
}

/// Dispatch a tool call by name.
///
/// # Errors
///
/// [`RegistryError::UnknownTool`] for names hidden by policy or never registered,
/// [`RegistryError::NotActivated`] for deferred tools not yet discovered, invalid
/// parameters, guard rejections, and everything [`ToolHost::run`] returns.
pub async fn call(
    host: &ToolHost,
    registry: &LazyToolRegistry,
    name: &str,
    params: serde_json::Value,
) -> Result<OutputEnvelope, ToolError> {
    if name == DISCOVER_TOOL {
        let params: DiscoverParams = parse(params)?;
        let query = params.query.unwrap_or_default();
        let activated = registry.discover(&query);
        let discovery = Discovery::new(activated, registry.deferred_names().len());
        return host.shaper().shape(&discovery, "", true);
    }

    match registry.state(name) {
        ToolState::Active => {}
        ToolState::Deferred => {
            return Err(RegistryError::NotActivated {
                name: name.to_owned(),
            }
            .into());
        }
        ToolState::Unregistered => {
            return Err(RegistryError::UnknownTool {
                name: name.to_owned(),
            }
            .into());
        }
    }

    match name {
        PROCESS_RUN => run_program(host, parse(params)?).await,
        PROCESS_RUN_SHELL => run_shell(host, parse(params)?).await,
        _ => Err(RegistryError::UnknownTool {
            name: name.to_owned(),
        }
        .into()),
    }
}

async fn run_program(
    host: &ToolHost,
    params: ProcessRunParams,
) -> Result<OutputEnvelope, ToolError> {
    let call_ctx = PolicyContext::new(PROCESS_FAMILY, PROCESS_RUN);
    host.check_input(&call_ctx, &params.program, "program", FieldClass::Path)
        .await?;
    if let Some(ref cwd) = params.cwd {
        host.check_input(&call_ctx, cwd, "cwd", FieldClass::Path).await?;
    }
    let guard = host.guard();
    for arg in &params.args {
        guard.check_length(arg, "args", FieldClass::Text)?;
    }

    let mut spec = host.runner().spec(params.program).args(params.args);
    spec = with_timeout(params.timeout_secs, spec);
    if let Some(input) = params.stdin {
        guard.check_length(&input, "stdin", FieldClass::Message)?;
        spec = spec.stdin(input);
    }
    if params.clean_env {
        spec = spec.stripped_env();
    }

    let mut ctx = PolicyContext::new(PROCESS_FAMILY, spec.display_line()).privileged();
    if let Some(cwd) = params.cwd {
        ctx = ctx.with_target(&cwd);
        spec = spec.current_dir(cwd);
    }

    host.run_shaped(&ctx, spec, params.full_output).await
}

async fn run_shell(
    host: &ToolHost,
    params: ProcessShellParams,
) -> Result<OutputEnvelope, ToolError> {
    let call_ctx = PolicyContext::new(PROCESS_FAMILY, PROCESS_RUN_SHELL);
    if let Some(ref cwd) = params.cwd {
        host.check_input(&call_ctx, cwd, "cwd", FieldClass::Path).await?;
    }
    let guard = host.guard();
    guard.check_length(&params.script, "script", FieldClass::Message)?;
    for arg in &params.args {
        guard.check_length(arg, "args", FieldClass::Text)?;
    }

    let mut spec = host.runner().shell_spec(params.script).args(params.args);
    spec = with_timeout(params.timeout_secs, spec);
    if params.clean_env {
        spec = spec.stripped_env();
    }

    let mut ctx = PolicyContext::new(PROCESS_FAMILY, SHELL_ACTION);
    if let Some(cwd) = params.cwd {
        ctx = ctx.with_target(&cwd);
        spec = spec.current_dir(cwd);
    }

    host.run_shaped(&ctx, spec, params.full_output).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tether_tools::{
        ErrorCategory, PayloadFormat, PermissionRule, PolicyConfig, PolicyGate, RegistryConfig,
        ToolsConfig,
    };

    use super::*;

    fn setup(rules: &[&str]) -> (ToolHost, LazyToolRegistry) {
        let mut policy = PolicyConfig::default();
        policy.commands.insert(
            PROCESS_FAMILY.into(),
            rules.iter().map(|r| PermissionRule::allow(*r)).collect(),
        );
        let gate = Arc::new(PolicyGate::from_config(&policy).unwrap());
        let host = ToolHost::new(&ToolsConfig::default(), Arc::clone(&gate));
        let registry = LazyToolRegistry::new(&RegistryConfig::default(), gate);
        for reg in registrations() {
            registry.register_lazy(reg).unwrap();
        }
        (host, registry)
    }

    #[test]
    fn run_is_core_and_shell_is_deferred() {
        let (_, registry) = setup(&[]);
        assert_eq!(registry.state(PROCESS_RUN), ToolState::Active);
        assert_eq!(registry.state(PROCESS_RUN_SHELL), ToolState::Deferred);
        let listing = registry.format_listing();
        assert!(listing.contains("## process_run\n"));
        assert!(listing.contains("  - program: Executable name or path (string, required)"));
        assert!(listing.contains("## discover_tools"));
    }

    #[tokio::test]
    async fn process_run_denied_by_default() {
        let (host, registry) = setup(&[]);
        let err = call(&host, &registry, PROCESS_RUN, json!({ "program": "echo", "args": ["hi"] }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PolicyDenied { ref action, .. } if action == "echo hi"));
    }

    #[tokio::test]
    async fn flag_like_program_rejected() {
        let (host, registry) = setup(&["*"]);
        let err = call(&host, &registry, PROCESS_RUN, json!({ "program": "--version" }))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Guard);
    }

    #[tokio::test]
    async fn invalid_params_rejected() {
        let (host, registry) = setup(&["*"]);
        let err = call(&host, &registry, PROCESS_RUN, json!({ "args": [] }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn unknown_tool_rejected() {
        let (host, registry) = setup(&[]);
        let err = call(&host, &registry, "git_push", json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            ToolError::Registry(RegistryError::UnknownTool { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn allowlisted_program_runs() {
        let (host, registry) = setup(&["echo *"]);
        let env = call(
            &host,
            &registry,
            PROCESS_RUN,
            json!({ "program": "echo", "args": ["hello"], "full_output": true }),
        )
        .await
        .unwrap();
        assert_eq!(env.format, PayloadFormat::Full);
        assert_eq!(env.structured["stdout"], "hello\n");
        assert!(!env.is_error);
    }

    #[tokio::test]
    async fn deferred_tool_needs_discovery_before_call() {
        let (host, registry) = setup(&[SHELL_ACTION]);
        let err = call(&host, &registry, PROCESS_RUN_SHELL, json!({ "script": "true" }))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ToolError::Registry(RegistryError::NotActivated { ref name }) if name == PROCESS_RUN_SHELL
        ));
        assert_eq!(registry.state(PROCESS_RUN_SHELL), ToolState::Deferred);
    }

    #[tokio::test]
    async fn shell_requires_shell_action() {
        let (host, registry) = setup(&["echo *"]);
        registry.activate(PROCESS_RUN_SHELL).unwrap();
        let err = call(
            &host,
            &registry,
            PROCESS_RUN_SHELL,
            json!({ "script": "echo hi" }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::PolicyDenied { ref action, .. } if action == SHELL_ACTION));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn discovery_then_shell() {
        let (host, registry) = setup(&[SHELL_ACTION]);
        let env = call(&host, &registry, DISCOVER_TOOL, json!({ "query": "shell" }))
            .await
            .unwrap();
        assert!(env.summary.contains(PROCESS_RUN_SHELL));
        assert_eq!(env.structured["remaining"], 0);
        assert!(!registry.has_deferred_tools());

        let env = call(
            &host,
            &registry,
            PROCESS_RUN_SHELL,
            json!({ "script": "printf '%s' \"$1\"", "args": ["a b"], "full_output": true }),
        )
        .await
        .unwrap();
        assert_eq!(env.structured["stdout"], "a b");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_clean_env_drops_server_variables() {
        let (host, registry) = setup(&[SHELL_ACTION]);
        registry.activate(PROCESS_RUN_SHELL).unwrap();
        let env = call(
            &host,
            &registry,
            PROCESS_RUN_SHELL,
            json!({
                "script": "printf '%s|%s' \"${CARGO_MANIFEST_DIR:-unset}\" \"${PATH:+path}\"",
                "clean_env": true,
                "full_output": true,
            }),
        )
        .await
        .unwrap();
        assert_eq!(env.structured["stdout"], "unset|path");
    }

    #[tokio::test]
    async fn discovery_with_no_match_is_no_results() {
        let (host, registry) = setup(&[]);
        let env = call(&host, &registry, DISCOVER_TOOL, json!({ "query": "kubernetes" }))
            .await
            .unwrap();
        assert_eq!(env.summary, tether_tools::NO_RESULTS_SUMMARY);
        assert!(registry.has_deferred_tools());
    }
}
