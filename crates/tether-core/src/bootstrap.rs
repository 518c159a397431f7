//! Startup wiring: config resolution, policy compilation, host and registry construction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tether_tools::{AuditLogger, LazyToolRegistry, PolicyGate, ToolEventTx, ToolHost};

use crate::builtin;
use crate::config::{Config, resolve_config_path};

/// Everything a server needs to answer tool calls. Built once; the policy is never mutated.
#[derive(Debug)]
pub struct Runtime {
    pub policy: Arc<PolicyGate>,
    pub host: ToolHost,
    pub registry: LazyToolRegistry,
}

pub struct AppBuilder {
    config: Config,
    config_path: PathBuf,
}

impl AppBuilder {
    /// Resolve the config path and load it.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read, parsed or validated.
    pub fn load(cli_path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = resolve_config_path(cli_path);
        let config = Config::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;
        Ok(Self {
            config,
            config_path,
        })
    }

    #[must_use]
    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            config_path: PathBuf::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// # Errors
    ///
    /// Returns an error for an invalid glob pattern in the policy tables.
    pub fn build_policy(&self) -> anyhow::Result<Arc<PolicyGate>> {
        let gate = PolicyGate::from_config(&self.config.tools.policy)
            .context("invalid tools.policy pattern")?;
        tracing::debug!(
            families = ?gate.families_with_command_rules(),
            "policy gate compiled"
        );
        Ok(Arc::new(gate))
    }

    /// # Errors
    ///
    /// Returns an error if the audit destination cannot be opened.
    pub async fn build_host(
        &self,
        policy: Arc<PolicyGate>,
        events: Option<ToolEventTx>,
    ) -> anyhow::Result<ToolHost> {
        let mut host = ToolHost::new(&self.config.tools, policy);
        let audit = &self.config.tools.audit;
        if audit.enabled {
            let logger = AuditLogger::from_config(audit)
                .await
                .with_context(|| format!("opening audit log {}", audit.destination))?;
            host = host.with_audit(logger);
        }
        if let Some(tx) = events {
            host = host.with_tool_event_tx(tx);
        }
        Ok(host)
    }

    /// Registry with the built-in tool family registered.
    ///
    /// # Errors
    ///
    /// Returns an error on a duplicate tool name.
    pub fn build_registry(&self, policy: Arc<PolicyGate>) -> anyhow::Result<LazyToolRegistry> {
        let registry = LazyToolRegistry::new(&self.config.tools.registry, policy);
        for registration in builtin::registrations() {
            registry.register_lazy(registration)?;
        }
        tracing::info!(
            active = registry.active().len(),
            deferred = registry.deferred_names().len(),
            "tool registry ready"
        );
        Ok(registry)
    }

    /// # Errors
    ///
    /// Any error from the individual build steps.
    pub async fn build(&self, events: Option<ToolEventTx>) -> anyhow::Result<Runtime> {
        let policy = self.build_policy()?;
        let host = self.build_host(Arc::clone(&policy), events).await?;
        let registry = self.build_registry(Arc::clone(&policy))?;
        Ok(Runtime {
            policy,
            host,
            registry,
        })
    }
}
