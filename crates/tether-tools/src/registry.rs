//! Lazy tool registry.
//!
//! Core tools are advertised as soon as they are registered. Every other tool is parked in a
//! deferred set until a discovery call activates it, which keeps the up-front tool listing
//! small when many families are enabled. A tool moves `Unregistered -> Deferred -> Active`
//! and never back.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{Arc, PoisonError, RwLock};

use schemars::{JsonSchema, Schema};
use serde::Deserialize;

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::policy::PolicyGate;

pub const DISCOVER_TOOL: &str = "discover_tools";

/// A tool registration as supplied by an adapter. The schema is built on activation.
#[derive(Debug, Clone)]
pub struct ToolRegistration {
    pub name: String,
    pub family: String,
    pub description: String,
    pub core: bool,
    pub schema: fn() -> Schema,
}

impl ToolRegistration {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        family: impl Into<String>,
        description: impl Into<String>,
        schema: fn() -> Schema,
    ) -> Self {
        Self {
            name: name.into(),
            family: family.into(),
            description: description.into(),
            core: false,
            schema,
        }
    }

    #[must_use]
    pub fn core(mut self) -> Self {
        self.core = true;
        self
    }

    fn materialize(&self) -> ToolDef {
        ToolDef {
            name: self.name.clone(),
            family: self.family.clone(),
            description: self.description.clone(),
            schema: (self.schema)(),
        }
    }

    fn matches(&self, needle: &str) -> bool {
        needle.is_empty()
            || self.name.to_lowercase().contains(needle)
            || self.family.to_lowercase().contains(needle)
            || self.description.to_lowercase().contains(needle)
    }
}

/// An advertised tool.
#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: String,
    pub family: String,
    pub description: String,
    pub schema: Schema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolState {
    Unregistered,
    Deferred,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Activated { name: String, family: String },
}

pub type RegistryEventTx = tokio::sync::mpsc::UnboundedSender<RegistryEvent>;

/// Parameters of the built-in discovery tool.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct DiscoverParams {
    /// Case-insensitive substring matched against tool name, family and description. Empty
    /// activates every deferred tool.
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    active: Vec<ToolDef>,
    deferred: BTreeMap<String, ToolRegistration>,
}

impl Inner {
    fn contains(&self, name: &str) -> bool {
        self.deferred.contains_key(name) || self.active.iter().any(|t| t.name == name)
    }
}

#[derive(Debug)]
pub struct LazyToolRegistry {
    inner: RwLock<Inner>,
    policy: Arc<PolicyGate>,
    lazy: bool,
    core_families: Vec<String>,
    events: Option<RegistryEventTx>,
}

impl LazyToolRegistry {
    #[must_use]
    pub fn new(config: &RegistryConfig, policy: Arc<PolicyGate>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            policy,
            lazy: config.lazy,
            core_families: config.core_families.clone(),
            events: None,
        }
    }

    #[must_use]
    pub fn with_events(mut self, tx: RegistryEventTx) -> Self {
        self.events = Some(tx);
        self
    }

    fn is_core(&self, registration: &ToolRegistration) -> bool {
        !self.lazy
            || registration.core
            || self.core_families.iter().any(|f| *f == registration.family)
    }

    /// Register a tool. Core tools become active immediately, the rest are deferred. Tools
    /// hidden by the exposure policy are dropped and stay `Unregistered`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if the name is already registered.
    pub fn register_lazy(&self, registration: ToolRegistration) -> Result<ToolState, RegistryError> {
        if !self
            .policy
            .is_tool_exposed(&registration.family, &registration.name)
        {
            tracing::debug!(tool = %registration.name, family = %registration.family, "tool not exposed by policy");
            return Ok(ToolState::Unregistered);
        }

        let core = self.is_core(&registration);
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.contains(&registration.name) {
            return Err(RegistryError::Duplicate {
                name: registration.name,
            });
        }

        if core {
            let def = registration.materialize();
            tracing::debug!(tool = %def.name, "registered core tool");
            inner.active.push(def);
            Ok(ToolState::Active)
        } else {
            tracing::debug!(tool = %registration.name, "deferred tool registration");
            inner
                .deferred
                .insert(registration.name.clone(), registration);
            Ok(ToolState::Deferred)
        }
    }

    #[must_use]
    pub fn has_deferred_tools(&self) -> bool {
        !self.read().deferred.is_empty()
    }

    #[must_use]
    pub fn state(&self, name: &str) -> ToolState {
        let inner = self.read();
        if inner.active.iter().any(|t| t.name == name) {
            ToolState::Active
        } else if inner.deferred.contains_key(name) {
            ToolState::Deferred
        } else {
            ToolState::Unregistered
        }
    }

    /// Activate a deferred tool. Activating an already active tool returns it unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownTool`] if the name was never registered.
    pub fn activate(&self, name: &str) -> Result<ToolDef, RegistryError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(def) = inner.active.iter().find(|t| t.name == name) {
            return Ok(def.clone());
        }
        let registration = inner
            .deferred
            .remove(name)
            .ok_or_else(|| RegistryError::UnknownTool {
                name: name.to_owned(),
            })?;
        let def = registration.materialize();
        inner.active.push(def.clone());
        drop(inner);
        self.notify(&def);
        Ok(def)
    }

    /// Activate every deferred tool matching `query` and return the newly active tools.
    pub fn discover(&self, query: &str) -> Vec<ToolDef> {
        let needle = query.trim().to_lowercase();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let names: Vec<String> = inner
            .deferred
            .values()
            .filter(|r| r.matches(&needle))
            .map(|r| r.name.clone())
            .collect();

        let mut activated = Vec::with_capacity(names.len());
        for name in names {
            if let Some(registration) = inner.deferred.remove(&name) {
                let def = registration.materialize();
                inner.active.push(def.clone());
                activated.push(def);
            }
        }
        drop(inner);

        tracing::info!(query, activated = activated.len(), "tool discovery");
        for def in &activated {
            self.notify(def);
        }
        activated
    }

    pub fn activate_all(&self) -> Vec<ToolDef> {
        self.discover("")
    }

    /// Names of tools still waiting for discovery.
    #[must_use]
    pub fn deferred_names(&self) -> Vec<String> {
        self.read().deferred.keys().cloned().collect()
    }

    #[must_use]
    pub fn active(&self) -> Vec<ToolDef> {
        self.read().active.clone()
    }

    /// Tools to advertise: every active tool, plus the discovery tool while any remain deferred.
    #[must_use]
    pub fn visible(&self) -> Vec<ToolDef> {
        let inner = self.read();
        let mut tools = inner.active.clone();
        if !inner.deferred.is_empty() {
            tools.push(discovery_def());
        }
        tools
    }

    #[must_use]
    pub fn format_listing(&self) -> String {
        let mut out = String::new();
        for tool in self.visible() {
            format_tool(&mut out, &tool);
        }
        out
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, def: &ToolDef) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(RegistryEvent::Activated {
                name: def.name.clone(),
                family: def.family.clone(),
            });
        }
    }
}

/// Definition of the built-in tool that activates deferred tools.
#[must_use]
pub fn discovery_def() -> ToolDef {
    ToolDef {
        name: DISCOVER_TOOL.to_owned(),
        family: "registry".to_owned(),
        description: "List and enable additional tools matching a query".to_owned(),
        schema: schemars::schema_for!(DiscoverParams),
    }
}

fn format_tool(out: &mut String, tool: &ToolDef) {
    let _ = writeln!(out, "## {}", tool.name);
    let _ = writeln!(out, "{} [{}]", tool.description, tool.family);
    format_schema_params(out, &tool.schema);
    out.push('\n');
}

/// Extract the primary type when schemars renders `Option<T>` as `"type": ["T", "null"]`
/// or `"anyOf": [{"type": "T"}, {"type": "null"}]`.
fn extract_non_null_type(obj: &serde_json::Map<String, serde_json::Value>) -> Option<&str> {
    if let Some(arr) = obj.get("type").and_then(|v| v.as_array()) {
        return arr.iter().filter_map(|v| v.as_str()).find(|t| *t != "null");
    }
    obj.get("anyOf")?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_object())
        .filter_map(|o| o.get("type")?.as_str())
        .find(|t| *t != "null")
}

fn format_schema_params(out: &mut String, schema: &Schema) {
    let Some(obj) = schema.as_object() else {
        return;
    };
    let Some(serde_json::Value::Object(props)) = obj.get("properties") else {
        return;
    };
    if props.is_empty() {
        return;
    }

    let required: Vec<&str> = obj
        .get("required")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    let _ = writeln!(out, "Parameters:");
    for (name, prop) in props {
        let prop_obj = prop.as_object();
        let ty = prop_obj
            .and_then(|o| {
                o.get("type")
                    .and_then(|v| v.as_str())
                    .or_else(|| extract_non_null_type(o))
            })
            .unwrap_or("string");
        let desc = prop_obj
            .and_then(|o| o.get("description"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let req = if required.contains(&name.as_str()) {
            "required"
        } else {
            "optional"
        };
        let _ = writeln!(out, "  - {name}: {desc} ({ty}, {req})");
    }
}
