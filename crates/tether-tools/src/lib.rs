//! Execution core shared by CLI tool adapters: guarded subprocess runner, input guard, policy
//! gate, adaptive output shaper and lazy tool registry.

pub mod audit;
pub mod config;
pub mod error;
pub mod guard;
pub mod host;
pub mod policy;
pub mod registry;
pub mod runner;
pub mod shape;

pub use audit::{AuditEntry, AuditLogger, AuditResult};
pub use config::{
    AuditConfig, FieldLimits, PolicyConfig, RegistryConfig, RunnerConfig, ShapeConfig,
    TIMEOUT_CEILING_SECS, ToolsConfig,
};
pub use error::{ErrorCategory, RegistryError, ToolError};
pub use guard::{FieldClass, GuardError, GuardReason, InputGuard, check_not_flag_like};
pub use host::{ToolEvent, ToolEventTx, ToolHost};
pub use policy::{
    ANY_FAMILY, PermissionAction, PermissionRule, PolicyContext, PolicyGate, SHELL_ACTION,
};
pub use registry::{
    DISCOVER_TOOL, DiscoverParams, LazyToolRegistry, RegistryEvent, RegistryEventTx, ToolDef,
    ToolRegistration, ToolState, discovery_def,
};
pub use runner::{
    CommandSpec, EnvMode, ProcessRunner, RunOutcome, TIMEOUT_EXIT_CODE, TerminationSignal,
};
pub use shape::{
    ByteLength, CharCount, EstimatedTokens, MeasureKind, NO_RESULTS_SUMMARY, OutputEnvelope,
    PayloadFormat, RunSummary, ShapeStats, Shapeable, Shaper, SizeMeasure,
};
