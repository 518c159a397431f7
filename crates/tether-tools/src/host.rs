use std::sync::Arc;

use crate::audit::{AuditEntry, AuditLogger, AuditResult};
use crate::config::ToolsConfig;
use crate::error::ToolError;
use crate::guard::{FieldClass, InputGuard};
use crate::policy::{PolicyContext, PolicyGate, SHELL_ACTION};
use crate::runner::{CommandSpec, ProcessRunner, RunOutcome};
use crate::shape::{OutputEnvelope, Shaper};

/// Event emitted around each process execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolEvent {
    Started {
        family: String,
        action: String,
        command: String,
    },
    Completed {
        family: String,
        action: String,
        command: String,
        exit_code: i32,
        success: bool,
        timed_out: bool,
        truncated: bool,
        duration_ms: u64,
    },
    /// The process never ran to an outcome, e.g. the executable was missing.
    Failed {
        family: String,
        action: String,
        command: String,
        error: String,
    },
}

pub type ToolEventTx = tokio::sync::mpsc::UnboundedSender<ToolEvent>;

/// Runs adapter commands through the policy gate, the process runner and the audit trail.
#[derive(Debug)]
pub struct ToolHost {
    runner: ProcessRunner,
    guard: InputGuard,
    shaper: Shaper,
    policy: Arc<PolicyGate>,
    audit_logger: Option<AuditLogger>,
    tool_event_tx: Option<ToolEventTx>,
}

impl ToolHost {
    #[must_use]
    pub fn new(config: &ToolsConfig, policy: Arc<PolicyGate>) -> Self {
        Self {
            runner: ProcessRunner::new(&config.runner),
            guard: InputGuard::new(config.limits),
            shaper: Shaper::new(config.shape.measure),
            policy,
            audit_logger: None,
            tool_event_tx: None,
        }
    }

    #[must_use]
    pub fn with_audit(mut self, logger: AuditLogger) -> Self {
        self.audit_logger = Some(logger);
        self
    }

    #[must_use]
    pub fn with_tool_event_tx(mut self, tx: ToolEventTx) -> Self {
        self.tool_event_tx = Some(tx);
        self
    }

    #[must_use]
    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    #[must_use]
    pub fn guard(&self) -> &InputGuard {
        &self.guard
    }

    #[must_use]
    pub fn shaper(&self) -> &Shaper {
        &self.shaper
    }

    #[must_use]
    pub fn policy(&self) -> &Arc<PolicyGate> {
        &self.policy
    }

    /// Length and flag checks for a caller value, with rejections written to the audit trail.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::Guard`] when the value is rejected.
    pub async fn check_input(
        &self,
        ctx: &PolicyContext,
        value: &str,
        field: &str,
        class: FieldClass,
    ) -> Result<(), ToolError> {
        if let Err(e) = self.guard.check_positional(value, field, class) {
            let err = ToolError::from(e);
            self.log_audit(ctx, "", AuditResult::from_error(&err), 0).await;
            return Err(err);
        }
        Ok(())
    }

    /// Authorize `ctx`, run `spec`, and audit the result.
    ///
    /// Shell-mode specs additionally require the `shell` action to be allowed for the family,
    /// and a working directory is checked against the family's allowed roots.
    ///
    /// # Errors
    ///
    /// Policy denials and spawn failures. A completed process is always `Ok`, whatever its
    /// exit code.
    pub async fn run(&self, ctx: &PolicyContext, spec: CommandSpec) -> Result<RunOutcome, ToolError> {
        if let Err(err) = self.authorize(ctx, &spec) {
            tracing::warn!(family = %ctx.family, action = %ctx.action, "{err}");
            self.log_audit(ctx, &spec.program, AuditResult::from_error(&err), 0)
                .await;
            return Err(err);
        }

        let command = spec.display_line();
        if let Some(ref tx) = self.tool_event_tx {
            let _ = tx.send(ToolEvent::Started {
                family: ctx.family.clone(),
                action: ctx.action.clone(),
                command: command.clone(),
            });
        }

        let outcome = match self.runner.execute(&spec).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.log_audit(ctx, &spec.program, AuditResult::from_error(&err), 0)
                    .await;
                if let Some(ref tx) = self.tool_event_tx {
                    let _ = tx.send(ToolEvent::Failed {
                        family: ctx.family.clone(),
                        action: ctx.action.clone(),
                        command,
                        error: err.to_string(),
                    });
                }
                return Err(err);
            }
        };

        self.log_audit(
            ctx,
            &spec.program,
            AuditResult::from_outcome(&outcome),
            outcome.duration_ms,
        )
        .await;

        if let Some(ref tx) = self.tool_event_tx {
            let _ = tx.send(ToolEvent::Completed {
                family: ctx.family.clone(),
                action: ctx.action.clone(),
                command,
                exit_code: outcome.exit_code,
                success: outcome.success(),
                timed_out: outcome.timed_out,
                truncated: outcome.truncated,
                duration_ms: outcome.duration_ms,
            });
        }

        Ok(outcome)
    }

    /// [`Self::run`] followed by shaping the outcome against its combined output.
    ///
    /// # Errors
    ///
    /// Everything [`Self::run`] returns, plus serialization failures.
    pub async fn run_shaped(
        &self,
        ctx: &PolicyContext,
        spec: CommandSpec,
        force_full: bool,
    ) -> Result<OutputEnvelope, ToolError> {
        let outcome = self.run(ctx, spec).await?;
        self.shaper
            .shape(&outcome, &outcome.combined_output(), force_full)
    }

    fn authorize(&self, ctx: &PolicyContext, spec: &CommandSpec) -> Result<(), ToolError> {
        if spec.use_shell {
            self.policy.check_command(&ctx.family, SHELL_ACTION)?;
        }
        self.policy.authorize(ctx)?;
        if let Some(ref dir) = spec.working_dir {
            self.policy.check_root(dir, &ctx.family)?;
        }
        Ok(())
    }

    async fn log_audit(
        &self,
        ctx: &PolicyContext,
        program: &str,
        result: AuditResult,
        duration_ms: u64,
    ) {
        if let Some(ref logger) = self.audit_logger {
            let entry = AuditEntry::new(&ctx.family, &ctx.action, program, result, duration_ms);
            logger.log(&entry).await;
        }
    }
}
