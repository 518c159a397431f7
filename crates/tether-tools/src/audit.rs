use std::path::Path;

use crate::config::AuditConfig;
use crate::error::{ErrorCategory, ToolError};
use crate::runner::RunOutcome;

#[derive(Debug)]
pub struct AuditLogger {
    destination: AuditDestination,
}

#[derive(Debug)]
enum AuditDestination {
    Tracing,
    File(tokio::sync::Mutex<tokio::fs::File>),
}

/// One line of the audit trail.
#[derive(Debug, serde::Serialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub family: String,
    pub action: String,
    pub program: String,
    pub result: AuditResult,
    pub duration_ms: u64,
}

impl AuditEntry {
    #[must_use]
    pub fn new(
        family: impl Into<String>,
        action: impl Into<String>,
        program: impl Into<String>,
        result: AuditResult,
        duration_ms: u64,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            family: family.into(),
            action: action.into(),
            program: program.into(),
            result,
            duration_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure { exit_code: i32 },
    Timeout,
    Truncated,
    GuardRejected { reason: String },
    PolicyDenied { reason: String },
    SpawnError { message: String },
}

impl AuditResult {
    #[must_use]
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        if outcome.timed_out {
            Self::Timeout
        } else if outcome.truncated {
            Self::Truncated
        } else if outcome.exit_code == 0 {
            Self::Success
        } else {
            Self::Failure {
                exit_code: outcome.exit_code,
            }
        }
    }

    #[must_use]
    pub fn from_error(err: &ToolError) -> Self {
        let reason = err.to_string();
        match err.category() {
            ErrorCategory::Guard => Self::GuardRejected { reason },
            ErrorCategory::Policy => Self::PolicyDenied { reason },
            ErrorCategory::Spawn | ErrorCategory::Internal => Self::SpawnError { message: reason },
        }
    }
}

impl AuditLogger {
    /// Create a new `AuditLogger` from config.
    ///
    /// # Errors
    ///
    /// Returns an error if a file destination cannot be opened.
    pub async fn from_config(config: &AuditConfig) -> Result<Self, std::io::Error> {
        let destination = if config.destination == "stdout" {
            AuditDestination::Tracing
        } else {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(Path::new(&config.destination))
                .await?;
            AuditDestination::File(tokio::sync::Mutex::new(file))
        };

        Ok(Self { destination })
    }

    pub async fn log(&self, entry: &AuditEntry) {
        let Ok(json) = serde_json::to_string(entry) else {
            return;
        };

        match &self.destination {
            AuditDestination::Tracing => {
                tracing::info!(target: "audit", "{json}");
            }
            AuditDestination::File(file) => {
                use tokio::io::AsyncWriteExt;
                let mut f = file.lock().await;
                let line = format!("{json}\n");
                if let Err(e) = f.write_all(line.as_bytes()).await {
                    tracing::error!("failed to write audit log: {e}");
                } else if let Err(e) = f.flush().await {
                    tracing::error!("failed to flush audit log: {e}");
                }
            }
        }
    }
}
