//! Adaptive output shaping.
//!
//! A structured result is only worth returning in full when its serialization is no larger
//! than the raw tool output it was parsed from. Otherwise the result's compact projection is
//! returned. The comparison uses a swappable [`SizeMeasure`], since the size that matters to
//! the consumer (characters, bytes, model tokens) depends on the deployment.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::runner::RunOutcome;

pub const NO_RESULTS_SUMMARY: &str = "No results.";

const STDERR_TAIL_LINES: usize = 5;

/// Size function used for the full-versus-raw comparison.
pub trait SizeMeasure: Send + Sync {
    fn measure(&self, text: &str) -> usize;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CharCount;

impl SizeMeasure for CharCount {
    fn measure(&self, text: &str) -> usize {
        text.chars().count()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ByteLength;

impl SizeMeasure for ByteLength {
    fn measure(&self, text: &str) -> usize {
        text.len()
    }
}

/// Rough token count: four characters per token.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimatedTokens;

impl SizeMeasure for EstimatedTokens {
    fn measure(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

/// Configurable choice of built-in [`SizeMeasure`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasureKind {
    #[default]
    Chars,
    Bytes,
    Tokens,
}

impl MeasureKind {
    #[must_use]
    pub fn measure(self) -> Arc<dyn SizeMeasure> {
        match self {
            Self::Chars => Arc::new(CharCount),
            Self::Bytes => Arc::new(ByteLength),
            Self::Tokens => Arc::new(EstimatedTokens),
        }
    }
}

impl FromStr for MeasureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chars" => Ok(Self::Chars),
            "bytes" => Ok(Self::Bytes),
            "tokens" => Ok(Self::Tokens),
            other => Err(format!("unknown size measure: {other}")),
        }
    }
}

/// Capability a result type provides so it can be shaped.
///
/// `format_full` and `format_compact` must agree with [`Shapeable::is_error`]: a failing
/// result must read as a failure in either summary.
pub trait Shapeable: Serialize {
    type Compact: Serialize;

    fn format_full(&self) -> String;

    fn project_compact(&self) -> Self::Compact;

    fn format_compact(&self, compact: &Self::Compact) -> String;

    fn is_error(&self) -> bool {
        false
    }

    /// True when the result carries nothing worth reporting.
    fn is_empty(&self) -> bool {
        false
    }
}

/// Which projection an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    Full,
    Compact,
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Compact => f.write_str("compact"),
        }
    }
}

/// Sizes observed while shaping, in the shaper's measure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShapeStats {
    pub raw_size: usize,
    pub full_size: usize,
    pub emitted_size: usize,
}

/// Paired human summary and machine payload for one tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputEnvelope {
    pub summary: String,
    pub structured: Value,
    pub format: PayloadFormat,
    pub is_error: bool,
    pub stats: ShapeStats,
}

impl OutputEnvelope {
    /// Dual text/structured tool result. The payload is tagged with its format so a caller can
    /// validate against the matching schema.
    #[must_use]
    pub fn to_tool_result(&self) -> Value {
        json!({
            "content": [{ "type": "text", "text": self.summary }],
            "structuredContent": {
                "format": self.format,
                "payload": self.structured,
            },
            "isError": self.is_error,
        })
    }
}

#[derive(Clone)]
pub struct Shaper {
    measure: Arc<dyn SizeMeasure>,
}

impl fmt::Debug for Shaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shaper").finish_non_exhaustive()
    }
}

impl Default for Shaper {
    fn default() -> Self {
        Self::new(MeasureKind::default())
    }
}

impl Shaper {
    #[must_use]
    pub fn new(kind: MeasureKind) -> Self {
        Self {
            measure: kind.measure(),
        }
    }

    #[must_use]
    pub fn with_measure(measure: impl SizeMeasure + 'static) -> Self {
        Self {
            measure: Arc::new(measure),
        }
    }

    /// Choose between the full and compact projection of `result`.
    ///
    /// Full is emitted when `force_full` is set or when the serialized result measures no
    /// larger than `raw`. An empty result over empty raw text yields a "no results" envelope.
    /// Serialization goes through [`serde_json::Value`], whose object keys are sorted, so the
    /// measured size does not depend on field order.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::Serialize`] if either projection fails to serialize.
    pub fn shape<T: Shapeable>(
        &self,
        result: &T,
        raw: &str,
        force_full: bool,
    ) -> Result<OutputEnvelope, ToolError> {
        let full = serde_json::to_value(result)?;
        let full_size = self.measure.measure(&serde_json::to_string(&full)?);
        let raw_size = self.measure.measure(raw);
        let is_error = result.is_error();

        if result.is_empty() && raw.trim().is_empty() {
            return Ok(OutputEnvelope {
                summary: NO_RESULTS_SUMMARY.to_owned(),
                structured: full,
                format: PayloadFormat::Full,
                is_error,
                stats: ShapeStats {
                    raw_size,
                    full_size,
                    emitted_size: full_size,
                },
            });
        }

        if force_full || full_size <= raw_size {
            tracing::debug!(full_size, raw_size, force_full, "emitting full payload");
            return Ok(OutputEnvelope {
                summary: result.format_full(),
                structured: full,
                format: PayloadFormat::Full,
                is_error,
                stats: ShapeStats {
                    raw_size,
                    full_size,
                    emitted_size: full_size,
                },
            });
        }

        let compact = result.project_compact();
        let structured = serde_json::to_value(&compact)?;
        let emitted_size = self.measure.measure(&serde_json::to_string(&structured)?);
        tracing::debug!(full_size, raw_size, emitted_size, "emitting compact payload");
        Ok(OutputEnvelope {
            summary: result.format_compact(&compact),
            structured,
            format: PayloadFormat::Compact,
            is_error,
            stats: ShapeStats {
                raw_size,
                full_size,
                emitted_size,
            },
        })
    }
}

/// Compact projection of a [`RunOutcome`]: status, flags, line counts and the stderr tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub exit_code: i32,
    pub timed_out: bool,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub stdout_lines: usize,
    pub stderr_lines: usize,
    pub stderr_tail: Vec<String>,
    pub duration_ms: u64,
}

fn status_line(
    exit_code: i32,
    timed_out: bool,
    truncated: bool,
    signal: Option<&str>,
    duration_ms: u64,
) -> String {
    let mut line = match (timed_out, signal) {
        (true, Some(sig)) => format!("timed out (exit {exit_code}, {sig})"),
        (true, None) => format!("timed out (exit {exit_code})"),
        (false, Some(sig)) => format!("killed by {sig} (exit {exit_code})"),
        (false, None) => format!("exit {exit_code}"),
    };
    if truncated {
        line.push_str(", output truncated");
    }
    line.push_str(&format!(" in {duration_ms}ms"));
    line
}

impl Shapeable for RunOutcome {
    type Compact = RunSummary;

    fn format_full(&self) -> String {
        let status = status_line(
            self.exit_code,
            self.timed_out,
            self.truncated,
            self.signal.as_deref(),
            self.duration_ms,
        );
        let output = self.combined_output();
        let output = output.trim_end();
        if output.is_empty() {
            status
        } else {
            format!("{status}\n{output}")
        }
    }

    fn project_compact(&self) -> RunSummary {
        let stderr: Vec<&str> = self.stderr.lines().collect();
        let tail_start = stderr.len().saturating_sub(STDERR_TAIL_LINES);
        RunSummary {
            exit_code: self.exit_code,
            timed_out: self.timed_out,
            truncated: self.truncated,
            signal: self.signal.clone(),
            stdout_lines: self.stdout.lines().count(),
            stderr_lines: stderr.len(),
            stderr_tail: stderr[tail_start..].iter().map(|l| (*l).to_owned()).collect(),
            duration_ms: self.duration_ms,
        }
    }

    fn format_compact(&self, compact: &RunSummary) -> String {
        let mut out = status_line(
            compact.exit_code,
            compact.timed_out,
            compact.truncated,
            compact.signal.as_deref(),
            compact.duration_ms,
        );
        out.push_str(&format!(
            "\n{} stdout lines, {} stderr lines",
            compact.stdout_lines, compact.stderr_lines
        ));
        if !compact.stderr_tail.is_empty() {
            out.push_str("\nstderr tail:\n");
            out.push_str(&compact.stderr_tail.join("\n"));
        }
        out
    }

    fn is_error(&self) -> bool {
        !self.success()
    }

    fn is_empty(&self) -> bool {
        self.success() && self.stdout.trim().is_empty() && self.stderr.trim().is_empty()
    }
}
