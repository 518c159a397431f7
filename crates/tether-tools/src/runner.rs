//! Guarded subprocess execution.
//!
//! One call spawns exactly one child and owns it until it is reaped. Stdout and stderr are
//! drained by two independent tasks sharing a single byte budget, while the caller races
//! process exit against the deadline and the budget-overflow signal.
//!
//! Exceeding the output cap terminates the child the same way a timeout does: the call
//! still succeeds, with `truncated = true` and whatever was captured up to the cap.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::{RunnerConfig, TIMEOUT_CEILING_SECS};
use crate::error::ToolError;

/// Exit code reported for a timed-out process when the OS supplies none.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Signal sent to the child's process group on timeout or output overflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminationSignal {
    #[default]
    #[serde(rename = "SIGTERM")]
    Term,
    #[serde(rename = "SIGKILL")]
    Kill,
    #[serde(rename = "SIGINT")]
    Int,
    #[serde(rename = "SIGHUP")]
    Hup,
}

impl TerminationSignal {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Term => "SIGTERM",
            Self::Kill => "SIGKILL",
            Self::Int => "SIGINT",
            Self::Hup => "SIGHUP",
        }
    }

    #[cfg(unix)]
    fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            Self::Term => Signal::SIGTERM,
            Self::Kill => Signal::SIGKILL,
            Self::Int => Signal::SIGINT,
            Self::Hup => Signal::SIGHUP,
        }
    }
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TerminationSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        match bare {
            "TERM" => Ok(Self::Term),
            "KILL" => Ok(Self::Kill),
            "INT" => Ok(Self::Int),
            "HUP" => Ok(Self::Hup),
            _ => Err(format!("unsupported termination signal: {s}")),
        }
    }
}

/// How the child's environment is composed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnvMode {
    /// Parent environment plus [`CommandSpec::env`] overrides.
    #[default]
    Inherit,
    /// Only `PATH` from the parent plus explicit overrides, so ambient secrets are not
    /// passed to an untrusted child.
    Stripped,
}

/// Immutable description of one subprocess invocation.
///
/// `args` are always passed as discrete argv entries. With `use_shell` set, `program` is a
/// script handed to the system shell and `args` become its positional parameters (`$1`,
/// `$2`, ...); the script itself is interpreted by the shell, so shell mode carries
/// injection risk and must never embed caller input in `program`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub env_mode: EnvMode,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<Vec<u8>>,
    pub max_output_bytes: usize,
    pub use_shell: bool,
    pub kill_signal: Option<TerminationSignal>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
            env_mode: EnvMode::Inherit,
            env: BTreeMap::new(),
            stdin: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            use_shell: false,
            kill_signal: None,
        }
    }

    /// Shell-interpreted script. See the type-level docs for the injection caveat.
    #[must_use]
    pub fn shell_script(script: impl Into<String>) -> Self {
        Self {
            use_shell: true,
            ..Self::new(script)
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn stripped_env(mut self) -> Self {
        self.env_mode = EnvMode::Stripped;
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    #[must_use]
    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    #[must_use]
    pub fn kill_signal(mut self, signal: TerminationSignal) -> Self {
        self.kill_signal = Some(signal);
        self
    }

    /// Human-readable command line for logs and audit entries. Never executed.
    #[must_use]
    pub fn display_line(&self) -> String {
        if self.args.is_empty() {
            return self.program.clone();
        }
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Result of one invocation. Built fresh per call and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Signal that killed the process, when it was killed by one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub truncated: bool,
    pub duration_ms: u64,
}

impl RunOutcome {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Stdout followed by stderr, separated by a newline when both are present.
    #[must_use]
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let sep = if self.stdout.ends_with('\n') { "" } else { "\n" };
                format!("{}{sep}{}", self.stdout, self.stderr)
            }
        }
    }
}

/// Shared combined-output budget for the two reader tasks.
#[derive(Debug)]
struct OutputBudget {
    remaining: AtomicUsize,
    truncated: AtomicBool,
    overflow: Notify,
}

impl OutputBudget {
    fn new(cap: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(cap),
            truncated: AtomicBool::new(false),
            overflow: Notify::new(),
        }
    }

    /// Reserve up to `want` bytes; returns how many were granted.
    fn take(&self, want: usize) -> usize {
        let mut granted = 0;
        let _ = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |rem| {
                granted = rem.min(want);
                Some(rem - granted)
            });
        if granted < want && !self.truncated.swap(true, Ordering::AcqRel) {
            self.overflow.notify_one();
        }
        granted
    }

    fn is_truncated(&self) -> bool {
        self.truncated.load(Ordering::Acquire)
    }
}

enum Ending {
    Exited(std::io::Result<ExitStatus>),
    Overflow,
    TimedOut,
}

/// Executes [`CommandSpec`]s under the configured ceilings.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    default_timeout: Duration,
    max_timeout: Duration,
    max_output_bytes: usize,
    kill_signal: TerminationSignal,
    kill_grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(&RunnerConfig::default())
    }
}

impl ProcessRunner {
    #[must_use]
    pub fn new(config: &RunnerConfig) -> Self {
        let max_timeout = Duration::from_secs(config.max_timeout_secs.min(TIMEOUT_CEILING_SECS));
        Self {
            default_timeout: Duration::from_secs(config.default_timeout_secs).min(max_timeout),
            max_timeout,
            max_output_bytes: config.max_output_bytes,
            kill_signal: config.kill_signal,
            kill_grace: Duration::from_millis(config.kill_grace_ms),
        }
    }

    /// A spec pre-filled with this runner's configured defaults.
    #[must_use]
    pub fn spec(&self, program: impl Into<String>) -> CommandSpec {
        CommandSpec::new(program)
            .timeout(self.default_timeout)
            .max_output_bytes(self.max_output_bytes)
    }

    /// Shell-mode counterpart of [`Self::spec`].
    #[must_use]
    pub fn shell_spec(&self, script: impl Into<String>) -> CommandSpec {
        CommandSpec::shell_script(script)
            .timeout(self.default_timeout)
            .max_output_bytes(self.max_output_bytes)
    }

    #[must_use]
    pub fn effective_timeout(&self, spec: &CommandSpec) -> Duration {
        spec.timeout.min(self.max_timeout)
    }

    #[must_use]
    pub fn effective_output_cap(&self, spec: &CommandSpec) -> usize {
        spec.max_output_bytes.min(self.max_output_bytes)
    }

    /// Run the command to completion, timeout, or output overflow.
    ///
    /// # Errors
    ///
    /// Only conditions outside the monitored ones: a missing executable
    /// ([`ToolError::NotFound`]), permission problems, a missing working directory, or an
    /// OS failure while spawning or reaping. A nonzero exit is a normal outcome.
    pub async fn execute(&self, spec: &CommandSpec) -> Result<RunOutcome, ToolError> {
        let timeout = self.effective_timeout(spec);
        let cap = self.effective_output_cap(spec);
        let signal = spec.kill_signal.unwrap_or(self.kill_signal);

        if let Some(ref dir) = spec.working_dir
            && !dir.is_dir()
        {
            return Err(ToolError::InvalidWorkingDir {
                path: dir.display().to_string(),
            });
        }

        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut child = build_command(spec)
            .spawn()
            .map_err(|e| ToolError::from_spawn(&spec.program, e))?;
        let pid = child.id();
        tracing::info!(
            program = %spec.program,
            args = spec.args.len(),
            pid,
            shell = spec.use_shell,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "process started"
        );

        if let (Some(input), Some(mut pipe)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await
                    && e.kind() != std::io::ErrorKind::BrokenPipe
                {
                    tracing::debug!("stdin write failed: {e}");
                }
                let _ = pipe.shutdown().await;
            });
        }

        let budget = Arc::new(OutputBudget::new(cap));
        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = child
            .stdout
            .take()
            .map(|s| tokio::spawn(drain(s, Arc::clone(&stdout_buf), Arc::clone(&budget))));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(drain(s, Arc::clone(&stderr_buf), Arc::clone(&budget))));

        // Exit is polled first so a process finishing as the timer fires is reported as exited.
        let ending = tokio::select! {
            biased;
            status = child.wait() => Ending::Exited(status),
            () = budget.overflow.notified() => Ending::Overflow,
            () = tokio::time::sleep_until(deadline) => Ending::TimedOut,
        };

        let (status, timed_out, drain_deadline) = match ending {
            // Pipes may still hold data after exit; readers get at least the grace period.
            Ending::Exited(status) => (
                status,
                false,
                deadline.max(tokio::time::Instant::now() + self.kill_grace),
            ),
            Ending::TimedOut => {
                tracing::warn!(program = %spec.program, ?timeout, "process timed out, sending {signal}");
                let status = self.terminate(&mut child, pid, signal).await;
                (status, true, tokio::time::Instant::now() + self.kill_grace)
            }
            Ending::Overflow => {
                tracing::warn!(program = %spec.program, cap, "output limit exceeded, sending {signal}");
                let status = self.terminate(&mut child, pid, signal).await;
                (status, false, tokio::time::Instant::now() + self.kill_grace)
            }
        };
        let status = status.map_err(|source| ToolError::Wait {
            program: spec.program.clone(),
            source,
        })?;

        let drained_out = join_reader(stdout_task, drain_deadline).await;
        let drained_err = join_reader(stderr_task, drain_deadline).await;
        if !(drained_out && drained_err) {
            tracing::warn!(program = %spec.program, "output pipes held open after exit, killing process group");
            signal_group(pid, TerminationSignal::Kill);
        }

        let (exit_code, killed_by) = exit_details(status, timed_out);
        let (stdout, stderr, clipped) = fit_to_cap(
            decode_capture(&take_buffer(&stdout_buf)),
            decode_capture(&take_buffer(&stderr_buf)),
            cap,
        );
        let outcome = RunOutcome {
            exit_code,
            stdout,
            stderr,
            timed_out,
            signal: killed_by,
            truncated: budget.is_truncated() || clipped,
            duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        tracing::info!(
            program = %spec.program,
            exit_code = outcome.exit_code,
            timed_out = outcome.timed_out,
            truncated = outcome.truncated,
            duration_ms = outcome.duration_ms,
            "process finished"
        );
        Ok(outcome)
    }

    /// Signal the process group, wait out the grace period, then force-kill.
    async fn terminate(
        &self,
        child: &mut Child,
        pid: Option<u32>,
        signal: TerminationSignal,
    ) -> std::io::Result<ExitStatus> {
        signal_group(pid, signal);
        if let Ok(status) = tokio::time::timeout(self.kill_grace, child.wait()).await {
            return status;
        }
        tracing::warn!(pid, "process ignored {signal}, escalating to SIGKILL");
        signal_group(pid, TerminationSignal::Kill);
        child.kill().await?;
        child.wait().await
    }
}

fn build_command(spec: &CommandSpec) -> Command {
    let mut cmd = if spec.use_shell {
        shell_command(&spec.program, &spec.args)
    } else {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd
    };

    if let Some(ref dir) = spec.working_dir {
        cmd.current_dir(dir);
    }
    if spec.env_mode == EnvMode::Stripped {
        cmd.env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
    }
    cmd.envs(&spec.env);

    cmd.stdin(if spec.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    cmd
}

#[cfg(unix)]
fn shell_command(script: &str, args: &[String]) -> Command {
    let mut cmd = Command::new("sh");
    // "sh" fills $0 so caller args start at $1.
    cmd.arg("-c").arg(script).arg("sh").args(args);
    cmd
}

#[cfg(not(unix))]
fn shell_command(script: &str, args: &[String]) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(script).args(args);
    cmd
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: TerminationSignal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pid), signal.as_nix()) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, "failed to send {signal} to process group: {e}"),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: TerminationSignal) {}

async fn drain<R: AsyncRead + Unpin>(
    mut reader: R,
    sink: Arc<Mutex<Vec<u8>>>,
    budget: Arc<OutputBudget>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        // Past the cap the pipe is still drained so the child never blocks on a full buffer.
        let granted = budget.take(n);
        if granted > 0 {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&buf[..granted]);
        }
    }
}

/// Wait for a reader until `deadline`; aborts it and returns `false` on expiry.
async fn join_reader(task: Option<JoinHandle<()>>, deadline: tokio::time::Instant) -> bool {
    let Some(mut task) = task else {
        return true;
    };
    if tokio::time::timeout_at(deadline, &mut task).await.is_ok() {
        true
    } else {
        task.abort();
        false
    }
}

fn take_buffer(buf: &Mutex<Vec<u8>>) -> Vec<u8> {
    std::mem::take(&mut *buf.lock().unwrap_or_else(PoisonError::into_inner))
}

/// Lossy UTF-8 decode that drops a multi-byte sequence cut off by the output cap.
fn decode_capture(bytes: &[u8]) -> String {
    let end = match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => bytes.len(),
    };
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Replacement characters widen invalid bytes, so decoded text is cut back to `cap`
/// combined bytes on a char boundary, stdout first. Returns whether anything was cut.
fn fit_to_cap(mut stdout: String, mut stderr: String, cap: usize) -> (String, String, bool) {
    let out_cut = truncate_on_boundary(&mut stdout, cap);
    let err_cut = truncate_on_boundary(&mut stderr, cap - stdout.len());
    (stdout, stderr, out_cut || err_cut)
}

fn truncate_on_boundary(s: &mut String, limit: usize) -> bool {
    if s.len() <= limit {
        return false;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    true
}

fn exit_details(status: ExitStatus, timed_out: bool) -> (i32, Option<String>) {
    let signo = signal_number(status);
    let name = signo.map(signal_name);
    let code = status.code().unwrap_or_else(|| {
        if timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            signo.map_or(-1, |n| 128 + n)
        }
    });
    (code, name)
}

#[cfg(unix)]
fn signal_number(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_number(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn signal_name(signo: i32) -> String {
    nix::sys::signal::Signal::try_from(signo)
        .map_or_else(|_| format!("SIG{signo}"), |s| s.as_str().to_owned())
}

#[cfg(not(unix))]
fn signal_name(signo: i32) -> String {
    format!("SIG{signo}")
}
