//! Script execution with resource limits.
//!
//! Spawns the shell on the workspace script with a freshly composed
//! environment, captures stdout/stderr through dedicated reader threads,
//! and enforces the wall-clock timeout and per-stream output caps. The
//! executor never mutates the host process environment; every spawn gets
//! its own child environment.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::{ServiceError, ServiceResult};
use crate::security::{is_system_env_name, SanitizedEnv};

/// Return code recorded when the script runs past the timeout.
pub const TIMEOUT_RETURN_CODE: i32 = 124;

/// Return code recorded when the caller cancels the execution.
pub const CANCELLED_RETURN_CODE: i32 = 130;

/// Interval between child liveness polls.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Grace window between the polite termination request and the hard kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Bounded wait for reader threads after a kill.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Cooperative cancellation flag shared with the transport layer.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// System-managed values exported to every script.
///
/// These always win over caller-supplied variables.
#[derive(Debug, Clone, Default)]
pub struct SystemEnv {
    /// Raw bearer string for API callbacks
    pub api_token: String,
    /// Correlation id of the request
    pub correlation_id: String,
    /// API base URL, `{scheme}://{host}:{port}`
    pub base_url: String,
    /// JSON-encoded recursion stack, current runbook included
    pub recursion_stack_json: String,
}

impl SystemEnv {
    /// Overlay the system-managed names onto an environment map.
    pub fn apply(&self, env: &mut HashMap<String, String>) {
        env.insert("RUNBOOK_API_TOKEN".to_string(), self.api_token.clone());
        env.insert("RUNBOOK_CORRELATION_ID".to_string(), self.correlation_id.clone());
        env.insert("RUNBOOK_URL".to_string(), self.base_url.clone());
        env.insert("RUNBOOK_API_BASE_URL".to_string(), self.base_url.clone());
        env.insert("RUNBOOK_RECURSION_STACK".to_string(), self.recursion_stack_json.clone());

        // Pre-formatted header values so scripts can call the API with curl
        // without reassembling them.
        let header_auth = format!("Authorization: Bearer {}", self.api_token);
        let header_corr = format!("X-Correlation-Id: {}", self.correlation_id);
        let header_recur = format!("X-Recursion-Stack: {}", self.recursion_stack_json);
        let header_ctype = "Content-Type: application/json".to_string();
        let headers = format!(
            "-H \"{header_auth}\" -H \"{header_corr}\" -H \"{header_recur}\" -H \"{header_ctype}\""
        );

        env.insert("RUNBOOK_H_AUTH".to_string(), header_auth);
        env.insert("RUNBOOK_H_CORR".to_string(), header_corr);
        env.insert("RUNBOOK_H_RECUR".to_string(), header_recur);
        env.insert("RUNBOOK_H_CTYPE".to_string(), header_ctype);
        env.insert("RUNBOOK_HEADERS".to_string(), headers);
    }
}

/// Compose the total child environment from sanitized caller variables and
/// the system-managed overlay.
///
/// Starts from an empty map; the host environment is never inherited here
/// (the spawn forwards `PATH` separately so the shell can be found). The
/// composition is idempotent: composing an already-composed map changes
/// nothing.
pub fn compose_environment(
    sanitized: &SanitizedEnv,
    system: &SystemEnv,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = sanitized
        .vars
        .iter()
        .filter(|(name, _)| !is_system_env_name(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    system.apply(&mut env);
    env
}

/// Result of one script execution.
#[derive(Debug)]
pub struct ExecutionOutput {
    /// Child exit code, or a reserved code for timeout/cancellation
    pub return_code: i32,

    /// Captured stdout, capped and UTF-8 decoded with replacement
    pub stdout: String,

    /// Captured stderr, capped, with executor annotations appended
    pub stderr: String,

    /// Non-blocking observations (truncation, kill escalation)
    pub warnings: Vec<String>,

    /// Whether the timeout fired
    pub timed_out: bool,

    /// Whether the caller cancelled the execution
    pub cancelled: bool,
}

impl ExecutionOutput {
    /// Whether the script completed with exit code zero.
    pub fn success(&self) -> bool {
        self.return_code == 0
    }
}

/// Script executor.
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    /// Shell interpreter invoked on the script file
    shell: PathBuf,

    /// Wall-clock limit for the child
    timeout: Duration,

    /// Per-stream retention cap in bytes
    max_output_bytes: usize,
}

impl ScriptExecutor {
    /// Create an executor.
    pub fn new(shell: impl Into<PathBuf>, timeout: Duration, max_output_bytes: usize) -> Self {
        Self { shell: shell.into(), timeout, max_output_bytes }
    }

    /// Run the prepared script inside its workspace.
    ///
    /// The workspace is the working directory; `env` is the total child
    /// environment apart from `PATH`, which is forwarded from the host so
    /// the shell and basic tools resolve.
    pub fn execute(
        &self,
        script_path: &Path,
        workspace_dir: &Path,
        env: &HashMap<String, String>,
        cancel: Option<&CancelToken>,
    ) -> ServiceResult<ExecutionOutput> {
        let start = Instant::now();
        let timeout_seconds = self.timeout.as_secs();

        let mut cmd = Command::new(&self.shell);
        cmd.arg(script_path)
            .current_dir(workspace_dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        for (name, value) in env {
            cmd.env(name, value);
        }

        tracing::info!(
            shell = %self.shell.display(),
            workspace = %workspace_dir.display(),
            timeout_seconds,
            max_output_bytes = self.max_output_bytes,
            "Executing script"
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| ServiceError::Internal(format!("failed to spawn script: {e}")))?;

        // Reader threads own the pipes and drain them to EOF, retaining at
        // most cap+1 bytes so an over-cap stream is detectable without
        // holding the whole thing. Draining fully keeps the child from
        // blocking on a full pipe.
        let cap = self.max_output_bytes;
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_handle =
            std::thread::spawn(move || stdout_pipe.map(|p| drain_capped(p, cap)));
        let stderr_handle =
            std::thread::spawn(move || stderr_pipe.map(|p| drain_capped(p, cap)));

        let deadline = start + self.timeout;
        let mut timed_out = false;
        let mut cancelled = false;
        let mut warnings = Vec::new();

        let status: Option<ExitStatus> = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(e) => {
                    terminate(&mut child, &mut warnings);
                    return Err(ServiceError::Internal(format!(
                        "failed to wait for script: {e}"
                    )));
                }
            }

            if cancel.is_some_and(CancelToken::is_cancelled) {
                cancelled = true;
                terminate(&mut child, &mut warnings);
                break None;
            }
            if Instant::now() >= deadline {
                timed_out = true;
                terminate(&mut child, &mut warnings);
                break None;
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        // The child is gone (exited or killed), so the pipes reach EOF and
        // the readers finish; the join is still bounded in case a grandchild
        // inherited the descriptors and keeps them open.
        drop(child);
        let stdout_raw = join_reader(stdout_handle, "stdout");
        let stderr_raw = join_reader(stderr_handle, "stderr");

        let stdout = finish_stream(stdout_raw, cap, "stdout", &mut warnings);
        let mut stderr = finish_stream(stderr_raw, cap, "stderr", &mut warnings);

        let return_code = if timed_out {
            let timeout_error = ServiceError::ScriptTimeout(timeout_seconds);
            append_line(&mut stderr, &timeout_error.to_string());
            tracing::warn!(
                timeout_seconds,
                elapsed = ?start.elapsed(),
                "Script timed out"
            );
            TIMEOUT_RETURN_CODE
        } else if cancelled {
            append_line(&mut stderr, "execution cancelled");
            tracing::warn!(elapsed = ?start.elapsed(), "Script execution cancelled");
            CANCELLED_RETURN_CODE
        } else {
            status.map_or(-1, exit_code)
        };

        tracing::info!(
            return_code,
            elapsed = ?start.elapsed(),
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "Script execution completed"
        );

        Ok(ExecutionOutput { return_code, stdout, stderr, warnings, timed_out, cancelled })
    }
}

/// Drain a pipe to EOF, retaining at most `cap + 1` bytes.
///
/// Returns the retained prefix and the total number of bytes seen, so the
/// caller can tell "exactly at the cap" apart from "over the cap".
fn drain_capped(mut reader: impl Read, cap: usize) -> (Vec<u8>, u64) {
    let mut kept: Vec<u8> = Vec::new();
    let mut total: u64 = 0;
    let mut buf = [0u8; 8192];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                let room = (cap + 1).saturating_sub(kept.len());
                if room > 0 {
                    kept.extend_from_slice(&buf[..n.min(room)]);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Pipe read failed");
                break;
            }
        }
    }
    (kept, total)
}

/// Join a reader thread with a bounded wait.
fn join_reader(
    handle: std::thread::JoinHandle<Option<(Vec<u8>, u64)>>,
    stream: &str,
) -> (Vec<u8>, u64) {
    let deadline = Instant::now() + READER_JOIN_TIMEOUT;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!(stream, "Abandoning stuck output reader");
            return (Vec::new(), 0);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    handle.join().ok().flatten().unwrap_or((Vec::new(), 0))
}

/// Decode a retained stream, applying the output cap.
///
/// Output exactly at the cap is left alone; anything over is cut at a UTF-8
/// character boundary and a single trailing marker line is appended, with a
/// warning surfaced in the execution record.
fn finish_stream(
    raw: (Vec<u8>, u64),
    cap: usize,
    stream: &str,
    warnings: &mut Vec<String>,
) -> String {
    let (kept, total) = raw;
    let mut text = String::from_utf8_lossy(&kept).into_owned();

    if total > cap as u64 {
        let mut end = cap.min(text.len());
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        append_line(&mut text, &format!("…output truncated at {cap} bytes…"));
        tracing::warn!(stream, total_bytes = total, cap, "Output truncated");
        warnings.push(format!("{stream} truncated at {cap} bytes (script wrote {total})"));
    }
    text
}

/// Append a line to a stream, separating it from prior content.
fn append_line(text: &mut String, line: &str) {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(line);
    text.push('\n');
}

/// Terminate a child: polite signal first, hard kill after the grace window.
fn terminate(child: &mut Child, warnings: &mut Vec<String>) {
    #[cfg(unix)]
    {
        let pid = nix::unistd::Pid::from_raw(child.id() as i32);
        if nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM).is_ok() {
            let grace = Instant::now() + KILL_GRACE;
            while Instant::now() < grace {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    return;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            warnings.push("script ignored polite termination; killed".to_string());
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Map an exit status to a return code, folding fatal signals into the
/// conventional 128+signal form.
#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status.code().or_else(|| status.signal().map(|s| 128 + s)).unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
