//! Native build invocation, output capture and error-line extraction.
//!
//! [`BuildRunner`] launches the external build tool as a child process, reads
//! stdout and stderr to completion and classifies error lines. At most one
//! build runs per runner; [`Builder::cancel`] kills the in-flight build's
//! process group and makes the pending `build` call return a cancelled
//! [`BuildResult`]. Dropping a pending `build` future kills the group too.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BuildmendError, Result};

/// Default case-insensitive marker identifying error lines.
pub const DEFAULT_ERROR_MARKER: &str = "error:";

/// How long pipe readers may keep draining after the child was killed.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// Build and clean invocations for one project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildCommand {
    /// Build command (first element is the executable).
    pub build: Vec<String>,

    /// Clean command run before a clean build, if the tool has one.
    pub clean: Option<Vec<String>>,

    /// Working directory for both commands.
    pub working_dir: PathBuf,
}

impl BuildCommand {
    /// `xcodebuild -project <name> -scheme <scheme> -configuration <cfg> build`.
    pub fn xcodebuild(
        working_dir: impl Into<PathBuf>,
        project_name: &str,
        scheme: &str,
        configuration: &str,
        derived_data_path: Option<&Path>,
    ) -> Self {
        let mut base = vec![
            "xcodebuild".to_string(),
            "-project".to_string(),
            project_name.to_string(),
            "-scheme".to_string(),
            scheme.to_string(),
            "-configuration".to_string(),
            configuration.to_string(),
        ];
        if let Some(dir) = derived_data_path {
            base.push("-derivedDataPath".to_string());
            base.push(dir.to_string_lossy().into_owned());
        }

        let mut build = base.clone();
        build.push("build".to_string());
        let mut clean = base;
        clean.push("clean".to_string());

        Self {
            build,
            clean: Some(clean),
            working_dir: working_dir.into(),
        }
    }

    /// Arbitrary build tool.
    pub fn custom(
        working_dir: impl Into<PathBuf>,
        build: Vec<String>,
        clean: Option<Vec<String>>,
    ) -> Self {
        Self {
            build,
            clean,
            working_dir: working_dir.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Outcome of one build attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    /// `exit_code == 0` and not cancelled.
    pub succeeded: bool,

    /// Process exit code, `-1` when killed or terminated by a signal.
    pub exit_code: i32,

    pub stdout: String,
    pub stderr: String,

    /// Matching stdout lines, then matching stderr lines, each in source order.
    pub error_lines: Vec<String>,

    /// The build was stopped through [`Builder::cancel`].
    pub cancelled: bool,

    pub duration_ms: u64,
}

impl BuildResult {
    /// Result for a build stopped before or while running.
    pub fn cancelled(duration_ms: u64) -> Self {
        Self {
            succeeded: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            error_lines: Vec::new(),
            cancelled: true,
            duration_ms,
        }
    }

    /// Last error line, or a stderr/exit-code summary when there is none.
    pub fn summary(&self) -> String {
        if let Some(line) = self.error_lines.last() {
            return line.trim().to_string();
        }
        match self.stderr.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => format!("exit code {}: {}", self.exit_code, line.trim()),
            None => format!("exit code {}", self.exit_code),
        }
    }
}

/// Collect every line containing `marker` (case-insensitive), stdout first.
pub fn extract_error_lines(stdout: &str, stderr: &str, marker: &str) -> Vec<String> {
    let marker = marker.to_lowercase();
    stdout
        .lines()
        .chain(stderr.lines())
        .filter(|line| line.to_lowercase().contains(&marker))
        .map(|line| line.trim_end().to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Builder trait
// ---------------------------------------------------------------------------

/// Build backend driven by the orchestrator.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Run one build, preceded by the clean action when `clean` is set.
    ///
    /// A non-zero exit is a normal `Ok` result; `Err` means the tool could
    /// not be run at all.
    async fn build(&self, clean: bool) -> Result<BuildResult>;

    /// Stop the in-flight build. Returns `true` if one was running.
    fn cancel(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Process runner
// ---------------------------------------------------------------------------

/// [`Builder`] backed by a child process.
#[derive(Debug)]
pub struct BuildRunner {
    command: BuildCommand,
    timeout: Option<Duration>,
    error_marker: String,
    gate: tokio::sync::Mutex<()>,
    in_flight: Mutex<Option<CancellationToken>>,
}

enum Finish {
    Exited(ExitStatus),
    Cancelled,
    TimedOut,
}

impl BuildRunner {
    pub fn new(command: BuildCommand) -> Self {
        Self {
            command,
            timeout: None,
            error_marker: DEFAULT_ERROR_MARKER.to_string(),
            gate: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(None),
        }
    }

    /// Kill builds running longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_error_marker(mut self, marker: impl Into<String>) -> Self {
        self.error_marker = marker.into();
        self
    }

    pub fn command(&self) -> &BuildCommand {
        &self.command
    }

    fn set_in_flight(&self, token: Option<CancellationToken>) {
        *self.in_flight.lock().unwrap_or_else(|e| e.into_inner()) = token;
    }

    fn track(&self, token: CancellationToken) -> InFlight<'_> {
        self.set_in_flight(Some(token));
        InFlight { runner: self }
    }

    async fn run_guarded(&self, clean: bool, token: &CancellationToken) -> Result<BuildResult> {
        if clean {
            if let Some(clean_cmd) = &self.command.clean {
                let cleaned = self.run_process(clean_cmd, token).await?;
                if cleaned.cancelled {
                    return Ok(cleaned);
                }
                if !cleaned.succeeded {
                    warn!(exit_code = cleaned.exit_code, "clean failed, building anyway");
                }
            }
        }
        self.run_process(&self.command.build, token).await
    }

    async fn run_process(&self, argv: &[String], token: &CancellationToken) -> Result<BuildResult> {
        let start = Instant::now();
        let shown = argv.join(" ");
        let (exe, args) = argv.split_first().ok_or_else(|| BuildmendError::Process {
            command: shown.clone(),
            reason: "empty command".to_string(),
        })?;

        if token.is_cancelled() {
            return Ok(BuildResult::cancelled(0));
        }

        info!(command = %shown, "starting build process");
        let mut command = Command::new(exe);
        command
            .args(args)
            .current_dir(&self.command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| BuildmendError::Process {
            command: shown.clone(),
            reason: e.to_string(),
        })?;
        let mut group = ProcessGroup::new(child.id());

        let mut stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let mut stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

        let finish = tokio::select! {
            status = child.wait() => Finish::Exited(status?),
            _ = token.cancelled() => Finish::Cancelled,
            _ = sleep_or_pending(self.timeout) => Finish::TimedOut,
        };

        let status = match finish {
            Finish::Exited(status) => {
                group.disarm();
                status
            }
            Finish::Cancelled | Finish::TimedOut => {
                group.kill();
                if let Err(err) = child.start_kill() {
                    debug!(error = %err, "kill after exit");
                }
                let _ = child.wait().await;
                drain(&mut stdout_task).await;
                drain(&mut stderr_task).await;
                let duration_ms = start.elapsed().as_millis() as u64;
                if matches!(finish, Finish::TimedOut) {
                    return Err(BuildmendError::Process {
                        command: shown,
                        reason: format!(
                            "timed out after {:?}",
                            self.timeout.unwrap_or_default()
                        ),
                    });
                }
                info!(command = %shown, duration_ms, "build cancelled");
                return Ok(BuildResult::cancelled(duration_ms));
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let exit_code = status.code().unwrap_or(-1);
        let error_lines = extract_error_lines(&stdout, &stderr, &self.error_marker);
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(
            command = %shown,
            exit_code,
            duration_ms,
            error_lines = error_lines.len(),
            "build process finished"
        );

        Ok(BuildResult {
            succeeded: status.success(),
            exit_code,
            stdout,
            stderr,
            error_lines,
            cancelled: false,
            duration_ms,
        })
    }
}

#[async_trait]
impl Builder for BuildRunner {
    async fn build(&self, clean: bool) -> Result<BuildResult> {
        let _gate = self.gate.lock().await;
        let token = CancellationToken::new();
        let _in_flight = self.track(token.clone());
        self.run_guarded(clean, &token).await
    }

    fn cancel(&self) -> bool {
        let guard = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }
}

// Clears the in-flight token even when the build future is dropped.
struct InFlight<'a> {
    runner: &'a BuildRunner,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.runner.set_in_flight(None);
    }
}

/// The build's process group, killed on drop unless the leader exited on its
/// own. Compiler jobs spawned by the build tool share the group.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the group was created for this build.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// Grandchildren may keep a pipe open after the child is gone.
async fn drain(task: &mut JoinHandle<String>) {
    if tokio::time::timeout(PIPE_DRAIN_GRACE, &mut *task).await.is_err() {
        task.abort();
    }
}

async fn sleep_or_pending(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending::<()>().await,
    }
}
