//! Bounded analyze → correct → build → retry state machine.
//!
//! One [`RetryOrchestrator::run_cycle`] call handles one changed file:
//!
//! ```text
//! Idle → Analyzing → [Correcting] → Building ─┬─ Succeeded
//!                                             └─ AnalyzingBuildErrors → [Correcting] → Building → …
//!                                                                                      └─ Exhausted
//! ```
//!
//! The first build is attempt 1, so `max_attempts = N` bounds a cycle at N
//! builds. Cycles are serialised per orchestrator; a cycle owns its
//! [`RetryState`] and hands back a [`CycleReport`] when it ends.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::build::Builder;
use crate::correction::{AppliedCorrections, Correction, CorrectionApplier};
use crate::error::BuildmendError;
use crate::gateway::AnalysisGateway;
use crate::obs;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// Retry budget and pacing for one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Maximum number of builds per cycle (at least 1).
    pub max_attempts: u32,

    /// Base delay before each retry, in milliseconds.
    pub delay_ms: u64,

    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 5_000,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Delay after `failed_builds` failed builds, before the next retry.
    pub fn delay_after(&self, failed_builds: u32) -> Duration {
        let base = self.delay_ms;
        let ms = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let exp = failed_builds.saturating_sub(1).min(16);
                base.saturating_mul(1u64 << exp)
            }
        };
        Duration::from_millis(ms)
    }
}

// ---------------------------------------------------------------------------
// Cycle state
// ---------------------------------------------------------------------------

/// States of the orchestration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Analyzing,
    Correcting,
    Building,
    AnalyzingBuildErrors,
    Succeeded,
    Exhausted,
    Aborted,
    Cancelled,
}

/// Terminal result of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// A build succeeded.
    Succeeded,
    /// Every build in the budget failed.
    Exhausted,
    /// The changed file could not be read or corrected.
    Aborted,
    /// The session shut down mid-cycle.
    Cancelled,
}

impl CycleOutcome {
    fn state(self) -> CycleState {
        match self {
            CycleOutcome::Succeeded => CycleState::Succeeded,
            CycleOutcome::Exhausted => CycleState::Exhausted,
            CycleOutcome::Aborted => CycleState::Aborted,
            CycleOutcome::Cancelled => CycleState::Cancelled,
        }
    }
}

/// Budget bookkeeping owned by the active cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Builds started so far.
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A correction batch that failed for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Auditable record of one finished cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub path: PathBuf,
    pub outcome: CycleOutcome,
    /// Builds started, including a cancelled one.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub corrections_applied: usize,
    pub written: Vec<AppliedCorrections>,
    pub file_failures: Vec<FileFailure>,
    pub states: Vec<CycleState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CycleReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == CycleOutcome::Succeeded
    }

    /// The terminal "could not self-correct" error, for exhausted cycles.
    pub fn exhausted_error(&self) -> Option<BuildmendError> {
        (self.outcome == CycleOutcome::Exhausted).then(|| BuildmendError::RetryBudgetExhausted {
            path: self.path.clone(),
            attempts: self.attempts,
            last_error: self.last_error.clone(),
        })
    }
}

struct Cycle {
    id: String,
    path: PathBuf,
    started_at: DateTime<Utc>,
    state: CycleState,
    states: Vec<CycleState>,
    retry: RetryState,
    written: Vec<AppliedCorrections>,
    file_failures: Vec<FileFailure>,
}

impl Cycle {
    fn new(path: &Path, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            path: path.to_path_buf(),
            started_at: Utc::now(),
            state: CycleState::Idle,
            states: vec![CycleState::Idle],
            retry: RetryState::new(max_attempts),
            written: Vec::new(),
            file_failures: Vec::new(),
        }
    }

    fn transition(&mut self, next: CycleState) {
        obs::emit_transition(self.state, next);
        self.state = next;
        self.states.push(next);
    }

    fn fail_step(&mut self, error: impl std::fmt::Display) {
        self.retry.last_error = Some(error.to_string());
    }

    fn record_applied(&mut self, applied: AppliedCorrections) {
        obs::emit_correction_applied(&applied.path, applied.applied);
        self.written.push(applied);
    }

    fn record_file_failure(&mut self, path: PathBuf, error: &BuildmendError) {
        obs::emit_correction_failed(&path, error);
        self.fail_step(error);
        self.file_failures.push(FileFailure {
            path,
            error: error.to_string(),
        });
    }

    fn finish(mut self, outcome: CycleOutcome) -> CycleReport {
        self.transition(outcome.state());
        let report = CycleReport {
            cycle_id: self.id,
            path: self.path,
            outcome,
            attempts: self.retry.attempt,
            max_attempts: self.retry.max_attempts,
            last_error: self.retry.last_error,
            corrections_applied: self.written.iter().map(|w| w.applied).sum(),
            written: self.written,
            file_failures: self.file_failures,
            states: self.states,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        obs::emit_cycle_finished(&report);
        report
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives correction-retry cycles for one project.
pub struct RetryOrchestrator {
    gateway: Arc<dyn AnalysisGateway>,
    builder: Arc<dyn Builder>,
    applier: CorrectionApplier,
    policy: RetryPolicy,
    project_root: PathBuf,
    cycle_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl RetryOrchestrator {
    pub fn new(
        gateway: Arc<dyn AnalysisGateway>,
        builder: Arc<dyn Builder>,
        policy: RetryPolicy,
        project_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            gateway,
            builder,
            applier: CorrectionApplier::new(),
            policy,
            project_root: project_root.into(),
            cycle_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_applier(mut self, applier: CorrectionApplier) -> Self {
        self.applier = applier;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Stop the active cycle and refuse new work: cancels the in-flight
    /// build and any pending gateway call or retry delay.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if self.builder.cancel() {
            debug!("in-flight build signalled to stop");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run one full cycle for a changed file. Concurrent calls are serialised.
    pub async fn run_cycle(&self, path: &Path) -> CycleReport {
        let _exclusive = self.cycle_lock.lock().await;
        let path = self.resolve(path);
        let mut cycle = Cycle::new(&path, self.policy.max_attempts);
        let span = obs::cycle_span(&cycle.id, &path);

        async move {
            obs::emit_cycle_started(&cycle.id, &cycle.path);
            let outcome = if self.shutdown.is_cancelled() {
                CycleOutcome::Cancelled
            } else {
                self.drive(&mut cycle).await
            };
            cycle.finish(outcome)
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, cycle: &mut Cycle) -> CycleOutcome {
        let path = cycle.path.clone();

        cycle.transition(CycleState::Analyzing);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) => {
                cycle.fail_step(format!("cannot read {}: {err}", path.display()));
                return CycleOutcome::Aborted;
            }
        };

        let corrections = match self
            .until_shutdown(self.analyze_changed_file(cycle, &path, &content))
            .await
        {
            Some(corrections) => corrections,
            None => return CycleOutcome::Cancelled,
        };

        if !corrections.is_empty() {
            cycle.transition(CycleState::Correcting);
            match self.applier.apply(&path, &corrections) {
                Ok(applied) => cycle.record_applied(applied),
                Err(err) => {
                    obs::emit_correction_failed(&path, &err);
                    cycle.fail_step(&err);
                    return CycleOutcome::Aborted;
                }
            }
        }

        loop {
            let clean = cycle.retry.attempt > 0;
            cycle.transition(CycleState::Building);
            cycle.retry.attempt += 1;
            let attempt = cycle.retry.attempt;

            let built = match self.until_shutdown(self.builder.build(clean)).await {
                Some(built) => built,
                None => return CycleOutcome::Cancelled,
            };
            let failing = match built {
                Ok(result) if result.cancelled => return CycleOutcome::Cancelled,
                Ok(result) => {
                    obs::emit_build_finished(attempt, &result);
                    if result.succeeded {
                        return CycleOutcome::Succeeded;
                    }
                    cycle.fail_step(result.summary());
                    Some(result)
                }
                Err(err) => {
                    warn!(attempt, error = %err, "build could not run");
                    cycle.fail_step(&err);
                    None
                }
            };

            if cycle.retry.exhausted() {
                return CycleOutcome::Exhausted;
            }

            let delay = self.policy.delay_after(attempt);
            if self.until_shutdown(tokio::time::sleep(delay)).await.is_none() {
                return CycleOutcome::Cancelled;
            }

            cycle.transition(CycleState::AnalyzingBuildErrors);
            let error_lines = failing.map(|r| r.error_lines).unwrap_or_default();
            if error_lines.is_empty() {
                debug!(attempt, "no error lines to analyse, rebuilding clean");
                continue;
            }

            let analysis = match self
                .until_shutdown(self.gateway.analyze_build_errors(&error_lines))
                .await
            {
                None => return CycleOutcome::Cancelled,
                Some(Ok(analysis)) => analysis,
                Some(Err(err)) => {
                    warn!(attempt, error = %err, "build error analysis failed, rebuilding anyway");
                    cycle.fail_step(BuildmendError::from(err));
                    continue;
                }
            };

            if analysis.files_to_fix.is_empty() {
                continue;
            }
            cycle.transition(CycleState::Correcting);
            for fix in analysis.files_to_fix {
                let target = self.resolve(&fix.path);
                let applied = match self.confine(&target).await {
                    Ok(()) => self.applier.apply(&target, &fix.corrections),
                    Err(err) => Err(err),
                };
                match applied {
                    Ok(applied) => cycle.record_applied(applied),
                    Err(err) => cycle.record_file_failure(target, &err),
                }
            }
        }
    }

    /// Analyse the changed file; ask for fixes when issues came back without
    /// corrections. Service failures are recorded and yield no corrections.
    async fn analyze_changed_file(
        &self,
        cycle: &mut Cycle,
        path: &Path,
        content: &str,
    ) -> Vec<Correction> {
        let analysis = match self.gateway.analyze_file(path, content).await {
            Ok(analysis) => analysis,
            Err(err) => {
                warn!(error = %err, "file analysis failed, building as-is");
                cycle.fail_step(BuildmendError::from(err));
                return Vec::new();
            }
        };

        if !analysis.has_issues {
            return Vec::new();
        }
        if !analysis.corrections.is_empty() || analysis.issues.is_empty() {
            return analysis.corrections;
        }

        match self.gateway.request_fixes(path, &analysis.issues).await {
            Ok(corrections) => corrections,
            Err(err) => {
                warn!(issues = analysis.issues.len(), error = %err, "fix request failed, building as-is");
                cycle.fail_step(BuildmendError::from(err));
                Vec::new()
            }
        }
    }

    async fn until_shutdown<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            out = fut => Some(out),
        }
    }

    /// Service-supplied targets must resolve, symlinks included, to a file
    /// under the project root.
    async fn confine(&self, target: &Path) -> Result<(), BuildmendError> {
        let root = tokio::fs::canonicalize(&self.project_root).await?;
        let resolved = tokio::fs::canonicalize(target).await?;
        if resolved.starts_with(&root) {
            Ok(())
        } else {
            Err(BuildmendError::OutsideProject {
                path: resolved,
                root,
            })
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }
}
