//! Structured observability hooks for the correction-retry lifecycle.
//!
//! This module provides:
//! - a cycle-scoped tracing span carrying `cycle_id` and `path`
//! - emission functions for key lifecycle events: start, state transition,
//!   build finished, correction applied/failed, cycle finished
//!
//! Events are emitted at `info!` level, failures at `warn!`.

use std::path::Path;

use tracing::{info, warn};

use crate::build::BuildResult;
use crate::orchestrator::{CycleOutcome, CycleReport, CycleState};

/// Span tagging every event of one orchestration cycle.
///
/// Attach with [`tracing::Instrument::instrument`] so it survives `.await`.
pub fn cycle_span(cycle_id: &str, path: &Path) -> tracing::Span {
    tracing::info_span!("buildmend.cycle", cycle_id = %cycle_id, path = %path.display())
}

/// Emit event: cycle started for a changed file.
pub fn emit_cycle_started(cycle_id: &str, path: &Path) {
    info!(event = "cycle.started", cycle_id = %cycle_id, path = %path.display());
}

/// Emit event: state machine transition.
pub fn emit_transition(from: CycleState, to: CycleState) {
    info!(event = "cycle.transition", from = ?from, to = ?to);
}

/// Emit event: one build attempt finished.
pub fn emit_build_finished(attempt: u32, result: &BuildResult) {
    info!(
        event = "build.finished",
        attempt = attempt,
        succeeded = result.succeeded,
        exit_code = result.exit_code,
        error_lines = result.error_lines.len(),
        duration_ms = result.duration_ms,
    );
}

/// Emit event: corrections written to a file.
pub fn emit_correction_applied(path: &Path, applied: usize) {
    info!(event = "correction.applied", path = %path.display(), applied = applied);
}

/// Emit event: a correction batch failed (warning level).
pub fn emit_correction_failed(path: &Path, error: &dyn std::fmt::Display) {
    warn!(event = "correction.failed", path = %path.display(), error = %error);
}

/// Emit event: cycle finished with its outcome.
pub fn emit_cycle_finished(report: &CycleReport) {
    let last_error = report.last_error.as_deref().unwrap_or("");
    match report.outcome {
        CycleOutcome::Succeeded | CycleOutcome::Cancelled => info!(
            event = "cycle.finished",
            cycle_id = %report.cycle_id,
            path = %report.path.display(),
            outcome = ?report.outcome,
            attempts = report.attempts,
            corrections_applied = report.corrections_applied,
        ),
        CycleOutcome::Exhausted | CycleOutcome::Aborted => warn!(
            event = "cycle.finished",
            cycle_id = %report.cycle_id,
            path = %report.path.display(),
            outcome = ?report.outcome,
            attempts = report.attempts,
            corrections_applied = report.corrections_applied,
            last_error = %last_error,
        ),
    }
}
