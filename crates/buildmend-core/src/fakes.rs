//! In-memory fakes for the gateway and builder seams (testing only)
//!
//! `ScriptedGateway` and `ScriptedBuilder` replay queued responses and record
//! every call, so orchestrator and session behaviour can be exercised without
//! a network service or a native toolchain.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::build::{BuildResult, Builder};
use crate::correction::Correction;
use crate::error::Result;
use crate::gateway::{
    AnalysisGateway, AnalysisResult, BuildErrorAnalysis, GatewayResult, Issue,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A build that exited 0.
pub fn passing_build() -> BuildResult {
    BuildResult {
        succeeded: true,
        exit_code: 0,
        stdout: "** BUILD SUCCEEDED **\n".to_string(),
        stderr: String::new(),
        error_lines: Vec::new(),
        cancelled: false,
        duration_ms: 1,
    }
}

/// A build that exited 65 with the given error lines on stdout.
pub fn failing_build(error_lines: &[&str]) -> BuildResult {
    let error_lines: Vec<String> = error_lines.iter().map(|l| l.to_string()).collect();
    let mut stdout = error_lines.join("\n");
    stdout.push_str("\n** BUILD FAILED **\n");
    BuildResult {
        succeeded: false,
        exit_code: 65,
        stdout,
        stderr: String::new(),
        error_lines,
        cancelled: false,
        duration_ms: 1,
    }
}

// ---------------------------------------------------------------------------
// ScriptedGateway
// ---------------------------------------------------------------------------

/// One recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    AnalyzeFile(PathBuf),
    RequestFixes { path: PathBuf, issues: usize },
    AnalyzeBuildErrors(Vec<String>),
}

/// Gateway replaying queued responses; an empty queue answers "nothing to do".
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    analyses: Mutex<VecDeque<GatewayResult<AnalysisResult>>>,
    fixes: Mutex<VecDeque<GatewayResult<Vec<Correction>>>>,
    build_analyses: Mutex<VecDeque<GatewayResult<BuildErrorAnalysis>>>,
    calls: Mutex<Vec<GatewayCall>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_analysis(&self, result: GatewayResult<AnalysisResult>) -> &Self {
        lock(&self.analyses).push_back(result);
        self
    }

    pub fn push_fixes(&self, result: GatewayResult<Vec<Correction>>) -> &Self {
        lock(&self.fixes).push_back(result);
        self
    }

    pub fn push_build_analysis(&self, result: GatewayResult<BuildErrorAnalysis>) -> &Self {
        lock(&self.build_analyses).push_back(result);
        self
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: GatewayCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl AnalysisGateway for ScriptedGateway {
    async fn analyze_file(&self, path: &Path, _content: &str) -> GatewayResult<AnalysisResult> {
        self.record(GatewayCall::AnalyzeFile(path.to_path_buf()));
        lock(&self.analyses)
            .pop_front()
            .unwrap_or_else(|| Ok(AnalysisResult::clean()))
    }

    async fn request_fixes(&self, path: &Path, issues: &[Issue]) -> GatewayResult<Vec<Correction>> {
        self.record(GatewayCall::RequestFixes {
            path: path.to_path_buf(),
            issues: issues.len(),
        });
        lock(&self.fixes).pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn analyze_build_errors(
        &self,
        error_lines: &[String],
    ) -> GatewayResult<BuildErrorAnalysis> {
        self.record(GatewayCall::AnalyzeBuildErrors(error_lines.to_vec()));
        lock(&self.build_analyses)
            .pop_front()
            .unwrap_or_else(|| Ok(BuildErrorAnalysis::default()))
    }
}

// ---------------------------------------------------------------------------
// ScriptedBuilder
// ---------------------------------------------------------------------------

/// Builder replaying queued results; an empty queue yields a passing build.
///
/// Tracks how many builds overlap so tests can assert mutual exclusion.
#[derive(Debug, Default)]
pub struct ScriptedBuilder {
    results: Mutex<VecDeque<Result<BuildResult>>>,
    delay: Option<Duration>,
    clean_flags: Mutex<Vec<bool>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    in_flight: Mutex<Option<CancellationToken>>,
}

impl ScriptedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each build takes `delay` (cancellable) before returning.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, result: Result<BuildResult>) -> &Self {
        lock(&self.results).push_back(result);
        self
    }

    /// Number of builds started.
    pub fn builds(&self) -> usize {
        lock(&self.clean_flags).len()
    }

    /// The `clean` flag of every build, in order.
    pub fn clean_flags(&self) -> Vec<bool> {
        lock(&self.clean_flags).clone()
    }

    /// Highest number of builds observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Builder for ScriptedBuilder {
    async fn build(&self, clean: bool) -> Result<BuildResult> {
        lock(&self.clean_flags).push(clean);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let token = CancellationToken::new();
        *lock(&self.in_flight) = Some(token.clone());

        let cancelled = match self.delay {
            Some(delay) => tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = token.cancelled() => true,
            },
            None => token.is_cancelled(),
        };

        *lock(&self.in_flight) = None;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if cancelled {
            return Ok(BuildResult::cancelled(0));
        }
        lock(&self.results)
            .pop_front()
            .unwrap_or_else(|| Ok(passing_build()))
    }

    fn cancel(&self) -> bool {
        match lock(&self.in_flight).as_ref() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }
}
