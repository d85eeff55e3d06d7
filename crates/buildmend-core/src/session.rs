//! One watch session per project: watch → debounce → queue → one cycle at a time.
//!
//! Raw events go through a [`ChangeDebouncer`] task; its notifications that
//! arrive while a cycle runs are queued as a FIFO of distinct paths and
//! drained after the cycle ends. Stopping the session
//! cancels the in-flight cycle, waits for it and tears the watch down before
//! returning.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::debounce::{ChangeDebouncer, ChangeEvent, FileChanged};
use crate::digest::ContentDigest;
use crate::error::Result;
use crate::orchestrator::{CycleOutcome, CycleReport, RetryOrchestrator};
use crate::report::write_cycle_report;
use crate::watch::ProjectWatch;

/// Counters for a finished session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub cycles: usize,
    pub succeeded: usize,
    pub exhausted: usize,
    pub aborted: usize,
    pub cancelled: usize,
    /// Notifications dropped because they only echoed a correction write.
    pub suppressed: usize,
}

impl SessionSummary {
    fn count(&mut self, outcome: CycleOutcome) {
        self.cycles += 1;
        match outcome {
            CycleOutcome::Succeeded => self.succeeded += 1,
            CycleOutcome::Exhausted => self.exhausted += 1,
            CycleOutcome::Aborted => self.aborted += 1,
            CycleOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

pub struct Session {
    debouncer: ChangeDebouncer,
    cycles: CycleQueue,
}

// Everything the session loop mutates once the debouncer task owns its half.
struct CycleQueue {
    orchestrator: Arc<RetryOrchestrator>,
    report_dir: Option<PathBuf>,
    report_sink: Option<mpsc::UnboundedSender<CycleReport>>,
    pending: VecDeque<PathBuf>,
    written: HashMap<PathBuf, ContentDigest>,
    summary: SessionSummary,
}

impl Session {
    pub fn new(orchestrator: Arc<RetryOrchestrator>, debouncer: ChangeDebouncer) -> Self {
        Self {
            debouncer,
            cycles: CycleQueue {
                orchestrator,
                report_dir: None,
                report_sink: None,
                pending: VecDeque::new(),
                written: HashMap::new(),
                summary: SessionSummary::default(),
            },
        }
    }

    /// Persist every finished cycle's report under `dir`.
    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cycles.report_dir = Some(dir.into());
        self
    }

    /// Also hand every finished cycle's report to `sink`.
    pub fn with_report_sink(mut self, sink: mpsc::UnboundedSender<CycleReport>) -> Self {
        self.cycles.report_sink = Some(sink);
        self
    }

    /// Watch the orchestrator's project root until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<SessionSummary> {
        let root = self.cycles.orchestrator.project_root().to_path_buf();
        let (tx, rx) = mpsc::unbounded_channel();
        let watch = ProjectWatch::start(&root, tx)?;
        let summary = self.run_with_events(rx, shutdown).await;
        watch.stop();
        Ok(summary)
    }

    /// Drive cycles from a raw event stream until `shutdown` fires, or until
    /// the stream closes and the queue is drained.
    pub async fn run_with_events(
        self,
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        shutdown: CancellationToken,
    ) -> SessionSummary {
        let Session {
            debouncer,
            mut cycles,
        } = self;
        let (changed_tx, mut changed) = mpsc::unbounded_channel();
        let debouncing = tokio::spawn(debouncer.run(events, changed_tx));

        let mut active: Option<JoinHandle<CycleReport>> = None;
        let mut events_open = true;

        loop {
            if active.is_none() {
                active = cycles.start_next().await;
            }
            if active.is_none() && !events_open {
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                joined = join(&mut active) => {
                    active = None;
                    cycles.finish_cycle(joined);
                }
                notification = changed.recv(), if events_open => match notification {
                    Some(notification) => cycles.enqueue(notification),
                    None => events_open = false,
                },
            }
        }

        debouncing.abort();
        if let Some(handle) = active.take() {
            info!("stopping in-flight cycle");
            cycles.orchestrator.shutdown();
            cycles.finish_cycle(handle.await);
        }
        if !cycles.pending.is_empty() {
            debug!(pending = cycles.pending.len(), "discarding queued notifications");
        }
        cycles.summary
    }
}

impl CycleQueue {
    fn enqueue(&mut self, changed: FileChanged) {
        if self.pending.contains(&changed.path) {
            debug!(path = %changed.path.display(), "already queued");
            return;
        }
        debug!(path = %changed.path.display(), queued = self.pending.len() + 1, "change queued");
        self.pending.push_back(changed.path);
    }

    async fn start_next(&mut self) -> Option<JoinHandle<CycleReport>> {
        while let Some(path) = self.pending.pop_front() {
            if self.is_own_write(&path).await {
                debug!(path = %path.display(), "skipping notification for corrected file");
                self.summary.suppressed += 1;
                continue;
            }
            let orchestrator = self.orchestrator.clone();
            return Some(tokio::spawn(async move { orchestrator.run_cycle(&path).await }));
        }
        None
    }

    async fn is_own_write(&mut self, path: &Path) -> bool {
        let Some(recorded) = self.written.get(path) else {
            return false;
        };
        let unchanged = tokio::fs::read(path)
            .await
            .map(|bytes| ContentDigest::from_bytes(&bytes) == *recorded)
            .unwrap_or(false);
        if !unchanged {
            self.written.remove(path);
        }
        unchanged
    }

    fn finish_cycle(&mut self, joined: std::result::Result<CycleReport, JoinError>) {
        let report = match joined {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "cycle task failed");
                return;
            }
        };

        self.summary.count(report.outcome);
        for applied in &report.written {
            self.written.insert(applied.path.clone(), applied.after.clone());
        }
        if let Some(err) = report.exhausted_error() {
            warn!("{err}");
        }
        if let Some(dir) = &self.report_dir {
            match write_cycle_report(&report, dir) {
                Ok(path) => debug!(path = %path.display(), "cycle report written"),
                Err(err) => warn!(error = %err, "cannot write cycle report"),
            }
        }
        if let Some(sink) = &self.report_sink {
            let _ = sink.send(report);
        }
    }
}

async fn join(
    active: &mut Option<JoinHandle<CycleReport>>,
) -> std::result::Result<CycleReport, JoinError> {
    match active {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}
