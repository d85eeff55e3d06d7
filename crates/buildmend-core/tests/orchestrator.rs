use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use buildmend_core::fakes::{failing_build, passing_build, GatewayCall, ScriptedBuilder, ScriptedGateway};
use buildmend_core::{
    AnalysisResult, Backoff, BuildErrorAnalysis, BuildmendError, Correction, CycleOutcome,
    CycleState, FileFix, GatewayError, Issue, RetryOrchestrator, RetryPolicy,
};
use tempfile::{tempdir, TempDir};

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        delay_ms: 0,
        backoff: Backoff::Fixed,
    }
}

struct Fixture {
    dir: TempDir,
    gateway: Arc<ScriptedGateway>,
    builder: Arc<ScriptedBuilder>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_builder(ScriptedBuilder::new())
    }

    fn with_builder(builder: ScriptedBuilder) -> Self {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.swift"), "let a = 1\n").unwrap();
        fs::write(dir.path().join("b.swift"), "let b: Strng = \"\"\n").unwrap();
        Self {
            dir,
            gateway: Arc::new(ScriptedGateway::new()),
            builder: Arc::new(builder),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn orchestrator(&self, policy: RetryPolicy) -> RetryOrchestrator {
        RetryOrchestrator::new(
            self.gateway.clone(),
            self.builder.clone(),
            policy,
            self.dir.path(),
        )
    }
}

fn fix_b_swift() -> BuildErrorAnalysis {
    BuildErrorAnalysis {
        files_to_fix: vec![FileFix {
            path: PathBuf::from("b.swift"),
            corrections: vec![Correction::new(7, 5, "String")],
        }],
    }
}

#[tokio::test]
async fn clean_change_builds_once_and_succeeds() {
    let fx = Fixture::new();
    let report = fx.orchestrator(policy(3)).run_cycle(&fx.path("a.swift")).await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(report.attempts, 1);
    assert_eq!(fx.builder.builds(), 1);
    assert_eq!(fx.builder.clean_flags(), vec![false]);
    assert_eq!(fx.gateway.calls(), vec![GatewayCall::AnalyzeFile(fx.path("a.swift"))]);
    assert_eq!(
        report.states,
        vec![
            CycleState::Idle,
            CycleState::Analyzing,
            CycleState::Building,
            CycleState::Succeeded
        ]
    );
    assert!(report.last_error.is_none());
}

#[tokio::test]
async fn build_errors_fixed_in_other_file_then_rebuild_succeeds() {
    let fx = Fixture::new();
    fx.builder
        .push(Ok(failing_build(&[
            "b.swift:1:8: error: cannot find type 'Strng' in scope",
            "a.swift:1:1: error: previous error",
        ])))
        .push(Ok(passing_build()));
    fx.gateway.push_build_analysis(Ok(fix_b_swift()));

    let report = fx.orchestrator(policy(3)).run_cycle(&fx.path("a.swift")).await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(fx.builder.builds(), 2);
    assert_eq!(fx.builder.clean_flags(), vec![false, true]);
    assert_eq!(
        fs::read_to_string(fx.path("b.swift")).unwrap(),
        "let b: String = \"\"\n"
    );
    assert_eq!(report.corrections_applied, 1);
    assert_eq!(report.written[0].path, fx.path("b.swift"));

    let calls = fx.gateway.calls();
    assert!(matches!(&calls[1], GatewayCall::AnalyzeBuildErrors(lines) if lines.len() == 2));
}

#[tokio::test]
async fn three_failures_exhaust_budget_of_three() {
    let fx = Fixture::new();
    for _ in 0..3 {
        fx.builder.push(Ok(failing_build(&["a.swift:1:1: error: still broken"])));
    }
    fx.builder.push(Ok(passing_build()));

    let report = fx.orchestrator(policy(3)).run_cycle(&fx.path("a.swift")).await;

    assert_eq!(report.outcome, CycleOutcome::Exhausted);
    assert_eq!(report.attempts, 3);
    assert_eq!(fx.builder.builds(), 3);
    assert_eq!(report.states.last(), Some(&CycleState::Exhausted));

    let err = report.exhausted_error().unwrap();
    let msg = err.to_string();
    assert!(msg.contains("could not self-correct"));
    assert!(msg.contains("still broken"));
}

#[tokio::test]
async fn retry_budget_bounds_total_builds() {
    for n in 1..=5u32 {
        let fx = Fixture::new();
        for _ in 0..(n + 2) {
            fx.builder.push(Ok(failing_build(&["x.swift:1:1: error: nope"])));
        }
        let report = fx.orchestrator(policy(n)).run_cycle(&fx.path("a.swift")).await;
        assert_eq!(report.outcome, CycleOutcome::Exhausted);
        assert_eq!(fx.builder.builds(), n as usize, "max_attempts = {n}");
    }
}

#[tokio::test]
async fn issues_without_corrections_request_fixes() {
    let fx = Fixture::new();
    fx.gateway.push_analysis(Ok(AnalysisResult {
        has_issues: true,
        issues: vec![Issue::new("unknown type Strng")],
        corrections: Vec::new(),
    }));
    fx.gateway.push_fixes(Ok(vec![Correction::new(7, 5, "String")]));

    let report = fx.orchestrator(policy(3)).run_cycle(&fx.path("b.swift")).await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(
        fs::read_to_string(fx.path("b.swift")).unwrap(),
        "let b: String = \"\"\n"
    );
    assert!(fx.gateway.calls().contains(&GatewayCall::RequestFixes {
        path: fx.path("b.swift"),
        issues: 1,
    }));
    assert!(report.states.contains(&CycleState::Correcting));
}

#[tokio::test]
async fn analysis_service_failure_still_builds() {
    let fx = Fixture::new();
    fx.gateway
        .push_analysis(Err(GatewayError::ServiceUnavailable("connection refused".into())));

    let report = fx.orchestrator(policy(3)).run_cycle(&fx.path("a.swift")).await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(fx.builder.builds(), 1);
    assert!(report.last_error.unwrap().contains("connection refused"));
}

#[tokio::test]
async fn initial_correction_conflict_aborts_without_building() {
    let fx = Fixture::new();
    fx.gateway.push_analysis(Ok(AnalysisResult::with_corrections(vec![
        Correction::new(0, 4, "var "),
        Correction::new(2, 2, "xx"),
    ])));

    let report = fx.orchestrator(policy(3)).run_cycle(&fx.path("a.swift")).await;

    assert_eq!(report.outcome, CycleOutcome::Aborted);
    assert_eq!(fx.builder.builds(), 0);
    assert!(report.exhausted_error().is_none());
    assert_eq!(fs::read_to_string(fx.path("a.swift")).unwrap(), "let a = 1\n");
}

#[tokio::test]
async fn unreadable_changed_file_aborts() {
    let fx = Fixture::new();
    let report = fx.orchestrator(policy(3)).run_cycle(Path::new("gone.swift")).await;

    assert_eq!(report.outcome, CycleOutcome::Aborted);
    assert_eq!(report.path, fx.path("gone.swift"));
    assert!(fx.gateway.calls().is_empty());
}

#[tokio::test]
async fn per_file_failure_does_not_stop_other_fixes() {
    let fx = Fixture::new();
    fx.builder
        .push(Ok(failing_build(&["b.swift:1:8: error: cannot find type 'Strng'"])))
        .push(Ok(passing_build()));
    let mut analysis = fix_b_swift();
    analysis.files_to_fix.insert(
        0,
        FileFix {
            path: PathBuf::from("missing.swift"),
            corrections: vec![Correction::new(0, 0, "import UIKit\n")],
        },
    );
    fx.gateway.push_build_analysis(Ok(analysis));

    let report = fx.orchestrator(policy(3)).run_cycle(&fx.path("a.swift")).await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(fx.builder.builds(), 2);
    assert_eq!(report.file_failures.len(), 1);
    assert_eq!(report.file_failures[0].path, fx.path("missing.swift"));
    assert_eq!(
        fs::read_to_string(fx.path("b.swift")).unwrap(),
        "let b: String = \"\"\n"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn fixes_outside_project_root_are_refused() {
    let outer = tempdir().unwrap();
    let root = outer.path().join("project");
    fs::create_dir(&root).unwrap();
    fs::write(root.join("a.swift"), "let a = 1\n").unwrap();
    fs::write(root.join("b.swift"), "let b: Strng = \"\"\n").unwrap();
    let victim = outer.path().join("victim.txt");
    fs::write(&victim, "intact\n").unwrap();
    std::os::unix::fs::symlink(&victim, root.join("link.swift")).unwrap();

    let gateway = Arc::new(ScriptedGateway::new());
    let builder = Arc::new(ScriptedBuilder::new());
    builder
        .push(Ok(failing_build(&["b.swift:1:8: error: cannot find type 'Strng'"])))
        .push(Ok(passing_build()));
    let overwrite = vec![Correction::new(0, 6, "PWNED!")];
    let mut analysis = fix_b_swift();
    for path in [
        PathBuf::from("../victim.txt"),
        victim.clone(),
        PathBuf::from("link.swift"),
    ] {
        analysis.files_to_fix.insert(
            0,
            FileFix {
                path,
                corrections: overwrite.clone(),
            },
        );
    }
    gateway.push_build_analysis(Ok(analysis));

    let orchestrator = RetryOrchestrator::new(gateway, builder.clone(), policy(3), &root);
    let report = orchestrator.run_cycle(&root.join("a.swift")).await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(builder.builds(), 2);
    assert_eq!(fs::read_to_string(&victim).unwrap(), "intact\n");
    assert_eq!(
        fs::read_to_string(root.join("b.swift")).unwrap(),
        "let b: String = \"\"\n"
    );

    let refused = report
        .file_failures
        .iter()
        .filter(|f| f.error.contains("outside project root"))
        .count();
    assert_eq!(refused, 3);
    assert_eq!(report.file_failures.len(), 3);
    assert_eq!(report.corrections_applied, 1);
}

#[tokio::test]
async fn build_error_analysis_failure_still_rebuilds() {
    let fx = Fixture::new();
    fx.builder
        .push(Ok(failing_build(&["a.swift:1:1: error: flaky"])))
        .push(Ok(passing_build()));
    fx.gateway
        .push_build_analysis(Err(GatewayError::InvalidResponse("not json".into())));

    let report = fx.orchestrator(policy(3)).run_cycle(&fx.path("a.swift")).await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(fx.builder.builds(), 2);
}

#[tokio::test]
async fn build_that_cannot_run_counts_as_attempt() {
    let fx = Fixture::new();
    for _ in 0..2 {
        fx.builder.push(Err(BuildmendError::Process {
            command: "xcodebuild build".into(),
            reason: "No such file or directory".into(),
        }));
    }

    let report = fx.orchestrator(policy(2)).run_cycle(&fx.path("a.swift")).await;

    assert_eq!(report.outcome, CycleOutcome::Exhausted);
    assert_eq!(report.attempts, 2);
    assert!(report.last_error.unwrap().contains("No such file"));
    let analysed_errors = fx
        .gateway
        .calls()
        .iter()
        .filter(|c| matches!(c, GatewayCall::AnalyzeBuildErrors(_)))
        .count();
    assert_eq!(analysed_errors, 0);
}

#[tokio::test(start_paused = true)]
async fn exponential_backoff_between_attempts() {
    let fx = Fixture::new();
    for _ in 0..3 {
        fx.builder.push(Ok(failing_build(&["a.swift:1:1: error: x"])));
    }
    let orchestrator = fx.orchestrator(RetryPolicy {
        max_attempts: 3,
        delay_ms: 1_000,
        backoff: Backoff::Exponential,
    });

    let started = tokio::time::Instant::now();
    let report = orchestrator.run_cycle(&fx.path("a.swift")).await;
    let elapsed = started.elapsed();

    assert_eq!(report.outcome, CycleOutcome::Exhausted);
    // 1s after the first failure, 2s after the second, none after the last.
    assert!(elapsed >= Duration::from_millis(3_000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(3_500), "{elapsed:?}");
}

#[tokio::test]
async fn shutdown_cancels_in_flight_build() {
    let fx = Fixture::with_builder(ScriptedBuilder::new().with_delay(Duration::from_secs(60)));
    let orchestrator = Arc::new(fx.orchestrator(policy(3)));

    let cycle = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let path = fx.path("a.swift");
        async move { orchestrator.run_cycle(&path).await }
    });

    for _ in 0..200 {
        if fx.builder.builds() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(fx.builder.builds(), 1);
    orchestrator.shutdown();

    let report = tokio::time::timeout(Duration::from_secs(5), cycle)
        .await
        .expect("cycle did not stop")
        .unwrap();
    assert_eq!(report.outcome, CycleOutcome::Cancelled);
    assert_eq!(report.attempts, 1);

    let after = orchestrator.run_cycle(&fx.path("b.swift")).await;
    assert_eq!(after.outcome, CycleOutcome::Cancelled);
    assert_eq!(fx.builder.builds(), 1);
}

#[tokio::test]
async fn concurrent_cycles_never_overlap_builds() {
    let fx = Fixture::with_builder(ScriptedBuilder::new().with_delay(Duration::from_millis(30)));
    let orchestrator = Arc::new(fx.orchestrator(policy(3)));

    let handles: Vec<_> = ["a.swift", "b.swift", "a.swift"]
        .into_iter()
        .map(|name| {
            let orchestrator = orchestrator.clone();
            let path = fx.path(name);
            tokio::spawn(async move { orchestrator.run_cycle(&path).await })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().outcome, CycleOutcome::Succeeded);
    }
    assert_eq!(fx.builder.builds(), 3);
    assert_eq!(fx.builder.max_concurrent(), 1);
}
