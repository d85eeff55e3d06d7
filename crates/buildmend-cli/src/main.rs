//! buildmend - watch, build and self-correct a native project
//!
//! ## Commands
//!
//! - `watch`: rebuild on source changes and self-correct failures until Ctrl-C
//! - `build`: run one build and print its error lines
//! - `cycle`: run one correction-retry cycle for a file and print its report
//! - `apply`: apply a JSON correction batch to a file
//! - `config`: print the effective configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use buildmend_core::telemetry::init_tracing;
use buildmend_core::{
    write_cycle_report, BuildRunner, Builder, BuildmendConfig, ChangeDebouncer, Correction,
    CorrectionApplier, CycleOutcome, RetryOrchestrator, Session,
};
use buildmend_gateway::{GatewayConfig, HttpGateway};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "buildmend")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Watch, build and self-correct a native project", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// TOML configuration file (environment variables take precedence)
    #[arg(short, long, global = true, env = "BUILDMEND_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the project and self-correct failing builds until Ctrl-C
    Watch,

    /// Run one build and print its error lines
    Build {
        /// Run the clean action first
        #[arg(long)]
        clean: bool,
    },

    /// Run one correction-retry cycle for a file and print its report
    Cycle {
        /// Changed source file (relative paths resolve against the project)
        file: PathBuf,
    },

    /// Apply a correction batch to a file
    Apply {
        /// File to edit
        file: PathBuf,

        /// JSON array of {"position", "length", "replacement"}
        #[arg(long)]
        corrections: String,
    },

    /// Validate and print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            return Err(err).context("cannot read .env file");
        }
    }

    if let Commands::Apply { file, corrections } = &cli.command {
        init_tracing(cli.json, level(cli.verbose, None)?, None)
            .context("cannot open log file")?;
        return cmd_apply(file, corrections);
    }

    let mut config = BuildmendConfig::load(cli.config.as_deref())
        .context("failed to load buildmend configuration")?;
    init_tracing(
        cli.json || config.log.json,
        level(cli.verbose, Some(&config))?,
        config.log.file.as_deref(),
    )
    .context("cannot open log file")?;

    if matches!(cli.command, Commands::Config) {
        return cmd_config(&config);
    }

    config.project.path = std::fs::canonicalize(&config.project.path).with_context(|| {
        format!("project path {} is not accessible", config.project.path.display())
    })?;
    info!(project = %config.project.path.display(), version = buildmend_core::VERSION, "buildmend starting");

    match cli.command {
        Commands::Watch => cmd_watch(&config).await,
        Commands::Build { clean } => cmd_build(&config, clean).await,
        Commands::Cycle { file } => cmd_cycle(&config, &file).await,
        Commands::Apply { .. } | Commands::Config => Ok(()),
    }
}

fn level(verbose: bool, config: Option<&BuildmendConfig>) -> Result<Level> {
    if verbose {
        return Ok(Level::DEBUG);
    }
    match config {
        Some(config) => Ok(config.log_level()?),
        None => Ok(Level::INFO),
    }
}

fn build_runner(config: &BuildmendConfig) -> BuildRunner {
    BuildRunner::new(config.build_command())
        .with_timeout(config.build_timeout())
        .with_error_marker(config.build.error_marker.clone())
}

fn orchestrator(config: &BuildmendConfig) -> Result<RetryOrchestrator> {
    let gateway = HttpGateway::new(GatewayConfig::from_config(config))
        .context("failed to create analysis service client")?;
    Ok(RetryOrchestrator::new(
        Arc::new(gateway),
        Arc::new(build_runner(config)),
        config.retry_policy(),
        config.project.path.clone(),
    ))
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, stopping");
                token.cancel();
            }
            Err(err) => warn!(error = %err, "cannot listen for Ctrl-C"),
        }
    });
}

async fn cmd_watch(config: &BuildmendConfig) -> Result<()> {
    let orchestrator = Arc::new(orchestrator(config)?);
    let debouncer = ChangeDebouncer::new(config.path_filter(), config.debounce_interval());
    let mut session = Session::new(orchestrator, debouncer);
    if let Some(dir) = &config.report.dir {
        session = session.with_report_dir(dir);
    }

    let shutdown = CancellationToken::new();
    cancel_on_interrupt(shutdown.clone());

    let summary = session
        .run(shutdown)
        .await
        .context("failed to watch project")?;
    println!(
        "{} cycle(s): {} succeeded, {} exhausted, {} aborted, {} cancelled",
        summary.cycles, summary.succeeded, summary.exhausted, summary.aborted, summary.cancelled
    );
    Ok(())
}

async fn cmd_build(config: &BuildmendConfig, clean: bool) -> Result<()> {
    let runner = Arc::new(build_runner(config));
    let interrupt = CancellationToken::new();
    cancel_on_interrupt(interrupt.clone());
    tokio::spawn({
        let runner = runner.clone();
        let interrupt = interrupt.clone();
        async move {
            interrupt.cancelled().await;
            runner.cancel();
        }
    });

    let result = runner.build(clean).await.context("build could not run")?;
    interrupt.cancel();
    for line in &result.error_lines {
        println!("{line}");
    }

    if result.cancelled {
        bail!("build cancelled");
    }
    if !result.succeeded {
        bail!(
            "build failed with exit code {} ({} error line(s))",
            result.exit_code,
            result.error_lines.len()
        );
    }
    println!("Build succeeded in {} ms", result.duration_ms);
    Ok(())
}

async fn cmd_cycle(config: &BuildmendConfig, file: &Path) -> Result<()> {
    let orchestrator = Arc::new(orchestrator(config)?);
    let interrupt = CancellationToken::new();
    cancel_on_interrupt(interrupt.clone());
    tokio::spawn({
        let orchestrator = orchestrator.clone();
        let interrupt = interrupt.clone();
        async move {
            interrupt.cancelled().await;
            orchestrator.shutdown();
        }
    });

    let report = orchestrator.run_cycle(file).await;
    interrupt.cancel();

    if let Some(dir) = &config.report.dir {
        let path = write_cycle_report(&report, dir).context("failed to write cycle report")?;
        info!(path = %path.display(), "cycle report written");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    match report.outcome {
        CycleOutcome::Succeeded => Ok(()),
        CycleOutcome::Exhausted => match report.exhausted_error() {
            Some(err) => Err(err.into()),
            None => bail!("cycle exhausted"),
        },
        CycleOutcome::Aborted => bail!(
            "cycle aborted: {}",
            report.last_error.as_deref().unwrap_or("unknown error")
        ),
        CycleOutcome::Cancelled => bail!("cycle cancelled"),
    }
}

fn parse_corrections(json: &str) -> Result<Vec<Correction>> {
    serde_json::from_str(json).context("corrections must be a JSON array of {position, length, replacement}")
}

fn cmd_apply(file: &Path, corrections: &str) -> Result<()> {
    let corrections = parse_corrections(corrections)?;
    let applied = CorrectionApplier::new()
        .apply(file, &corrections)
        .with_context(|| format!("failed to apply corrections to {}", file.display()))?;
    println!("{}", serde_json::to_string_pretty(&applied)?);
    Ok(())
}

fn cmd_config(config: &BuildmendConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_subcommands_with_global_flags() {
        let cli = Cli::try_parse_from(["buildmend", "build", "--clean", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Build { clean: true }));

        let cli = Cli::try_parse_from([
            "buildmend",
            "--config",
            "buildmend.toml",
            "cycle",
            "App/View.swift",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("buildmend.toml")));
        assert!(matches!(cli.command, Commands::Cycle { ref file } if file == Path::new("App/View.swift")));

        assert!(Cli::try_parse_from(["buildmend", "apply", "a.swift"]).is_err());
    }

    #[test]
    fn test_parse_corrections() {
        let parsed =
            parse_corrections(r#"[{"position": 3, "length": 2, "replacement": "ok"}, {"position": 0}]"#)
                .unwrap();
        assert_eq!(parsed, vec![Correction::new(3, 2, "ok"), Correction::new(0, 0, "")]);
        assert!(parse_corrections("{}").is_err());
    }

    #[test]
    fn test_apply_command_edits_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.swift");
        std::fs::write(&path, "let x = 1\n").unwrap();

        cmd_apply(&path, r#"[{"position": 8, "length": 1, "replacement": "42"}]"#).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "let x = 42\n");
    }

    #[test]
    fn test_verbose_overrides_configured_level() {
        assert_eq!(level(true, None).unwrap(), Level::DEBUG);
        assert_eq!(level(false, None).unwrap(), Level::INFO);
    }
}
