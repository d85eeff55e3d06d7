//! buildmend Core Library
//!
//! Correction-retry orchestration for a native project: watch sources,
//! debounce changes, build, and on failure apply service-suggested corrections
//! before retrying within a bounded budget.
//!
//! ## Key Components
//!
//! - `CorrectionApplier`: atomic byte-range edits with backup/restore
//! - `BuildRunner`: child-process builds with cancellation and timeout
//! - `ChangeDebouncer`: per-path rate limiting of filesystem events
//! - `AnalysisGateway`: boundary to the analysis/fix service
//! - `RetryOrchestrator`: the bounded analyze → correct → build state machine
//! - `Session`: one watch session, one cycle at a time

pub mod build;
pub mod config;
pub mod correction;
pub mod debounce;
pub mod digest;
mod error;
pub mod fakes;
pub mod gateway;
pub mod obs;
pub mod orchestrator;
pub mod report;
pub mod session;
pub mod telemetry;
pub mod watch;

pub use build::{extract_error_lines, BuildCommand, BuildResult, BuildRunner, Builder};
pub use config::{BuildmendConfig, ConfigError};
pub use correction::{
    AppliedCorrections, ContentWriter, Correction, CorrectionApplier, RenameWriter,
};
pub use debounce::{ChangeDebouncer, ChangeEvent, FileChanged, PathFilter};
pub use digest::ContentDigest;
pub use error::{BuildmendError, Result};
pub use gateway::{
    detect_language, AnalysisGateway, AnalysisResult, BuildErrorAnalysis, FileFix, GatewayError,
    GatewayResult, Issue,
};
pub use orchestrator::{
    Backoff, CycleOutcome, CycleReport, CycleState, FileFailure, RetryOrchestrator, RetryPolicy,
    RetryState,
};
pub use report::{read_cycle_report, write_cycle_report};
pub use session::{Session, SessionSummary};
pub use watch::ProjectWatch;

/// Crate version, reported by the CLI and the gateway user agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
