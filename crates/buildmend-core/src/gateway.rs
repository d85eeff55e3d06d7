//! Typed boundary to the external analysis/fix service.
//!
//! The service itself is an external collaborator; this module only fixes
//! the contract the orchestrator drives. The HTTP implementation lives in the
//! `buildmend-gateway` crate.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::correction::Correction;

/// Failures of a single gateway call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Unreachable, timed out, non-2xx, or the payload carried an `error`.
    #[error("analysis service unavailable: {0}")]
    ServiceUnavailable(String),

    /// 2xx response that could not be decoded.
    #[error("invalid response from analysis service: {0}")]
    InvalidResponse(String),
}

/// Result type for gateway calls.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// One issue reported by file analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

impl Issue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            severity: None,
        }
    }
}

/// Result of analysing one file's content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub has_issues: bool,

    #[serde(default)]
    pub issues: Vec<Issue>,

    #[serde(default)]
    pub corrections: Vec<Correction>,
}

impl AnalysisResult {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn with_corrections(corrections: Vec<Correction>) -> Self {
        Self {
            has_issues: true,
            issues: Vec::new(),
            corrections,
        }
    }
}

/// Corrections for one file named by build-error analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFix {
    pub path: PathBuf,

    #[serde(default)]
    pub corrections: Vec<Correction>,
}

/// Result of analysing a batch of build error lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildErrorAnalysis {
    #[serde(default)]
    pub files_to_fix: Vec<FileFix>,
}

/// The analysis/fix service as seen by the orchestrator.
#[async_trait]
pub trait AnalysisGateway: Send + Sync {
    /// Analyse the current content of one source file.
    async fn analyze_file(&self, path: &Path, content: &str) -> GatewayResult<AnalysisResult>;

    /// Ask for corrections resolving previously reported issues.
    async fn request_fixes(&self, path: &Path, issues: &[Issue]) -> GatewayResult<Vec<Correction>>;

    /// Map build error lines to per-file corrections.
    async fn analyze_build_errors(&self, error_lines: &[String])
        -> GatewayResult<BuildErrorAnalysis>;
}

/// Language tag sent alongside file content.
pub fn detect_language(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "swift" => "swift",
        "h" | "m" => "objective-c",
        "mm" => "objective-c++",
        "cpp" | "cc" | "hpp" => "c++",
        "c" => "c",
        _ => "unknown",
    }
}
