//! Persisted cycle reports with digest verification.

use std::path::{Path, PathBuf};

use crate::digest::ContentDigest;
use crate::error::{BuildmendError, Result};
use crate::orchestrator::CycleReport;

const REPORT_FILE: &str = "report.json";
const DIGEST_FILE: &str = "report.digest";

/// Write `<dir>/<cycle_id>/report.json` and its SHA-256 digest.
pub fn write_cycle_report(report: &CycleReport, dir: &Path) -> Result<PathBuf> {
    let cycle_dir = dir.join(&report.cycle_id);
    std::fs::create_dir_all(&cycle_dir)?;

    let report_path = cycle_dir.join(REPORT_FILE);
    let digest_path = cycle_dir.join(DIGEST_FILE);
    let json = serde_json::to_vec_pretty(report)?;
    let digest = ContentDigest::from_bytes(&json);

    std::fs::write(&report_path, &json)?;
    std::fs::write(&digest_path, digest.as_str().as_bytes())?;

    Ok(report_path)
}

/// Read `<dir>/<cycle_id>/report.json`, rejecting it if the digest differs.
pub fn read_cycle_report(cycle_id: &str, dir: &Path) -> Result<CycleReport> {
    let cycle_dir = dir.join(cycle_id);
    let json = std::fs::read(cycle_dir.join(REPORT_FILE))?;
    let expected = std::fs::read_to_string(cycle_dir.join(DIGEST_FILE))?;
    let actual = ContentDigest::from_bytes(&json);
    if expected.trim() != actual.as_str() {
        return Err(BuildmendError::DigestMismatch {
            expected: expected.trim().to_string(),
            actual: actual.as_str().to_string(),
        });
    }

    Ok(serde_json::from_slice(&json)?)
}
