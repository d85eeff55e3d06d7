//! Atomic application of byte-range corrections to a single source file.
//!
//! The applier reads the target once, validates the batch against that
//! content, takes a sibling backup, writes the edited content and only then
//! drops the backup. Any failure after the backup exists puts the original
//! bytes back before the error reaches the caller.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::digest::ContentDigest;
use crate::error::{BuildmendError, Result};

/// Default suffix appended to the file name of the sibling backup.
pub const DEFAULT_BACKUP_SUFFIX: &str = ".buildmend.bak";

/// A byte-range replacement against the unedited file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    /// Byte offset into the content before any edit of this batch.
    pub position: usize,

    /// Number of bytes to remove at `position`.
    #[serde(default)]
    pub length: usize,

    /// Text inserted in place of the removed range.
    #[serde(default)]
    pub replacement: String,
}

impl Correction {
    pub fn new(position: usize, length: usize, replacement: impl Into<String>) -> Self {
        Self {
            position,
            length,
            replacement: replacement.into(),
        }
    }

    fn end(&self) -> Option<usize> {
        self.position.checked_add(self.length)
    }
}

/// Summary of a successful [`CorrectionApplier::apply`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedCorrections {
    pub path: PathBuf,
    pub applied: usize,
    pub before: ContentDigest,
    pub after: ContentDigest,
}

/// Final write of edited content to the target path.
pub trait ContentWriter: Send + Sync {
    fn write(&self, path: &Path, content: &[u8]) -> std::io::Result<()>;
}

/// Writes into a hidden sibling temp file, then renames it over the target.
#[derive(Debug, Default, Clone, Copy)]
pub struct RenameWriter;

impl ContentWriter for RenameWriter {
    fn write(&self, path: &Path, content: &[u8]) -> std::io::Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(".buildmend-")
            .tempfile_in(dir)?;
        tmp.write_all(content)?;
        tmp.as_file().sync_all()?;
        if let Ok(meta) = fs::metadata(path) {
            tmp.as_file().set_permissions(meta.permissions())?;
        }
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Applies correction batches with backup and restore-on-failure.
#[derive(Clone)]
pub struct CorrectionApplier {
    writer: Arc<dyn ContentWriter>,
    backup_suffix: String,
}

impl Default for CorrectionApplier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CorrectionApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrectionApplier")
            .field("backup_suffix", &self.backup_suffix)
            .finish_non_exhaustive()
    }
}

impl CorrectionApplier {
    pub fn new() -> Self {
        Self::with_writer(Arc::new(RenameWriter))
    }

    /// Use a custom final writer.
    pub fn with_writer(writer: Arc<dyn ContentWriter>) -> Self {
        Self {
            writer,
            backup_suffix: DEFAULT_BACKUP_SUFFIX.to_string(),
        }
    }

    /// Sibling path used to hold the original content during a call.
    pub fn backup_path(&self, path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(&self.backup_suffix);
        path.with_file_name(name)
    }

    /// Apply `corrections` to the file at `path`.
    ///
    /// An empty batch is a no-op and performs no write. On error the file is
    /// byte-identical to its content before the call, or the error is
    /// [`BuildmendError::CorruptionDetected`].
    pub fn apply(&self, path: &Path, corrections: &[Correction]) -> Result<AppliedCorrections> {
        let original = fs::read(path)?;
        validate_corrections(path, original.len(), corrections)?;

        let before = ContentDigest::from_bytes(&original);
        if corrections.is_empty() {
            return Ok(AppliedCorrections {
                path: path.to_path_buf(),
                applied: 0,
                after: before.clone(),
                before,
            });
        }

        let backup = self.backup_path(path);
        take_backup(path, &backup, &before)?;

        let edited = splice_corrections(&original, corrections);
        if let Err(err) = self.writer.write(path, &edited) {
            warn!(path = %path.display(), error = %err, "write failed, restoring from backup");
            restore_backup(path, &backup, &before)?;
            return Err(err.into());
        }

        if let Err(err) = fs::remove_file(&backup) {
            warn!(backup = %backup.display(), error = %err, "failed to remove backup");
        }

        let after = ContentDigest::from_bytes(&edited);
        debug!(
            path = %path.display(),
            applied = corrections.len(),
            before = before.short(),
            after = after.short(),
            "corrections written"
        );
        Ok(AppliedCorrections {
            path: path.to_path_buf(),
            applied: corrections.len(),
            before,
            after,
        })
    }
}

/// Reject out-of-range, overlapping and same-position corrections.
pub fn validate_corrections(path: &Path, len: usize, corrections: &[Correction]) -> Result<()> {
    let conflict = |reason: String| BuildmendError::CorrectionConflict {
        path: path.to_path_buf(),
        reason,
    };

    let mut sorted: Vec<&Correction> = corrections.iter().collect();
    sorted.sort_by_key(|c| c.position);

    let mut previous: Option<(usize, usize)> = None;
    for correction in sorted {
        let end = correction
            .end()
            .ok_or_else(|| conflict(format!("range at {} overflows", correction.position)))?;
        if end > len {
            return Err(conflict(format!(
                "range {}..{} exceeds file length {}",
                correction.position, end, len
            )));
        }
        if let Some((prev_start, prev_end)) = previous {
            if prev_start == correction.position || prev_end > correction.position {
                return Err(conflict(format!(
                    "range {}..{} overlaps {}..{}",
                    correction.position, end, prev_start, prev_end
                )));
            }
        }
        previous = Some((correction.position, end));
    }
    Ok(())
}

/// Splice a validated batch into `content`, highest position first so each
/// edit leaves the offsets below it untouched.
pub fn splice_corrections(content: &[u8], corrections: &[Correction]) -> Vec<u8> {
    let mut ordered: Vec<&Correction> = corrections.iter().collect();
    ordered.sort_by(|a, b| b.position.cmp(&a.position));

    let mut out = content.to_vec();
    for correction in ordered {
        let range = correction.position..correction.position + correction.length;
        out.splice(range, correction.replacement.bytes());
    }
    out
}

fn take_backup(path: &Path, backup: &Path, expected: &ContentDigest) -> Result<()> {
    if let Err(err) = fs::copy(path, backup) {
        let _ = fs::remove_file(backup);
        return Err(err.into());
    }

    let copied = match fs::read(backup) {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = fs::remove_file(backup);
            return Err(err.into());
        }
    };
    let actual = ContentDigest::from_bytes(&copied);
    if &actual != expected {
        let _ = fs::remove_file(backup);
        return Err(BuildmendError::CorruptionDetected {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

// The backup is left in place if it cannot be moved back; it is then the
// only intact copy.
fn restore_backup(path: &Path, backup: &Path, expected: &ContentDigest) -> Result<()> {
    if fs::rename(backup, path).is_err() {
        fs::copy(backup, path)?;
        fs::remove_file(backup)?;
    }

    let restored = fs::read(path)?;
    let actual = ContentDigest::from_bytes(&restored);
    if &actual != expected {
        return Err(BuildmendError::CorruptionDetected {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    debug!(path = %path.display(), "original content restored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io;
    use tempfile::tempdir;

    /// Writes half of the content straight into the target, then fails.
    struct TornWriter;

    impl ContentWriter for TornWriter {
        fn write(&self, path: &Path, content: &[u8]) -> io::Result<()> {
            fs::write(path, &content[..content.len() / 2])?;
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    fn backups_in(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().ends_with(DEFAULT_BACKUP_SUFFIX))
            .collect()
    }

    #[test]
    fn test_apply_descending_keeps_offsets_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("View.swift");
        fs::write(&path, "let a = foo\nlet b = bar\n").unwrap();

        let corrections = vec![
            Correction::new(8, 3, "fooBar"),
            Correction::new(20, 3, "baz"),
        ];
        let applied = CorrectionApplier::new().apply(&path, &corrections).unwrap();

        assert_eq!(applied.applied, 2);
        assert_eq!(fs::read_to_string(&path).unwrap(), "let a = fooBar\nlet b = baz\n");
        assert_ne!(applied.before, applied.after);
        assert!(backups_in(dir.path()).is_empty());
    }

    #[test]
    fn test_apply_insertion_and_deletion() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.m");
        fs::write(&path, "int x = 1;;").unwrap();

        let corrections = vec![Correction::new(0, 0, "static "), Correction::new(10, 1, "")];
        CorrectionApplier::new().apply(&path, &corrections).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "static int x = 1;");
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.swift");
        fs::write(&path, "x").unwrap();

        let applied = CorrectionApplier::new().apply(&path, &[]).unwrap();
        assert_eq!(applied.applied, 0);
        assert_eq!(applied.before, applied.after);
        assert!(backups_in(dir.path()).is_empty());
    }

    #[test]
    fn test_overlapping_corrections_rejected_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.swift");
        fs::write(&path, "0123456789").unwrap();

        let corrections = vec![Correction::new(2, 4, "x"), Correction::new(5, 2, "y")];
        let err = CorrectionApplier::new().apply(&path, &corrections).unwrap_err();
        assert!(matches!(err, BuildmendError::CorrectionConflict { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "0123456789");
        assert!(backups_in(dir.path()).is_empty());
    }

    #[test]
    fn test_same_position_rejected() {
        let err = validate_corrections(
            Path::new("a.swift"),
            10,
            &[Correction::new(3, 0, "a"), Correction::new(3, 0, "b")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let err = validate_corrections(Path::new("a.swift"), 4, &[Correction::new(3, 2, "")])
            .unwrap_err();
        assert!(err.to_string().contains("exceeds file length 4"));

        let err = validate_corrections(
            Path::new("a.swift"),
            4,
            &[Correction::new(usize::MAX, 1, "")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn test_adjacent_ranges_allowed() {
        validate_corrections(
            Path::new("a.swift"),
            10,
            &[Correction::new(0, 5, "a"), Correction::new(5, 5, "b")],
        )
        .unwrap();
    }

    #[test]
    fn test_interrupted_write_restores_original() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Model.swift");
        let original = "struct Model {\n    var name: Strng\n}\n";
        fs::write(&path, original).unwrap();

        let applier = CorrectionApplier::with_writer(Arc::new(TornWriter));
        let err = applier
            .apply(&path, &[Correction::new(29, 5, "String")])
            .unwrap_err();

        assert!(matches!(err, BuildmendError::Io(_)));
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
        assert!(backups_in(dir.path()).is_empty());
    }

    #[test]
    fn test_missing_file_fails_before_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.swift");
        let err = CorrectionApplier::new()
            .apply(&path, &[Correction::new(0, 0, "x")])
            .unwrap_err();
        assert!(matches!(err, BuildmendError::Io(_)));
        assert!(!path.exists());
        assert!(backups_in(dir.path()).is_empty());
    }

    #[test]
    fn test_backup_failure_leaves_target_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.swift");
        fs::write(&path, "let a = 1\n").unwrap();
        let applier = CorrectionApplier::new();
        // A directory in the backup slot makes the copy fail for any user.
        fs::create_dir(applier.backup_path(&path)).unwrap();

        let err = applier
            .apply(&path, &[Correction::new(8, 1, "2")])
            .unwrap_err();

        assert!(matches!(err, BuildmendError::Io(_)));
        assert_eq!(fs::read_to_string(&path).unwrap(), "let a = 1\n");
        assert!(applier.backup_path(&path).is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn test_read_only_directory_fails_before_editing() {
        use std::os::unix::fs::PermissionsExt;

        // Permission bits do not bind root.
        if unsafe { libc::geteuid() } == 0 {
            return;
        }

        let dir = tempdir().unwrap();
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        let path = locked.join("a.swift");
        fs::write(&path, "let a = 1\n").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();

        let result = CorrectionApplier::new().apply(&path, &[Correction::new(8, 1, "2")]);
        let content = fs::read_to_string(&path).unwrap();
        let leftovers = backups_in(&locked);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert!(matches!(result, Err(BuildmendError::Io(_))));
        assert_eq!(content, "let a = 1\n");
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_backup_path_is_sibling() {
        let applier = CorrectionApplier::new();
        assert_eq!(
            applier.backup_path(Path::new("/p/src/a.swift")),
            PathBuf::from("/p/src/a.swift.buildmend.bak")
        );
    }

    /// Reference: walk the original left to right, copying gaps and
    /// replacements, which is independent of the order edits are listed in.
    fn apply_against_original(content: &[u8], corrections: &[Correction]) -> Vec<u8> {
        let mut sorted = corrections.to_vec();
        sorted.sort_by_key(|c| c.position);
        let mut out = Vec::new();
        let mut cursor = 0;
        for c in sorted {
            out.extend_from_slice(&content[cursor..c.position]);
            out.extend_from_slice(c.replacement.as_bytes());
            cursor = c.position + c.length;
        }
        out.extend_from_slice(&content[cursor..]);
        out
    }

    fn disjoint_corrections() -> impl Strategy<Value = (Vec<u8>, Vec<Correction>)> {
        (
            proptest::collection::vec(any::<u8>(), 0..128),
            proptest::collection::vec((0usize..8, 0usize..6, "[a-z]{0,5}"), 0..8),
        )
            .prop_map(|(content, specs)| {
                let mut corrections = Vec::new();
                let mut cursor = 0;
                for (gap, length, replacement) in specs {
                    let position = cursor + gap + 1;
                    if position + length > content.len() {
                        break;
                    }
                    corrections.push(Correction::new(position, length, replacement));
                    cursor = position + length;
                }
                (content, corrections)
            })
    }

    proptest! {
        #[test]
        fn prop_descending_splice_matches_original_offsets(
            (content, corrections) in disjoint_corrections()
        ) {
            prop_assert!(validate_corrections(Path::new("p"), content.len(), &corrections).is_ok());
            let expected = apply_against_original(&content, &corrections);
            prop_assert_eq!(splice_corrections(&content, &corrections), expected.clone());

            let mut reversed = corrections.clone();
            reversed.reverse();
            prop_assert_eq!(splice_corrections(&content, &reversed), expected.clone());

            let mut rotated = corrections.clone();
            if !rotated.is_empty() {
                let mid = rotated.len() / 2;
                rotated.rotate_left(mid);
            }
            prop_assert_eq!(splice_corrections(&content, &rotated), expected);
        }
    }
}
