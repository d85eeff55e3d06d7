//! Recursive filesystem watch rooted at the project path.
//!
//! The watch only translates OS notifications into raw [`ChangeEvent`]s on a
//! channel; filtering and rate limiting belong to the debouncer.

use std::path::{Path, PathBuf};

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::debounce::ChangeEvent;
use crate::error::Result;

/// A live recursive watch. Dropping it (or calling [`stop`](Self::stop))
/// tears the OS watch down and closes the event channel.
pub struct ProjectWatch {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl std::fmt::Debug for ProjectWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectWatch")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ProjectWatch {
    /// Start watching `root` recursively, sending every content change on `tx`.
    pub fn start(root: &Path, tx: mpsc::UnboundedSender<ChangeEvent>) -> Result<Self> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !is_content_change(&event.kind) {
                    return;
                }
                for path in event.paths {
                    let _ = tx.send(ChangeEvent::now(path));
                }
            }
            Err(err) => warn!(error = %err, "watch error"),
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        info!(root = %root.display(), "watching project");

        Ok(Self {
            _watcher: watcher,
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stop(self) {
        info!(root = %self.root.display(), "stopped watching project");
    }
}

/// Creations, data writes and renames; metadata-only changes are ignored.
pub fn is_content_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
    )
}
