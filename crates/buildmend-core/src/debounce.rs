//! Path filtering and per-path debouncing of raw change events.

use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::trace;

/// Default minimum spacing between two notifications for one path.
pub const DEFAULT_DEBOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// Default native source/header extensions.
pub const DEFAULT_EXTENSIONS: &[&str] = &["swift", "h", "m", "mm", "c", "cc", "cpp", "hpp"];

/// Default build-artifact directory names.
pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    "build",
    "DerivedData",
    "Pods",
    "Carthage",
    "target",
    "node_modules",
];

/// A raw filesystem change as observed by the watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub observed_at: Instant,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, observed_at: Instant) -> Self {
        Self {
            path: path.into(),
            observed_at,
        }
    }

    pub fn now(path: impl Into<PathBuf>) -> Self {
        Self::new(path, Instant::now())
    }
}

/// A debounced "relevant file changed" notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChanged {
    pub path: PathBuf,
    pub observed_at: Instant,
}

/// Extension allow-list plus hidden/artifact directory exclusion.
///
/// Directory checks apply to the path relative to `root`, so a project that
/// itself lives under a hidden directory is still watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFilter {
    root: PathBuf,
    extensions: BTreeSet<String>,
    excluded_dirs: BTreeSet<String>,
}

impl PathFilter {
    pub fn new<E, D>(root: impl Into<PathBuf>, extensions: E, excluded_dirs: D) -> Self
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        Self {
            root: root.into(),
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_lowercase())
                .collect(),
            excluded_dirs: excluded_dirs
                .into_iter()
                .map(|d| d.as_ref().to_string())
                .collect(),
        }
    }

    /// Filter with [`DEFAULT_EXTENSIONS`] and [`DEFAULT_EXCLUDED_DIRS`].
    pub fn with_defaults(root: impl Into<PathBuf>) -> Self {
        Self::new(root, DEFAULT_EXTENSIONS, DEFAULT_EXCLUDED_DIRS)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn matches(&self, path: &Path) -> bool {
        let extension_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.contains(&e.to_lowercase()))
            .unwrap_or(false);
        if !extension_ok {
            return false;
        }

        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        !relative.components().any(|component| match component {
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                name.starts_with('.') || self.excluded_dirs.contains(name.as_ref())
            }
            _ => false,
        })
    }
}

/// Forwards at most one notification per path per interval.
///
/// The window restarts at the forwarded event's time; dropped events inside
/// the window do not extend it.
#[derive(Debug)]
pub struct ChangeDebouncer {
    interval: Duration,
    filter: PathFilter,
    last_emitted: HashMap<PathBuf, Instant>,
}

impl ChangeDebouncer {
    pub fn new(filter: PathFilter, interval: Duration) -> Self {
        Self {
            interval,
            filter,
            last_emitted: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Feed one raw event; returns the notification to forward, if any.
    pub fn observe(&mut self, event: ChangeEvent) -> Option<FileChanged> {
        if !self.filter.matches(&event.path) {
            trace!(path = %event.path.display(), "ignored by filter");
            return None;
        }

        if let Some(last) = self.last_emitted.get(&event.path) {
            if event.observed_at.saturating_duration_since(*last) < self.interval {
                trace!(path = %event.path.display(), "debounced");
                return None;
            }
        }

        self.last_emitted.insert(event.path.clone(), event.observed_at);
        Some(FileChanged {
            path: event.path,
            observed_at: event.observed_at,
        })
    }

    /// Consume raw events until the input closes or the output is dropped.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ChangeEvent>,
        notifications: mpsc::UnboundedSender<FileChanged>,
    ) {
        while let Some(event) = events.recv().await {
            if let Some(changed) = self.observe(event) {
                if notifications.send(changed).is_err() {
                    break;
                }
            }
        }
    }
}
