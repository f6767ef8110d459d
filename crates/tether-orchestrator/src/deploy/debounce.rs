//! File-change filtering and trailing-edge debounce

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tether_core::config::DeployConfig;

/// What happened to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Other,
}

impl From<&notify::EventKind> for ChangeKind {
    fn from(kind: &notify::EventKind) -> Self {
        match kind {
            notify::EventKind::Create(_) => ChangeKind::Created,
            notify::EventKind::Modify(_) => ChangeKind::Modified,
            notify::EventKind::Remove(_) => ChangeKind::Removed,
            _ => ChangeKind::Other,
        }
    }
}

/// A single file-change notification from the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl FileChange {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Split a watcher event into per-path changes; access events are dropped
    pub fn from_event(event: &notify::Event) -> Vec<Self> {
        if matches!(event.kind, notify::EventKind::Access(_)) {
            return Vec::new();
        }
        let kind = ChangeKind::from(&event.kind);
        event
            .paths
            .iter()
            .map(|path| FileChange::new(path.clone(), kind))
            .collect()
    }
}

/// Decides which paths can trigger a deploy
#[derive(Debug, Clone)]
pub struct WatchFilter {
    project_root: PathBuf,
    roots: Vec<PathBuf>,
    ignore: Vec<String>,
}

impl WatchFilter {
    pub fn new(project_root: &Path, config: &DeployConfig) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            roots: config
                .watch_dirs
                .iter()
                .map(|dir| project_root.join(dir))
                .collect(),
            ignore: config.ignore.clone(),
        }
    }

    /// Directories to watch; the project root when none are configured
    pub fn roots(&self) -> Vec<PathBuf> {
        if self.roots.is_empty() {
            vec![self.project_root.clone()]
        } else {
            self.roots.clone()
        }
    }

    /// True if a change to `path` should trigger a deploy
    pub fn matches(&self, path: &Path) -> bool {
        let path = if path.is_relative() {
            self.project_root.join(path)
        } else {
            path.to_path_buf()
        };
        let Ok(relative) = path.strip_prefix(&self.project_root) else {
            return false;
        };
        if !self.roots.is_empty() && !self.roots.iter().any(|root| path.starts_with(root)) {
            return false;
        }
        !relative.components().any(|component| match component {
            Component::Normal(name) => self.ignore.iter().any(|ignored| name == ignored.as_str()),
            _ => false,
        })
    }
}

/// Collapse bursts of file changes into batches
///
/// A batch is emitted once no new change has arrived for `window`. Changes to
/// the same path within a batch are merged, keeping the latest kind. Any
/// pending batch is flushed when the channel closes; cancellation drops it.
pub async fn run_debouncer<F>(
    mut changes: mpsc::Receiver<FileChange>,
    window: Duration,
    cancel: CancellationToken,
    mut on_batch: F,
) where
    F: FnMut(Vec<FileChange>) + Send,
{
    let mut pending: BTreeMap<PathBuf, ChangeKind> = BTreeMap::new();
    let sleep = tokio::time::sleep(window);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Debouncer cancelled");
                break;
            }
            change = changes.recv() => match change {
                Some(change) => {
                    tracing::trace!("File change: {:?} {:?}", change.kind, change.path);
                    pending.insert(change.path, change.kind);
                    sleep.as_mut().reset(Instant::now() + window);
                }
                None => {
                    if !pending.is_empty() {
                        on_batch(take_batch(&mut pending));
                    }
                    break;
                }
            },
            _ = &mut sleep, if !pending.is_empty() => {
                on_batch(take_batch(&mut pending));
            }
        }
    }
}

fn take_batch(pending: &mut BTreeMap<PathBuf, ChangeKind>) -> Vec<FileChange> {
    std::mem::take(pending)
        .into_iter()
        .map(|(path, kind)| FileChange { path, kind })
        .collect()
}
