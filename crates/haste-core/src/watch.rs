//! File watch backends.
//!
//! Both backends feed the same channel of [`WatchEvent`]s. The notify
//! backend watches every root recursively; the dummy backend never emits
//! anything on its own, but like the notify backend it hands out senders
//! so a serving layer can forward out-of-band notifications.

use crate::error::{Error, Result};
use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Kind of change reported for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Change,
    Delete,
}

/// A raw change as delivered by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: ChangeType,
    pub relative_path: PathBuf,
    pub root: PathBuf,
}

impl WatchEvent {
    /// Build an event for an absolute path, attributing it to the deepest
    /// root containing it.
    #[must_use]
    pub fn for_path(kind: ChangeType, path: &Path, roots: &[PathBuf]) -> Option<Self> {
        let root = roots
            .iter()
            .filter(|r| path.starts_with(r))
            .max_by_key(|r| r.components().count())?;
        let relative_path = path.strip_prefix(root).ok()?.to_path_buf();
        Some(Self {
            kind,
            relative_path,
            root: root.clone(),
        })
    }

    #[must_use]
    pub fn absolute_path(&self) -> PathBuf {
        self.root.join(&self.relative_path)
    }
}

enum Backend {
    Notify(RecommendedWatcher),
    Dummy,
}

/// A running watcher. Dropping it stops the backend.
pub struct FileWatcher {
    backend: Backend,
    roots: Vec<PathBuf>,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("dummy", &self.is_dummy())
            .field("roots", &self.roots)
            .finish()
    }
}

impl FileWatcher {
    /// Watch every root recursively.
    ///
    /// # Errors
    /// Returns `Watch` if a root is not a directory or the OS watcher fails.
    pub fn start(roots: &[PathBuf]) -> Result<(Self, mpsc::UnboundedReceiver<WatchEvent>)> {
        for root in roots {
            if !root.is_dir() {
                return Err(Error::Watch(format!("Invalid watch root: {}", root.display())));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let callback_tx = tx.clone();
        let callback_roots = roots.to_vec();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for watch_event in translate(&event, &callback_roots) {
                        if let Err(e) = callback_tx.send(watch_event) {
                            warn!(error = %e, "Failed to send watch event");
                        }
                    }
                }
                Err(e) => error!(error = %e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::Watch(e.to_string()))?;

        for root in roots {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(|e| Error::Watch(e.to_string()))?;
            info!(root = %root.display(), "Watching directory");
        }

        Ok((
            Self {
                backend: Backend::Notify(watcher),
                roots: roots.to_vec(),
                tx,
            },
            rx,
        ))
    }

    /// A watcher that never observes the filesystem.
    #[must_use]
    pub fn dummy(roots: &[PathBuf]) -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                backend: Backend::Dummy,
                roots: roots.to_vec(),
                tx,
            },
            rx,
        )
    }

    #[must_use]
    pub fn is_dummy(&self) -> bool {
        matches!(self.backend, Backend::Dummy)
    }

    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Sender for injecting events (e.g. forwarded from an editor).
    #[must_use]
    pub fn sender(&self) -> mpsc::UnboundedSender<WatchEvent> {
        self.tx.clone()
    }
}

/// Map a notify event to zero or more change events.
fn translate(event: &Event, roots: &[PathBuf]) -> Vec<WatchEvent> {
    let kinds: Vec<(ChangeType, &PathBuf)> = match &event.kind {
        EventKind::Create(CreateKind::File | CreateKind::Any) => {
            event.paths.iter().map(|p| (ChangeType::Add, p)).collect()
        }
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => {
            event.paths.iter().map(|p| (ChangeType::Change, p)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().map(|p| (ChangeType::Delete, p)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().map(|p| (ChangeType::Add, p)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::new();
            if let Some(from) = event.paths.first() {
                out.push((ChangeType::Delete, from));
            }
            if let Some(to) = event.paths.get(1) {
                out.push((ChangeType::Add, to));
            }
            out
        }
        EventKind::Remove(RemoveKind::File | RemoveKind::Any) => {
            event.paths.iter().map(|p| (ChangeType::Delete, p)).collect()
        }
        _ => Vec::new(),
    };

    kinds
        .into_iter()
        .filter_map(|(kind, path)| WatchEvent::for_path(kind, path, roots))
        .collect()
}
