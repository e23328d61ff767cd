/*!
Native filesystem watching for the daemon: creation and move-in events from
every watched root, delivered through a bounded queue
*/

use std::fs;
use std::path::{Path, PathBuf};

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Created,
    MovedTo,
}

/// A path that appeared under a watched root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub is_dir: bool,
    pub kind: WatchKind,
}

/// Owns the native watcher; dropping or stopping it ends the event stream
pub struct FsWatcher {
    watcher: Option<RecommendedWatcher>,
    watched: Vec<PathBuf>,
}

impl FsWatcher {
    /// Watch each existing root recursively. Missing roots are logged and
    /// skipped.
    pub fn start(
        roots: &[PathBuf],
        capacity: usize,
    ) -> notify::Result<(Self, ReceiverStream<WatchEvent>)> {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    if let Some(watch_event) = convert_event(&event) {
                        forward(&tx, watch_event);
                    }
                }
                Err(e) => error!("Watcher error: {:?}", e),
            }
        })?;

        let mut watched = Vec::new();
        for root in roots {
            if !root.is_dir() {
                warn!("Watch directory does not exist: {:?}", root);
                continue;
            }
            match watcher.watch(root, RecursiveMode::Recursive) {
                Ok(()) => {
                    info!("Watching directory: {:?}", root);
                    watched.push(root.clone());
                }
                Err(e) => error!("Failed to watch {:?}: {}", root, e),
            }
        }

        Ok((
            Self {
                watcher: Some(watcher),
                watched,
            },
            ReceiverStream::new(rx),
        ))
    }

    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    pub fn stop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            for root in self.watched.drain(..) {
                let _ = watcher.unwatch(&root);
            }
            info!("File watcher stopped");
        }
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hand an event to the daemon without blocking the notify thread. A full
/// queue drops the event; the periodic scan still finds the path.
fn forward(tx: &mpsc::Sender<WatchEvent>, event: WatchEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!("Watch queue full, dropping event for {:?}", dropped.path);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Map a notify event onto the two kinds the daemon cares about.
fn convert_event(event: &Event) -> Option<WatchEvent> {
    let paths = &event.paths;
    let (path, kind, known_dir) = match &event.kind {
        EventKind::Create(create) => {
            let known_dir = match create {
                CreateKind::Folder => Some(true),
                CreateKind::File => Some(false),
                _ => None,
            };
            (paths.first()?, WatchKind::Created, known_dir)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            (paths.first()?, WatchKind::MovedTo, None)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            (paths.get(1)?, WatchKind::MovedTo, None)
        }
        // FSEvents reports both halves of a rename as `Any`; only the half
        // that still exists is the destination.
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            let path = paths.first()?;
            fs::symlink_metadata(path).ok()?;
            (path, WatchKind::MovedTo, None)
        }
        _ => return None,
    };

    Some(WatchEvent {
        path: path.clone(),
        is_dir: known_dir.unwrap_or_else(|| is_real_dir(path)),
        kind,
    })
}

fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}
