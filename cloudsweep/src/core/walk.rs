/*!
Pruned directory traversal shared by the detectors and the nosync guardian
*/

use std::io;
use std::path::Path;

use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// "Resource deadlock avoided", raised by the iCloud file provider while an
/// item is being materialized or uploaded.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
const EDEADLK: i32 = 11;
#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
)))]
const EDEADLK: i32 = 35;

/// What the walker should do after visiting an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    /// Do not descend into this directory
    SkipSubtree,
}

/// True for the transient lock the sync layer reports on busy items.
pub fn is_transient_lock(err: &io::Error) -> bool {
    err.raw_os_error() == Some(EDEADLK)
}

/// The transient lock as an `io::Error`, for callers that need to construct one.
pub fn transient_lock_error() -> io::Error {
    io::Error::from_raw_os_error(EDEADLK)
}

/// Walk everything below `root` without following symlinks.
///
/// Entries are visited in file-name order. Unreadable entries are logged and
/// skipped; the walk never aborts because of a single bad entry.
pub fn walk_tree<F>(root: &Path, mut visit: F)
where
    F: FnMut(&DirEntry) -> Visit,
{
    let mut entries = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(next) = entries.next() {
        match next {
            Ok(entry) => {
                if visit(&entry) == Visit::SkipSubtree && entry.file_type().is_dir() {
                    entries.skip_current_dir();
                }
            }
            Err(err) => log_walk_error(root, &err),
        }
    }
}

fn log_walk_error(root: &Path, err: &walkdir::Error) {
    let path = err.path().unwrap_or(root);
    match err.io_error() {
        Some(io_err) if is_transient_lock(io_err) => {
            warn!("Skipping {:?}: temporarily locked by the sync service", path);
        }
        Some(io_err) if io_err.kind() == io::ErrorKind::PermissionDenied => {
            debug!("Permission denied while scanning: {:?}", path);
        }
        _ => warn!("Skipping {:?}: {}", path, err),
    }
}
