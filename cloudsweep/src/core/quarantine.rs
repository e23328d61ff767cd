/*!
Quarantine engine: moves recoverable artifacts into dated buckets, deletes the
rest, and expires old buckets under a retention policy
*/

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core::config::RecoveryConfig;
use crate::core::detection_engine::DetectedArtifact;
use crate::core::walk::is_transient_lock;

const BUCKET_FORMAT: &str = "%Y-%m-%d";
const PARENT_HASH_LEN: usize = 6;

/// System locations that are never touched unless they resolve into the
/// user's home directory
const PROTECTED_ROOTS: &[&str] = &[
    "/",
    "/System",
    "/Applications",
    "/Library",
    "/usr",
    "/bin",
    "/sbin",
    "/var",
    "/private",
];

#[derive(Debug, Error)]
pub enum QuarantineError {
    #[error("quarantine entry not found: {0}")]
    NotFound(PathBuf),
    #[error("only files can be restored: {0}")]
    NotAFile(PathBuf),
    #[error("failed to restore {path}: {source}")]
    Io {
        path: PathBuf,
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupAction {
    Deleted,
    Recovered,
    Skipped,
    Error,
}

/// What happened to one artifact
#[derive(Debug, Clone, Serialize)]
pub struct RemovalOutcome {
    pub path: PathBuf,
    pub action: CleanupAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The failure was the transient "resource deadlock avoided" lock
    #[serde(skip)]
    pub transient: bool,
}

impl RemovalOutcome {
    pub fn deleted(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            action: CleanupAction::Deleted,
            recovery_path: None,
            error: None,
            transient: false,
        }
    }

    pub fn recovered(path: &Path, recovery_path: PathBuf) -> Self {
        Self {
            recovery_path: Some(recovery_path),
            action: CleanupAction::Recovered,
            ..Self::deleted(path)
        }
    }

    pub fn skipped(path: &Path, reason: impl Into<String>) -> Self {
        Self {
            action: CleanupAction::Skipped,
            error: Some(reason.into()),
            ..Self::deleted(path)
        }
    }

    pub fn failed(path: &Path, err: &io::Error) -> Self {
        let message = if err.kind() == io::ErrorKind::PermissionDenied {
            format!("permission denied: {err}")
        } else {
            err.to_string()
        };
        Self {
            action: CleanupAction::Error,
            error: Some(message),
            transient: is_transient_lock(err),
            ..Self::deleted(path)
        }
    }

    pub fn success(&self) -> bool {
        matches!(self.action, CleanupAction::Deleted | CleanupAction::Recovered)
    }
}

/// A file sitting in a quarantine bucket
#[derive(Debug, Clone, Serialize)]
pub struct QuarantineEntry {
    pub path: PathBuf,
    pub date: NaiveDate,
    /// File name with the parent-hash prefix removed
    pub original_name: String,
}

/// What `remove_artifact` would do, decided without touching anything
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedKind {
    MoveToQuarantine,
    Delete,
    Skip,
}

/// The removal seam used by the daemon pipeline
pub trait ArtifactRemover: Send + Sync {
    fn remove_artifact(&self, artifact: &DetectedArtifact) -> RemovalOutcome;

    fn plan(&self, artifact: &DetectedArtifact) -> PlannedKind {
        if artifact.recovery_eligible {
            PlannedKind::MoveToQuarantine
        } else {
            PlannedKind::Delete
        }
    }

    /// Drop expired buckets, returning how many went
    fn sweep_expired(&self) -> usize;
}

pub struct QuarantineEngine {
    enabled: bool,
    root: PathBuf,
    retention_days: u32,
    restore_dir: PathBuf,
    home: Option<PathBuf>,
}

impl QuarantineEngine {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            enabled: config.enabled,
            root: config.directory.clone(),
            retention_days: config.retention_days,
            restore_dir: config.restore_directory.clone(),
            home: dirs::home_dir().map(|home| resolve(&home)),
        }
    }

    /// Use `home` instead of the user's home directory for the protected-path
    /// override.
    pub fn with_home_dir(mut self, home: impl AsRef<Path>) -> Self {
        self.home = Some(resolve(home.as_ref()));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_path_protected(&self, path: &Path) -> bool {
        let resolved = resolve(path);
        let under_protected = PROTECTED_ROOTS.iter().map(Path::new).any(|root| {
            if root.parent().is_none() {
                resolved == root
            } else {
                resolved.starts_with(root)
            }
        });
        if !under_protected {
            return false;
        }
        !self
            .home
            .as_ref()
            .is_some_and(|home| resolved.starts_with(home))
    }

    /// Unused destination for `path` inside the bucket for `today`.
    pub fn quarantine_path_for(&self, path: &Path, today: NaiveDate) -> PathBuf {
        let bucket = self.root.join(today.format(BUCKET_FORMAT).to_string());
        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        let hash = parent_hash(parent);

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let candidate = bucket.join(format!("{hash}_{name}"));
        if fs::symlink_metadata(&candidate).is_err() {
            return candidate;
        }

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let mut counter = 1u32;
        loop {
            let candidate = bucket.join(format!("{hash}_{stem}_{counter}{ext}"));
            if fs::symlink_metadata(&candidate).is_err() {
                return candidate;
            }
            counter += 1;
        }
    }

    pub fn remove_artifact_on(
        &self,
        artifact: &DetectedArtifact,
        today: NaiveDate,
    ) -> RemovalOutcome {
        let path = artifact.path.as_path();
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(_) => return RemovalOutcome::skipped(path, "no longer exists"),
        };

        if self.is_path_protected(path) {
            warn!("Refusing to touch protected path: {:?}", path);
            return RemovalOutcome::skipped(path, "path is in a protected directory");
        }

        if artifact.recovery_eligible && self.enabled {
            let destination = self.quarantine_path_for(path, today);
            return match self.move_into_bucket(path, &destination) {
                Ok(()) => {
                    info!("Quarantined {:?} -> {:?}", path, destination);
                    RemovalOutcome::recovered(path, destination)
                }
                Err(e) => {
                    error!("Failed to quarantine {:?}: {}", path, e);
                    RemovalOutcome::failed(path, &e)
                }
            };
        }

        let removed = if meta.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        match removed {
            Ok(()) => {
                info!("Deleted {} ({}): {:?}", artifact.module, artifact.reason, path);
                RemovalOutcome::deleted(path)
            }
            Err(e) => {
                error!("Failed to delete {:?}: {}", path, e);
                RemovalOutcome::failed(path, &e)
            }
        }
    }

    fn move_into_bucket(&self, path: &Path, destination: &Path) -> io::Result<()> {
        if let Some(bucket) = destination.parent() {
            fs::create_dir_all(bucket)?;
        }
        match fs::rename(path, destination) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices && path.is_file() => {
                debug!("Cross-device move, copying {:?}", path);
                fs::copy(path, destination)?;
                fs::remove_file(path)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove every bucket at least `retention_days` older than `today`.
    pub fn sweep_expired_at(&self, today: NaiveDate) -> usize {
        if !self.enabled {
            return 0;
        }
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Quarantine root unavailable {:?}: {}", self.root, e);
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let Some(date) = bucket_date(&entry) else {
                continue;
            };
            if (today - date).num_days() < i64::from(self.retention_days) {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => {
                    info!("Removed expired quarantine bucket {}", date);
                    removed += 1;
                }
                Err(e) => error!("Failed to remove bucket {:?}: {}", entry.path(), e),
            }
        }
        removed
    }

    /// Copy a quarantined file back out, returning where it landed.
    pub fn restore(
        &self,
        entry: &Path,
        destination: Option<&Path>,
    ) -> Result<PathBuf, QuarantineError> {
        let meta = fs::metadata(entry).map_err(|_| QuarantineError::NotFound(entry.to_path_buf()))?;
        if !meta.is_file() {
            return Err(QuarantineError::NotAFile(entry.to_path_buf()));
        }

        let original_name = strip_hash_prefix(entry);
        let target = match destination {
            Some(dest) if dest.is_dir() => dest.join(&original_name),
            Some(dest) => dest.to_path_buf(),
            None => self.restore_dir.join(&original_name),
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| QuarantineError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::copy(entry, &target).map_err(|source| QuarantineError::Io {
            path: target.clone(),
            source,
        })?;

        info!("Restored {:?} -> {:?}", entry, target);
        Ok(target)
    }

    /// Quarantined files, newest bucket first.
    pub fn list_entries(&self) -> Vec<QuarantineEntry> {
        let Ok(buckets) = fs::read_dir(&self.root) else {
            return Vec::new();
        };

        let mut entries = Vec::new();
        for bucket in buckets.flatten() {
            let Some(date) = bucket_date(&bucket) else {
                continue;
            };
            let Ok(files) = fs::read_dir(bucket.path()) else {
                continue;
            };
            for file in files.flatten() {
                if !file.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    continue;
                }
                let path = file.path();
                entries.push(QuarantineEntry {
                    original_name: strip_hash_prefix(&path),
                    path,
                    date,
                });
            }
        }

        entries.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.path.cmp(&b.path)));
        entries
    }
}

impl ArtifactRemover for QuarantineEngine {
    fn remove_artifact(&self, artifact: &DetectedArtifact) -> RemovalOutcome {
        self.remove_artifact_on(artifact, Utc::now().date_naive())
    }

    fn plan(&self, artifact: &DetectedArtifact) -> PlannedKind {
        if self.is_path_protected(&artifact.path) {
            PlannedKind::Skip
        } else if artifact.recovery_eligible && self.enabled {
            PlannedKind::MoveToQuarantine
        } else {
            PlannedKind::Delete
        }
    }

    fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now().date_naive())
    }
}

fn resolve(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn parent_hash(parent: &Path) -> String {
    let digest = blake3::hash(parent.to_string_lossy().as_bytes()).to_hex();
    digest.as_str()[..PARENT_HASH_LEN].to_string()
}

fn bucket_date(entry: &fs::DirEntry) -> Option<NaiveDate> {
    if !entry.file_type().ok()?.is_dir() {
        return None;
    }
    let name = entry.file_name();
    NaiveDate::parse_from_str(name.to_str()?, BUCKET_FORMAT).ok()
}

fn strip_hash_prefix(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.split_once('_') {
        Some((_, rest)) if !rest.is_empty() => rest.to_string(),
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Days;

    fn engine(dir: &Path) -> QuarantineEngine {
        QuarantineEngine::new(&RecoveryConfig {
            enabled: true,
            directory: dir.join("trash"),
            retention_days: 7,
            restore_directory: dir.join("restored"),
        })
        .with_home_dir(dir)
    }

    fn artifact(path: &Path, recovery_eligible: bool) -> DetectedArtifact {
        DetectedArtifact {
            path: path.to_path_buf(),
            module: "test",
            reason: "test".into(),
            recovery_eligible,
        }
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, BUCKET_FORMAT).unwrap()
    }

    #[test]
    fn test_quarantine_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let file = dir.path().join("report 2.pdf");
        let bytes: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        fs::write(&file, &bytes).unwrap();

        let outcome = engine.remove_artifact_on(&artifact(&file, true), day("2026-03-01"));

        assert_eq!(outcome.action, CleanupAction::Recovered);
        assert!(!file.exists());
        let stored = outcome.recovery_path.unwrap();
        assert!(stored.starts_with(dir.path().join("trash/2026-03-01")));

        let restored = engine.restore(&stored, None).unwrap();
        assert_eq!(restored, dir.path().join("restored/report 2.pdf"));
        assert_eq!(fs::read(restored).unwrap(), bytes);
    }

    #[test]
    fn test_same_name_different_parents() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let today = day("2026-03-01");
        let mut stored = Vec::new();
        for parent in ["a", "b"] {
            let file = dir.path().join(parent).join("notes 2.txt");
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(&file, parent).unwrap();
            let outcome = engine.remove_artifact_on(&artifact(&file, true), today);
            stored.push(outcome.recovery_path.unwrap());
        }
        assert_ne!(stored[0], stored[1]);
        assert_eq!(fs::read_to_string(&stored[0]).unwrap(), "a");
        assert_eq!(fs::read_to_string(&stored[1]).unwrap(), "b");
    }

    #[test]
    fn test_collision_in_bucket_gets_counter() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let today = day("2026-03-01");
        let file = dir.path().join("notes 2.txt");

        fs::write(&file, b"first").unwrap();
        let first = engine.remove_artifact_on(&artifact(&file, true), today).recovery_path.unwrap();
        fs::write(&file, b"second").unwrap();
        let second = engine
            .remove_artifact_on(&artifact(&file, true), today)
            .recovery_path
            .unwrap();

        let hash = parent_hash(dir.path());
        assert_eq!(first.file_name().unwrap().to_str().unwrap(), format!("{hash}_notes 2.txt"));
        assert_eq!(second.file_name().unwrap().to_str().unwrap(), format!("{hash}_notes 2_1.txt"));
        assert_eq!(fs::read(second).unwrap(), b"second");
    }

    #[test]
    fn test_non_recoverable_directory_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let cache = dir.path().join("build");
        fs::create_dir_all(cache.join("lib/__pycache__")).unwrap();
        fs::write(cache.join("lib/x.o"), b"x").unwrap();

        let outcome = engine.remove_artifact_on(&artifact(&cache, false), day("2026-03-01"));

        assert_eq!(outcome.action, CleanupAction::Deleted);
        assert!(outcome.recovery_path.is_none());
        assert!(!cache.exists());
    }

    #[test]
    fn test_recovery_disabled_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        engine.enabled = false;
        let file = dir.path().join("a 2.txt");
        fs::write(&file, b"x").unwrap();

        let outcome = engine.remove_artifact_on(&artifact(&file, true), day("2026-03-01"));

        assert_eq!(outcome.action, CleanupAction::Deleted);
        assert!(!dir.path().join("trash").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_removed_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let target = dir.path().join("real");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("keep"), b"x").unwrap();
        let link = dir.path().join("dist");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let outcome = engine.remove_artifact_on(&artifact(&link, false), day("2026-03-01"));

        assert_eq!(outcome.action, CleanupAction::Deleted);
        assert!(fs::symlink_metadata(&link).is_err());
        assert!(target.join("keep").exists());
    }

    #[test]
    fn test_missing_path_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = engine(dir.path())
            .remove_artifact_on(&artifact(&dir.path().join("gone"), true), day("2026-03-01"));
        assert_eq!(outcome.action, CleanupAction::Skipped);
        assert!(!outcome.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_protected_paths() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        assert!(engine.is_path_protected(Path::new("/")));
        assert!(engine.is_path_protected(Path::new("/usr/lib/something")));
        assert!(engine.is_path_protected(Path::new("/Library/Caches")));
        assert!(!engine.is_path_protected(Path::new("/opt/project/build")));
        assert!(!engine.is_path_protected(&dir.path().join("x")));

        let outcome =
            engine.remove_artifact_on(&artifact(Path::new("/bin/sh"), false), day("2026-03-01"));
        assert_eq!(outcome.action, CleanupAction::Skipped);
        assert!(Path::new("/bin/sh").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_plan_matches_removal() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let conflict = dir.path().join("notes 2.txt");

        assert_eq!(engine.plan(&artifact(Path::new("/usr/lib/build"), false)), PlannedKind::Skip);
        assert_eq!(engine.plan(&artifact(Path::new("/bin/sh 2"), true)), PlannedKind::Skip);
        assert_eq!(engine.plan(&artifact(&conflict, true)), PlannedKind::MoveToQuarantine);
        assert_eq!(engine.plan(&artifact(&dir.path().join("build"), false)), PlannedKind::Delete);

        let disabled = QuarantineEngine::new(&RecoveryConfig {
            enabled: false,
            ..RecoveryConfig::default()
        })
        .with_home_dir(dir.path());
        assert_eq!(disabled.plan(&artifact(&conflict, true)), PlannedKind::Delete);
    }

    #[cfg(unix)]
    #[test]
    fn test_home_inside_protected_root_is_allowed() {
        let engine = QuarantineEngine::new(&RecoveryConfig::default())
            .with_home_dir("/usr/local/nobody-home");
        assert!(!engine.is_path_protected(Path::new("/usr/local/nobody-home/build")));
        assert!(engine.is_path_protected(Path::new("/usr/local/other")));
    }

    #[test]
    fn test_retention_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let today = day("2026-03-10");
        let root = dir.path().join("trash");

        let expired = today.checked_sub_days(Days::new(7)).unwrap();
        let kept = today.checked_sub_days(Days::new(6)).unwrap();
        for date in [expired, kept] {
            let bucket = root.join(date.format(BUCKET_FORMAT).to_string());
            fs::create_dir_all(&bucket).unwrap();
            fs::write(bucket.join("abc123_x.txt"), b"x").unwrap();
        }
        fs::create_dir_all(root.join("notes")).unwrap();

        assert_eq!(engine.sweep_expired_at(today), 1);
        assert!(!root.join("2026-03-03").exists());
        assert!(root.join("2026-03-04").exists());
        assert!(root.join("notes").exists());
    }

    #[test]
    fn test_sweep_without_root() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(engine(dir.path()).sweep_expired_at(day("2026-03-10")), 0);
    }

    #[test]
    fn test_list_entries_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        for (date, name) in [("2026-03-01", "a 2.txt"), ("2026-03-05", "b 2.txt")] {
            let file = dir.path().join(name);
            fs::write(&file, b"x").unwrap();
            engine.remove_artifact_on(&artifact(&file, true), day(date));
        }

        let entries = engine.list_entries();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].date, day("2026-03-05"));
        assert_eq!(entries[0].original_name, "b 2.txt");
        assert_eq!(entries[1].original_name, "a 2.txt");
    }

    #[test]
    fn test_restore_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let file = dir.path().join("a 2.txt");
        fs::write(&file, b"body").unwrap();
        let stored = engine
            .remove_artifact_on(&artifact(&file, true), day("2026-03-01"))
            .recovery_path
            .unwrap();
        let dest = dir.path().join("out");
        fs::create_dir(&dest).unwrap();

        let restored = engine.restore(&stored, Some(&dest)).unwrap();

        assert_eq!(restored, dest.join("a 2.txt"));
        assert!(matches!(
            engine.restore(&dir.path().join("nope"), None),
            Err(QuarantineError::NotFound(_))
        ));
    }
}
