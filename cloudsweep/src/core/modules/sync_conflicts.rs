use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::core::config::{ConfigError, SweepConfig};
use crate::core::detection_engine::{CleanupModule, DetectedArtifact};
use crate::core::nosync::NOSYNC_SUFFIX;
use crate::core::walk::{Visit, walk_tree};

/// A file name the sync service produced for a divergent copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDescriptor {
    pub path: PathBuf,
    pub original_name: String,
    pub ordinal: u32,
    pub extension: Option<String>,
}

impl ConflictDescriptor {
    /// The file this one is a conflict copy of
    pub fn original_path(&self) -> PathBuf {
        let file_name = match &self.extension {
            Some(ext) => format!("{}{}", self.original_name, ext),
            None => self.original_name.clone(),
        };
        self.path
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(file_name)
    }
}

/// Finds "name 2.ext" copies whose original still exists
pub struct SyncConflictsModule {
    pattern: Regex,
    roots: Vec<PathBuf>,
}

impl SyncConflictsModule {
    pub const NAME: &'static str = "sync_conflicts";

    pub fn new(config: &SweepConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            pattern: Regex::new(&config.conflict_pattern)?,
            roots: config.watch_directories.clone(),
        })
    }

    /// Parse a conflict name without touching the filesystem.
    pub fn parse_name(&self, path: &Path) -> Option<ConflictDescriptor> {
        let name = path.file_name()?.to_str()?;
        let caps = self.pattern.captures(name)?;

        let original_name = caps.get(1)?.as_str().trim_end().to_string();
        let ordinal: u32 = caps.get(2)?.as_str().parse().ok()?;
        // "Chapter 1.pdf" is a name, not a conflict; copies start at 2.
        if original_name.is_empty() || ordinal < 2 {
            return None;
        }
        let extension = caps.get(3).map(|m| m.as_str().to_string());

        Some(ConflictDescriptor {
            path: path.to_path_buf(),
            original_name,
            ordinal,
            extension,
        })
    }

    /// Match a regular file against the conflict pattern.
    pub fn match_conflict(&self, path: &Path) -> Option<ConflictDescriptor> {
        let is_file = fs::symlink_metadata(path)
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !is_file {
            return None;
        }
        self.parse_name(path)
    }
}

impl CleanupModule for SyncConflictsModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn supports_live_watch(&self) -> bool {
        true
    }

    fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn is_target(&self, path: &Path) -> Option<DetectedArtifact> {
        let conflict = self.match_conflict(path)?;
        let original = conflict.original_path();
        if !original.exists() {
            return None;
        }

        let original_name = original
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Some(DetectedArtifact {
            path: path.to_path_buf(),
            module: Self::NAME,
            reason: format!("conflict #{} of {}", conflict.ordinal, original_name),
            recovery_eligible: true,
        })
    }

    fn scan_directory(&self, directory: &Path) -> Vec<DetectedArtifact> {
        let mut detected = Vec::new();
        walk_tree(directory, |entry| {
            let file_type = entry.file_type();
            if file_type.is_dir() {
                let opaque = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.ends_with(NOSYNC_SUFFIX));
                return if opaque { Visit::SkipSubtree } else { Visit::Continue };
            }
            if file_type.is_file() {
                if let Some(artifact) = self.is_target(entry.path()) {
                    detected.push(artifact);
                }
            }
            Visit::Continue
        });
        detected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(root: &Path) -> SyncConflictsModule {
        let config = SweepConfig {
            watch_directories: vec![root.to_path_buf()],
            ..SweepConfig::default()
        };
        SyncConflictsModule::new(&config).unwrap()
    }

    #[test]
    fn test_parse_name() {
        let module = module(Path::new("/tmp"));

        let conflict = module.parse_name(Path::new("/docs/report 2.pdf")).unwrap();
        assert_eq!(conflict.original_name, "report");
        assert_eq!(conflict.ordinal, 2);
        assert_eq!(conflict.extension.as_deref(), Some(".pdf"));
        assert_eq!(conflict.original_path(), PathBuf::from("/docs/report.pdf"));

        let conflict = module.parse_name(Path::new("/docs/Makefile 3")).unwrap();
        assert_eq!(conflict.extension, None);
        assert_eq!(conflict.original_path(), PathBuf::from("/docs/Makefile"));

        let conflict = module.parse_name(Path::new("/docs/my notes  12.txt")).unwrap();
        assert_eq!(conflict.original_name, "my notes");
        assert_eq!(conflict.ordinal, 12);
        assert_eq!(conflict.original_path(), PathBuf::from("/docs/my notes.txt"));
    }

    #[test]
    fn test_parse_name_rejects_non_conflicts() {
        let module = module(Path::new("/tmp"));
        assert!(module.parse_name(Path::new("report.pdf")).is_none());
        assert!(module.parse_name(Path::new("report2.pdf")).is_none());
        assert!(module.parse_name(Path::new("Chapter 1.pdf")).is_none());
    }

    #[test]
    fn test_target_requires_original() {
        let dir = tempfile::tempdir().unwrap();
        let module = module(dir.path());
        let conflict = dir.path().join("report 2.pdf");
        std::fs::write(&conflict, b"edit").unwrap();

        assert!(module.is_target(&conflict).is_none());

        std::fs::write(dir.path().join("report.pdf"), b"orig").unwrap();
        let artifact = module.is_target(&conflict).unwrap();
        assert_eq!(artifact.module, "sync_conflicts");
        assert_eq!(artifact.reason, "conflict #2 of report.pdf");
        assert!(artifact.recovery_eligible);
    }

    #[test]
    fn test_directories_are_not_targets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("photos")).unwrap();
        std::fs::create_dir(dir.path().join("photos 2")).unwrap();
        assert!(module(dir.path()).is_target(&dir.path().join("photos 2")).is_none());
    }

    #[test]
    fn test_scan_all_surfaces_only_conflicts_with_originals() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        for name in ["a.txt", "a 2.txt", "a 3.txt", "orphan 2.txt"] {
            std::fs::write(sub.join(name), b"x").unwrap();
        }
        let hidden = dir.path().join("venv.nosync");
        std::fs::create_dir(&hidden).unwrap();
        std::fs::write(hidden.join("b.txt"), b"x").unwrap();
        std::fs::write(hidden.join("b 2.txt"), b"x").unwrap();

        let module = module(dir.path());
        let found: Vec<PathBuf> = module.scan_all().into_iter().map(|a| a.path).collect();

        assert_eq!(found, vec![sub.join("a 2.txt"), sub.join("a 3.txt")]);
        for path in &found {
            let conflict = module.parse_name(path).unwrap();
            assert!(conflict.original_path().exists());
        }
    }
}
