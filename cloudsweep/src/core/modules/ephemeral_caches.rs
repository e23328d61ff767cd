use std::fs;
use std::path::{Path, PathBuf};

use crate::core::config::SweepConfig;
use crate::core::detection_engine::{CleanupModule, DetectedArtifact};
use crate::core::nosync::{Classifier, DirClass, NOSYNC_SUFFIX};
use crate::core::walk::{Visit, walk_tree};

/// Finds regenerable cache and build-output directories
pub struct EphemeralCachesModule {
    classifier: Classifier,
    roots: Vec<PathBuf>,
}

impl EphemeralCachesModule {
    pub const NAME: &'static str = "ephemeral_caches";

    pub fn new(config: &SweepConfig) -> Self {
        Self {
            classifier: Classifier::from_config(&config.nosync),
            roots: config.watch_directories.clone(),
        }
    }
}

impl CleanupModule for EphemeralCachesModule {
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
        let is_real_dir = fs::symlink_metadata(path).map(|m| m.is_dir()).unwrap_or(false);
        if !is_real_dir {
            return None;
        }
        let name = path.file_name()?.to_str()?;
        if self.classifier.classify(name) != Some(DirClass::Ephemeral) {
            return None;
        }

        Some(DetectedArtifact {
            path: path.to_path_buf(),
            module: Self::NAME,
            reason: format!("ephemeral cache directory: {name}"),
            recovery_eligible: false,
        })
    }

    /// Nested caches are not reported once their parent is: a flagged
    /// directory's subtree is never walked, and neither are `.nosync` or
    /// valuable dependency trees.
    fn scan_directory(&self, directory: &Path) -> Vec<DetectedArtifact> {
        let mut detected = Vec::new();
        walk_tree(directory, |entry| {
            if !entry.file_type().is_dir() {
                return Visit::Continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                return Visit::Continue;
            };
            if name.ends_with(NOSYNC_SUFFIX) {
                return Visit::SkipSubtree;
            }
            match self.classifier.classify(name) {
                Some(DirClass::Ephemeral) => {
                    if let Some(artifact) = self.is_target(entry.path()) {
                        detected.push(artifact);
                    }
                    Visit::SkipSubtree
                }
                Some(DirClass::Valuable) => Visit::SkipSubtree,
                None => Visit::Continue,
            }
        });
        detected
    }
}
