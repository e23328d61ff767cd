use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::core::config::SweepConfig;
use crate::core::detection_engine::{CleanupModule, DetectedArtifact};
use crate::core::nosync::NOSYNC_SUFFIX;
use crate::core::walk::{Visit, walk_tree};

/// `.<tool>.<host>.pid<N>.<hash>`, e.g. `.coverage.laptop.pid4242.Xz81a`
static FRAGMENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\.([A-Za-z0-9_-]+)\..+\.pid\d+\..+$").expect("fragment pattern is valid")
});

const SKIP_DIRS: &[&str] = &[".git", ".venv", "venv", "node_modules", ".tox", "__pycache__"];

/// Finds per-process fragments of a parallel test or coverage run that have
/// already been merged into the summary file beside them
pub struct ParallelArtifactsModule {
    roots: Vec<PathBuf>,
}

impl ParallelArtifactsModule {
    pub const NAME: &'static str = "parallel_artifacts";

    pub fn new(config: &SweepConfig) -> Self {
        Self {
            roots: config.watch_directories.clone(),
        }
    }

    /// Name of the tool that wrote `name`, if it is a fragment.
    fn fragment_tool(name: &str) -> Option<&str> {
        FRAGMENT_PATTERN
            .captures(name)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }
}

impl CleanupModule for ParallelArtifactsModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn supports_live_watch(&self) -> bool {
        false
    }

    fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn is_target(&self, path: &Path) -> Option<DetectedArtifact> {
        let is_file = fs::symlink_metadata(path).map(|m| m.is_file()).unwrap_or(false);
        if !is_file {
            return None;
        }
        let name = path.file_name()?.to_str()?;
        let tool = Self::fragment_tool(name)?;

        let merged = path.parent()?.join(format!(".{tool}"));
        if !merged.is_file() {
            return None;
        }

        Some(DetectedArtifact {
            path: path.to_path_buf(),
            module: Self::NAME,
            reason: format!("stale {tool} fragment (merged .{tool} exists)"),
            recovery_eligible: false,
        })
    }

    fn scan_directory(&self, directory: &Path) -> Vec<DetectedArtifact> {
        let mut detected = Vec::new();
        walk_tree(directory, |entry| {
            let Some(name) = entry.file_name().to_str() else {
                return Visit::Continue;
            };
            if entry.file_type().is_dir() {
                if SKIP_DIRS.contains(&name) || name.ends_with(NOSYNC_SUFFIX) {
                    return Visit::SkipSubtree;
                }
                return Visit::Continue;
            }
            if name.starts_with('.') {
                if let Some(artifact) = self.is_target(entry.path()) {
                    detected.push(artifact);
                }
            }
            Visit::Continue
        });
        detected
    }
}
