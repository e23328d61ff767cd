/*!
Nosync conversion and the redirect-symlink guardian.

A directory that is expensive to rebuild but pointless to sync (a virtualenv,
`node_modules`) is renamed to `<name>.nosync`, which the sync service skips,
and a `<name>` symlink is left behind so tools still find it. The sync service
occasionally "resolves" that symlink into a conflict copy such as
`<name> 2`, or drops it entirely; the guardian puts things back.
*/

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::core::config::{NosyncConfig, SweepConfig};
use crate::core::walk::{Visit, walk_tree};

pub const NOSYNC_SUFFIX: &str = ".nosync";

/// Slow to rebuild: converted to `.nosync`, never deleted
pub const VALUABLE_PATTERNS: &[&str] = &[".venv", "venv", "node_modules", ".env"];

/// Fast to regenerate: deleted outright
pub const EPHEMERAL_PATTERNS: &[&str] = &[
    ".mypy_cache",
    ".ruff_cache",
    ".pytest_cache",
    "__pycache__",
    ".tox",
    ".nox",
    "*.egg-info",
    ".eggs",
    ".build",
    "build",
    "dist",
    ".cache",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DirClass {
    Valuable,
    Ephemeral,
}

/// Directory-name patterns: exact names plus `*suffix` wildcards
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    exact: HashSet<String>,
    suffixes: Vec<String>,
}

impl PatternSet {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for pattern in patterns {
            set.insert(pattern.as_ref());
        }
        set
    }

    fn insert(&mut self, pattern: &str) {
        match pattern.strip_prefix('*') {
            Some(suffix) if !suffix.is_empty() => self.suffixes.push(suffix.to_string()),
            Some(_) => warn!("Ignoring bare wildcard pattern"),
            None => {
                self.exact.insert(pattern.to_string());
            }
        }
    }

    fn contains_pattern(&self, pattern: &str) -> bool {
        match pattern.strip_prefix('*') {
            Some(suffix) => self.suffixes.iter().any(|s| s == suffix),
            None => self.exact.contains(pattern),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.exact.contains(name)
            || self
                .suffixes
                .iter()
                .any(|suffix| name.ends_with(suffix.as_str()))
    }
}

/// Sorts directory names into valuable and ephemeral
#[derive(Debug, Clone)]
pub struct Classifier {
    valuable: PatternSet,
    ephemeral: PatternSet,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(&[], &[])
    }
}

impl Classifier {
    pub fn new(extra_valuable: &[String], extra_ephemeral: &[String]) -> Self {
        let valuable = PatternSet::new(
            VALUABLE_PATTERNS
                .iter()
                .copied()
                .chain(extra_valuable.iter().map(String::as_str)),
        );

        // The two sets stay disjoint; a name claimed by both is valuable.
        let mut ephemeral = PatternSet::default();
        for pattern in EPHEMERAL_PATTERNS
            .iter()
            .copied()
            .chain(extra_ephemeral.iter().map(String::as_str))
        {
            if valuable.contains_pattern(pattern) {
                warn!("Pattern {:?} is both valuable and ephemeral; treating as valuable", pattern);
                continue;
            }
            ephemeral.insert(pattern);
        }

        Self { valuable, ephemeral }
    }

    pub fn from_config(config: &NosyncConfig) -> Self {
        Self::new(&config.valuable_patterns, &config.ephemeral_patterns)
    }

    /// Classify a directory name. Names already carrying `.nosync` are neither.
    pub fn classify(&self, name: &str) -> Option<DirClass> {
        if name.ends_with(NOSYNC_SUFFIX) {
            return None;
        }
        if self.valuable.matches(name) {
            Some(DirClass::Valuable)
        } else if self.ephemeral.matches(name) {
            Some(DirClass::Ephemeral)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvertAction {
    Converted,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvertOutcome {
    pub path: PathBuf,
    pub action: ConvertAction,
    pub nosync_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl ConvertOutcome {
    fn skipped(path: &Path, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            action: ConvertAction::Skipped,
            nosync_path: None,
            error: Some(reason.into()),
        }
    }

    fn failed(path: &Path, nosync_path: Option<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            action: ConvertAction::Error,
            nosync_path,
            error: Some(reason.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.action == ConvertAction::Converted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairAction {
    Repaired,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairResult {
    pub path: PathBuf,
    pub action: RepairAction,
    pub detail: String,
}

impl RepairResult {
    fn new(path: &Path, action: RepairAction, detail: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            action,
            detail: detail.into(),
        }
    }
}

/// Converts valuable directories to `.nosync` and keeps their symlinks healthy
pub struct NosyncGuardian {
    classifier: Classifier,
    roots: Vec<PathBuf>,
}

impl NosyncGuardian {
    pub fn new(config: &SweepConfig) -> Self {
        Self {
            classifier: Classifier::from_config(&config.nosync),
            roots: config.watch_directories.clone(),
        }
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// A real (non-symlink) directory whose name is valuable.
    pub fn is_candidate(&self, path: &Path) -> bool {
        let is_real_dir = fs::symlink_metadata(path)
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        is_real_dir && self.classify_path(path) == Some(DirClass::Valuable)
    }

    fn classify_path(&self, path: &Path) -> Option<DirClass> {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| self.classifier.classify(name))
    }

    /// Valuable directories under `directory` that still sync.
    pub fn scan_candidates(&self, directory: &Path) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
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
                Some(DirClass::Valuable) => {
                    candidates.push(entry.path().to_path_buf());
                    Visit::SkipSubtree
                }
                // Ephemeral directories are deleted by the cache module, not converted.
                Some(DirClass::Ephemeral) => Visit::SkipSubtree,
                None => Visit::Continue,
            }
        });
        candidates.sort();
        candidates
    }

    pub fn scan_all(&self) -> Vec<PathBuf> {
        self.roots
            .iter()
            .flat_map(|root| self.scan_candidates(root))
            .collect()
    }

    /// Rename `path` to `<name>.nosync` and leave a `<name>` symlink behind.
    pub fn convert(&self, path: &Path) -> ConvertOutcome {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return ConvertOutcome::skipped(path, "path does not exist");
            }
            Err(e) => return ConvertOutcome::failed(path, None, e.to_string()),
        };
        if meta.file_type().is_symlink() {
            return ConvertOutcome::skipped(path, "already a symlink");
        }
        if !meta.is_dir() {
            return ConvertOutcome::skipped(path, "not a directory");
        }

        let (Some(parent), Some(name)) = (path.parent(), path.file_name().and_then(|n| n.to_str()))
        else {
            return ConvertOutcome::skipped(path, "path has no usable name");
        };
        let nosync_name = format!("{name}{NOSYNC_SUFFIX}");
        let nosync_path = parent.join(&nosync_name);

        if fs::symlink_metadata(&nosync_path).is_ok() {
            return ConvertOutcome::skipped(path, format!("{nosync_name} already exists"));
        }

        if let Err(e) = fs::rename(path, &nosync_path) {
            error!("Failed to rename {:?} to {:?}: {}", path, nosync_path, e);
            return ConvertOutcome::failed(path, None, e.to_string());
        }

        if let Err(e) = create_dir_symlink(Path::new(&nosync_name), path) {
            error!("Renamed {:?} but could not create symlink: {}", path, e);
            return ConvertOutcome::failed(
                path,
                Some(nosync_path.clone()),
                format!("directory now lives at {}; symlink failed: {e}", nosync_path.display()),
            );
        }

        info!("Converted to nosync: {} -> {}", name, nosync_name);
        ConvertOutcome {
            path: path.to_path_buf(),
            action: ConvertAction::Converted,
            nosync_path: Some(nosync_path),
            error: None,
        }
    }

    /// Check every valuable `.nosync` directory directly inside `parent`.
    pub fn verify_and_repair(&self, parent: &Path) -> Vec<RepairResult> {
        let Ok(read_dir) = fs::read_dir(parent) else {
            return vec![];
        };

        let mut siblings: Vec<(String, fs::FileType)> = read_dir
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let file_type = entry.file_type().ok()?;
                Some((name, file_type))
            })
            .collect();
        siblings.sort_by(|a, b| a.0.cmp(&b.0));

        let mut results = Vec::new();
        for (name, file_type) in &siblings {
            if !file_type.is_dir() {
                continue;
            }
            let Some(base) = name.strip_suffix(NOSYNC_SUFFIX) else {
                continue;
            };
            if base.is_empty() || self.classifier.classify(base) != Some(DirClass::Valuable) {
                continue;
            }
            results.extend(self.repair_link(parent, base, &siblings));
        }
        results
    }

    fn repair_link(
        &self,
        parent: &Path,
        base: &str,
        siblings: &[(String, fs::FileType)],
    ) -> Vec<RepairResult> {
        let nosync_name = format!("{base}{NOSYNC_SUFFIX}");
        let nosync_path = parent.join(&nosync_name);
        let link = parent.join(base);
        let mut results = Vec::new();
        let mut notes = Vec::new();

        for (sibling, file_type) in siblings {
            if !file_type.is_symlink() || !is_conflict_duplicate(base, sibling) {
                continue;
            }
            let duplicate = parent.join(sibling);
            match fs::remove_file(&duplicate) {
                Ok(()) => {
                    info!("Removed conflict symlink {:?}", duplicate);
                    notes.push(format!("removed conflict symlink '{sibling}'"));
                }
                Err(e) => results.push(RepairResult::new(
                    &duplicate,
                    RepairAction::Error,
                    format!("could not remove conflict symlink: {e}"),
                )),
            }
        }

        match fs::symlink_metadata(&link) {
            Ok(meta) if meta.file_type().is_symlink() => match fs::read_link(&link) {
                Ok(target) if points_at(parent, &target, &nosync_name, &nosync_path) => {}
                Ok(target) => {
                    let replaced = fs::remove_file(&link)
                        .and_then(|()| create_dir_symlink(Path::new(&nosync_name), &link));
                    match replaced {
                        Ok(()) => {
                            info!("Re-pointed {:?} from {:?} to {}", link, target, nosync_name);
                            notes.push(format!(
                                "replaced symlink pointing at '{}'",
                                target.display()
                            ));
                        }
                        Err(e) => results.push(RepairResult::new(
                            &link,
                            RepairAction::Error,
                            format!("could not replace symlink: {e}"),
                        )),
                    }
                }
                Err(e) => results.push(RepairResult::new(
                    &link,
                    RepairAction::Error,
                    format!("could not read symlink: {e}"),
                )),
            },
            Ok(meta) => {
                let kind = if meta.is_dir() { "a real directory" } else { "a file" };
                warn!("{:?} is {} next to {}; leaving it alone", link, kind, nosync_name);
                results.push(RepairResult::new(
                    &link,
                    RepairAction::Warning,
                    format!("{kind} occupies '{base}' beside '{nosync_name}'; merge manually"),
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                match create_dir_symlink(Path::new(&nosync_name), &link) {
                    Ok(()) => {
                        info!("Created missing symlink {:?} -> {}", link, nosync_name);
                        notes.push(format!("created symlink '{base}' -> '{nosync_name}'"));
                    }
                    Err(e) => results.push(RepairResult::new(
                        &link,
                        RepairAction::Error,
                        format!("could not create symlink: {e}"),
                    )),
                }
            }
            Err(e) => results.push(RepairResult::new(&link, RepairAction::Error, e.to_string())),
        }

        if !notes.is_empty() {
            results.insert(0, RepairResult::new(&link, RepairAction::Repaired, notes.join("; ")));
        }
        results
    }

    /// Run `verify_and_repair` on `root` and every directory below it.
    pub fn repair_tree(&self, root: &Path) -> Vec<RepairResult> {
        let mut results = self.verify_and_repair(root);
        walk_tree(root, |entry| {
            if !entry.file_type().is_dir() {
                return Visit::Continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                return Visit::Continue;
            };
            if name.ends_with(NOSYNC_SUFFIX) || self.classifier.classify(name).is_some() {
                return Visit::SkipSubtree;
            }
            results.extend(self.verify_and_repair(entry.path()));
            Visit::Continue
        });
        results
    }

    pub fn repair_all(&self) -> Vec<RepairResult> {
        let results: Vec<RepairResult> = self
            .roots
            .iter()
            .flat_map(|root| self.repair_tree(root))
            .collect();
        debug!("Guardian pass finished with {} results", results.len());
        results
    }
}

/// `<base> <digits>`, the name a sync service gives a duplicated item.
fn is_conflict_duplicate(base: &str, name: &str) -> bool {
    name.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix(' '))
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

fn points_at(parent: &Path, target: &Path, nosync_name: &str, nosync_path: &Path) -> bool {
    target == Path::new(nosync_name) || parent.join(target) == nosync_path
}

#[cfg(unix)]
fn create_dir_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_dir_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}
