/*!
Plugin-based detection engine for identifying artifacts that should be cleaned
*/

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::core::config::{ConfigError, SweepConfig};
use crate::core::modules::{EphemeralCachesModule, ParallelArtifactsModule, SyncConflictsModule};

/// A path a module wants cleaned, with provenance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedArtifact {
    pub path: PathBuf,
    /// Name of the module that found it
    pub module: &'static str,
    pub reason: String,
    /// Move to quarantine instead of deleting outright
    pub recovery_eligible: bool,
}

/// Trait for artifact detection strategies
pub trait CleanupModule: Send + Sync {
    /// Name of the module, as used in `modules_disabled`
    fn name(&self) -> &'static str;

    /// Whether the registry loads this module unless told otherwise
    fn enabled_by_default(&self) -> bool {
        true
    }

    /// Whether `is_target` is cheap and reliable enough for live events
    fn supports_live_watch(&self) -> bool;

    /// Roots walked by `scan_all`
    fn roots(&self) -> &[PathBuf];

    /// Check a single path
    fn is_target(&self, path: &Path) -> Option<DetectedArtifact>;

    /// Walk one directory tree
    fn scan_directory(&self, directory: &Path) -> Vec<DetectedArtifact>;

    /// Walk every configured root
    fn scan_all(&self) -> Vec<DetectedArtifact> {
        self.roots()
            .iter()
            .flat_map(|root| self.scan_directory(root))
            .collect()
    }
}

/// Names of the compiled-in modules, in registry order
pub const BUILTIN_MODULE_NAMES: &[&str] = &[
    SyncConflictsModule::NAME,
    ParallelArtifactsModule::NAME,
    EphemeralCachesModule::NAME,
];

/// The enabled detection modules, in a fixed order
#[derive(Clone)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn CleanupModule>>,
}

impl ModuleRegistry {
    /// Instantiate every built-in module and drop the disabled ones.
    pub fn from_config(config: &SweepConfig) -> Result<Self, ConfigError> {
        let candidates: Vec<Arc<dyn CleanupModule>> = vec![
            Arc::new(SyncConflictsModule::new(config)?),
            Arc::new(ParallelArtifactsModule::new(config)),
            Arc::new(EphemeralCachesModule::new(config)),
        ];

        let modules = candidates
            .into_iter()
            .filter(|module| {
                if !module.enabled_by_default() {
                    debug!("Module not enabled by default: {}", module.name());
                    return false;
                }
                if config.modules_disabled.iter().any(|name| name == module.name()) {
                    info!("Module disabled by config: {}", module.name());
                    return false;
                }
                true
            })
            .collect::<Vec<_>>();

        info!(
            "Loaded {} cleanup modules: {}",
            modules.len(),
            modules.iter().map(|m| m.name()).collect::<Vec<_>>().join(", ")
        );
        Ok(Self { modules })
    }

    /// Build a registry from explicit modules.
    pub fn with_modules(modules: Vec<Arc<dyn CleanupModule>>) -> Self {
        Self { modules }
    }

    pub fn modules(&self) -> &[Arc<dyn CleanupModule>] {
        &self.modules
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// First live-watch module that claims `path`.
    pub fn detect_live(&self, path: &Path) -> Option<DetectedArtifact> {
        self.modules
            .iter()
            .filter(|m| m.supports_live_watch())
            .find_map(|m| m.is_target(path))
    }

    pub fn scan_all(&self) -> Vec<DetectedArtifact> {
        self.modules.iter().flat_map(|m| m.scan_all()).collect()
    }

    pub fn scan_directory(&self, directory: &Path) -> Vec<DetectedArtifact> {
        self.modules
            .iter()
            .flat_map(|m| m.scan_directory(directory))
            .collect()
    }
}
