/*!
Configuration management for the sweep daemon
*/

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default conflict pattern: matches "name 2.ext", "name 3", etc.
pub const DEFAULT_CONFLICT_PATTERN: &str = r"^(.+)\s+(\d+)(\.[^.]+)?$";

const CONFIG_DIR_NAME: &str = "cloudsweep";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid conflict pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Directories to monitor
    pub watch_directories: Vec<PathBuf>,
    /// Regex matched against file names to find conflict copies
    pub conflict_pattern: String,
    /// Seconds a recovery-eligible artifact waits before it is touched
    pub wait_before_delete: u64,
    /// Seconds between sync-status polls
    pub sync_poll_interval: i64,
    /// Maximum seconds to wait for a file to finish syncing
    pub max_sync_wait: u64,
    /// Seconds between full scans
    pub scan_interval: i64,
    /// Seconds between quarantine expiry sweeps
    pub quarantine_sweep_interval: i64,
    /// Milliseconds the loop waits on the watch queue per iteration
    pub watch_poll_ms: u64,
    /// Capacity of the bounded watch event queue
    pub watch_queue_capacity: usize,
    /// Consecutive failures before a path enters cooldown
    pub max_delete_retries: u32,
    /// Seconds a path stays in cooldown
    pub retry_cooldown: u64,
    /// Module names that should not be loaded
    pub modules_disabled: Vec<String>,
    pub recovery: RecoveryConfig,
    pub nosync: NosyncConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Move recovery-eligible artifacts to quarantine instead of deleting
    pub enabled: bool,
    /// Quarantine root, split into YYYY-MM-DD buckets
    pub directory: PathBuf,
    /// Buckets older than this many days are removed
    pub retention_days: u32,
    /// Where `restore` puts files when no destination is given
    pub restore_directory: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NosyncConfig {
    /// Re-create broken redirect symlinks on every scan cycle
    pub auto_repair: bool,
    /// Extra directory names treated as valuable (converted, never deleted)
    pub valuable_patterns: Vec<String>,
    /// Extra directory names treated as ephemeral (deleted)
    pub ephemeral_patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Optional log file in addition to stderr
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// trace, debug, info, warn or error
    pub level: String,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            watch_directories: vec![],
            conflict_pattern: DEFAULT_CONFLICT_PATTERN.to_string(),
            wait_before_delete: 180,
            sync_poll_interval: 10,
            max_sync_wait: 300,
            scan_interval: 60,
            quarantine_sweep_interval: 3600,
            watch_poll_ms: 100,
            watch_queue_capacity: 1024,
            max_delete_retries: 3,
            retry_cooldown: 3600,
            modules_disabled: vec![],
            recovery: RecoveryConfig::default(),
            nosync: NosyncConfig {
                auto_repair: true,
                ..NosyncConfig::default()
            },
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        let home = home_dir();
        Self {
            enabled: true,
            directory: home.join(".cloudsweep-trash"),
            retention_days: 7,
            restore_directory: home.join("Desktop").join("Restored"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: None,
            level: "info".to_string(),
        }
    }
}

impl SweepConfig {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(home_dir)
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Load the configuration, falling back to defaults when the file is absent.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_path);

        if !path.exists() {
            debug!("No config at {:?}, using defaults", path);
            let mut config = Self::default();
            config.watch_directories = default_watch_directories();
            return Ok(config);
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse { path, source },
            other => other,
        })
    }

    /// Parse a TOML document; missing fields take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.expand_paths();
        Ok(config)
    }

    /// Write the configuration as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reject settings the daemon loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_interval <= 0 {
            return Err(ConfigError::Invalid("scan_interval must be positive".into()));
        }
        if self.sync_poll_interval <= 0 {
            return Err(ConfigError::Invalid(
                "sync_poll_interval must be positive".into(),
            ));
        }
        if self.quarantine_sweep_interval <= 0 {
            return Err(ConfigError::Invalid(
                "quarantine_sweep_interval must be positive".into(),
            ));
        }
        if self.max_delete_retries == 0 {
            return Err(ConfigError::Invalid(
                "max_delete_retries must be at least 1".into(),
            ));
        }
        if self.watch_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "watch_queue_capacity must be at least 1".into(),
            ));
        }
        if !matches!(
            self.logging.level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::Invalid(format!(
                "unknown log level: {}",
                self.logging.level
            )));
        }
        regex::Regex::new(&self.conflict_pattern)?;
        Ok(())
    }

    pub fn debounce_delay(&self) -> Duration {
        Duration::from_secs(self.wait_before_delete)
    }

    pub fn scan_every(&self) -> Duration {
        Duration::from_secs(self.scan_interval.max(1) as u64)
    }

    pub fn quarantine_sweep_every(&self) -> Duration {
        Duration::from_secs(self.quarantine_sweep_interval.max(1) as u64)
    }

    pub fn sync_poll(&self) -> Duration {
        Duration::from_secs(self.sync_poll_interval.max(1) as u64)
    }

    pub fn max_sync_wait(&self) -> Duration {
        Duration::from_secs(self.max_sync_wait)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.retry_cooldown)
    }

    pub fn watch_poll(&self) -> Duration {
        Duration::from_millis(self.watch_poll_ms.max(1))
    }

    fn expand_paths(&mut self) {
        for dir in &mut self.watch_directories {
            *dir = expand_home(dir);
        }
        self.recovery.directory = expand_home(&self.recovery.directory);
        self.recovery.restore_directory = expand_home(&self.recovery.restore_directory);
        if let Some(file) = self.logging.file.as_mut() {
            *file = expand_home(file);
        }
    }
}

/// Replace a leading `~` with the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

/// iCloud Drive, when it exists on this machine.
fn default_watch_directories() -> Vec<PathBuf> {
    let icloud_drive = home_dir()
        .join("Library")
        .join("Mobile Documents")
        .join("com~apple~CloudDocs");
    if icloud_drive.is_dir() {
        vec![icloud_drive]
    } else {
        vec![]
    }
}
