/*!
Sync status oracle: has a file finished uploading/downloading, and is the
cloud service busy
*/

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Polls never run faster than this, whatever the configuration says
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Uploading,
    Downloading,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileStatus {
    pub path: PathBuf,
    pub status: SyncStatus,
    pub is_placeholder: bool,
    pub is_uploaded: bool,
}

impl FileStatus {
    fn unknown(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            status: SyncStatus::Unknown,
            is_placeholder: false,
            is_uploaded: false,
        }
    }
}

#[async_trait]
pub trait SyncOracle: Send + Sync {
    /// No pending upload or download for `path`
    async fn is_synced(&self, path: &Path) -> bool;

    /// The sync service reports no transfers in flight
    async fn is_idle(&self) -> bool;

    /// Poll `is_synced` until it holds or `max_wait` runs out.
    async fn wait_for_sync(
        &self,
        path: &Path,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> bool {
        let poll = poll_interval.max(MIN_POLL_INTERVAL);
        let deadline = Instant::now() + max_wait;
        loop {
            if self.is_synced(path).await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(poll.min(deadline - now)).await;
        }
    }
}

/// Reads iCloud extended attributes and `brctl status`
#[derive(Debug, Default)]
pub struct XattrSyncOracle;

impl XattrSyncOracle {
    pub async fn file_status(&self, path: &Path) -> FileStatus {
        if tokio::fs::symlink_metadata(path).await.is_err() {
            return FileStatus::unknown(path);
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        if name.starts_with('.') && name.ends_with(".icloud") {
            return FileStatus {
                path: path.to_path_buf(),
                status: SyncStatus::Downloading,
                is_placeholder: true,
                is_uploaded: true,
            };
        }

        // xattr values may be binary, so decode lossily
        let Some(stdout) = run_with_timeout(Command::new("xattr").arg("-l").arg(path)).await else {
            return FileStatus::unknown(path);
        };
        let attrs = String::from_utf8_lossy(&stdout);

        let is_placeholder = attrs.contains("com.apple.icloud.itemDownloadPending");
        let is_uploading = attrs.contains("com.apple.icloud.itemUploadPending");
        let status = if is_uploading {
            SyncStatus::Uploading
        } else if is_placeholder {
            SyncStatus::Downloading
        } else {
            SyncStatus::Synced
        };

        FileStatus {
            path: path.to_path_buf(),
            status,
            is_placeholder,
            is_uploaded: !is_uploading,
        }
    }
}

#[async_trait]
impl SyncOracle for XattrSyncOracle {
    async fn is_synced(&self, path: &Path) -> bool {
        self.file_status(path).await.status == SyncStatus::Synced
    }

    async fn is_idle(&self) -> bool {
        let Some(stdout) = run_with_timeout(Command::new("brctl").arg("status")).await else {
            return true;
        };
        let text = String::from_utf8_lossy(&stdout).to_lowercase();
        !text.contains("uploading") && !text.contains("downloading")
    }
}

/// For hosts without a sync service: everything is synced
#[derive(Debug, Default)]
pub struct AssumeSynced;

#[async_trait]
impl SyncOracle for AssumeSynced {
    async fn is_synced(&self, _path: &Path) -> bool {
        true
    }

    async fn is_idle(&self) -> bool {
        true
    }
}

/// The oracle suited to this platform.
pub fn platform_oracle() -> Arc<dyn SyncOracle> {
    if cfg!(target_os = "macos") {
        Arc::new(XattrSyncOracle)
    } else {
        Arc::new(AssumeSynced)
    }
}

async fn run_with_timeout(command: &mut Command) -> Option<Vec<u8>> {
    command.kill_on_drop(true);
    match timeout(SUBPROCESS_TIMEOUT, command.output()).await {
        Ok(Ok(output)) => Some(output.stdout),
        Ok(Err(e)) => {
            debug!("Failed to run {:?}: {}", command.as_std().get_program(), e);
            None
        }
        Err(_) => {
            debug!("{:?} timed out", command.as_std().get_program());
            None
        }
    }
}
