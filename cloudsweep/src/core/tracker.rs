/*!
Main async coordinator that drives detection, debouncing, the retry governor
and removal
*/

use std::io;
use std::path::{Component, Path};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::core::{
    config::{ConfigError, SweepConfig},
    detection_engine::{DetectedArtifact, ModuleRegistry},
    event_system::{FsWatcher, WatchEvent},
    nosync::{Classifier, NOSYNC_SUFFIX, NosyncGuardian, RepairAction},
    quarantine::{ArtifactRemover, PlannedKind, QuarantineEngine, RemovalOutcome},
    state_manager::{DaemonStats, FailureTracker, PendingActions, RetryStatus},
    sync_status::{SyncOracle, platform_oracle},
};

/// What the pipeline did with one due artifact
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// Gone before it was dispatched
    Vanished,
    /// Retry limit reached and the cooldown has not elapsed
    Cooldown,
    /// The sync service never reported the file settled
    SyncTimeout,
    /// Shutdown arrived while waiting on the sync service
    Cancelled,
    Dispatched(RemovalOutcome),
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedArtifact {
    pub artifact: DetectedArtifact,
    pub outcome: ProcessOutcome,
}

/// Dry-run verdict for one artifact
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    pub artifact: DetectedArtifact,
    pub action: PlannedKind,
}

/// Asks a running daemon to stop after the current action
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.tx.send_replace(true);
    }
}

/// The cleanup pipeline
pub struct SweepDaemon {
    config: SweepConfig,
    registry: ModuleRegistry,
    oracle: Arc<dyn SyncOracle>,
    remover: Arc<dyn ArtifactRemover>,
    guardian: Arc<NosyncGuardian>,
    pending: PendingActions,
    failures: FailureTracker,
    stats: DaemonStats,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SweepDaemon {
    /// Validate `config` and build the daemon with the platform oracle and
    /// the quarantine engine.
    pub fn new(config: SweepConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = ModuleRegistry::from_config(&config)?;
        let remover = Arc::new(QuarantineEngine::new(&config.recovery));
        Ok(Self::with_parts(config, registry, platform_oracle(), remover))
    }

    pub fn with_parts(
        config: SweepConfig,
        registry: ModuleRegistry,
        oracle: Arc<dyn SyncOracle>,
        remover: Arc<dyn ArtifactRemover>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            pending: PendingActions::new(config.debounce_delay()),
            failures: FailureTracker::new(config.max_delete_retries, config.cooldown()),
            guardian: Arc::new(NosyncGuardian::new(&config)),
            stats: DaemonStats::new(),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            config,
            registry,
            oracle,
            remover,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn SyncOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_remover(mut self, remover: Arc<dyn ArtifactRemover>) -> Self {
        self.remover = remover;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &DaemonStats {
        &self.stats
    }

    pub fn pending(&self) -> &PendingActions {
        &self.pending
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run every module's full scan on a blocking worker and queue new paths.
    pub async fn scan_and_queue(&mut self) -> usize {
        let registry = self.registry.clone();
        let detected = match tokio::task::spawn_blocking(move || registry.scan_all()).await {
            Ok(detected) => detected,
            Err(e) => {
                error!("Scan task failed: {}", e);
                return 0;
            }
        };

        let now = Instant::now();
        let mut queued = 0;
        for artifact in detected {
            if !self.pending.has_pending_ancestor(&artifact.path) && self.enqueue(artifact, now) {
                queued += 1;
            }
        }
        debug!("Scan queued {} new artifacts ({} pending)", queued, self.pending.len());
        queued
    }

    /// Feed one live event through the live-watch modules.
    pub fn handle_watch_event(&mut self, event: WatchEvent, now: Instant) -> bool {
        let path = event.path.as_path();
        if self.inside_pruned_tree(path)
            || self.pending.contains(path)
            || self.pending.has_pending_ancestor(path)
        {
            return false;
        }
        match self.registry.detect_live(path) {
            Some(artifact) => self.enqueue(artifact, now),
            None => false,
        }
    }

    /// Live paths below a `.nosync`, dependency or cache directory are left
    /// alone. The periodic scan never descends into those trees either.
    fn inside_pruned_tree(&self, path: &Path) -> bool {
        let relative = self
            .config
            .watch_directories
            .iter()
            .filter_map(|root| path.strip_prefix(root).ok())
            .min_by_key(|rest| rest.components().count())
            .unwrap_or(path);
        pruned_below(relative, self.guardian.classifier())
    }

    fn enqueue(&mut self, artifact: DetectedArtifact, now: Instant) -> bool {
        if self.pending.contains(&artifact.path) {
            return false;
        }
        info!("Queued [{}] {:?} ({})", artifact.module, artifact.path, artifact.reason);
        self.stats.record_detected();
        self.pending.insert(artifact, now)
    }

    /// Take every due entry and process it.
    pub async fn process_due(&mut self, now: Instant) -> Vec<ProcessedArtifact> {
        let mut processed = Vec::new();
        for artifact in self.pending.take_due(now) {
            if self.is_stopping() {
                debug!("Stopping, leaving {:?} for the next run", artifact.path);
                break;
            }
            let outcome = self.process_detected(&artifact, now).await;
            processed.push(ProcessedArtifact { artifact, outcome });
        }
        processed
    }

    /// Existence, then cooldown, then sync wait, then dispatch.
    pub async fn process_detected(
        &mut self,
        artifact: &DetectedArtifact,
        now: Instant,
    ) -> ProcessOutcome {
        let path = artifact.path.as_path();
        if std::fs::symlink_metadata(path).is_err() {
            debug!("Vanished before dispatch: {:?}", path);
            self.stats.record_skip();
            return ProcessOutcome::Vanished;
        }

        if let RetryStatus::Cooldown { failures, remaining } = self.failures.check(path, now) {
            debug!(
                "Skipping {:?}: {} failures, cooling down for another {:?}",
                path, failures, remaining
            );
            self.stats.record_skip();
            return ProcessOutcome::Cooldown;
        }

        // a failure is stamped at dispatch time, after any sync wait
        let mut failed_at = now;
        if artifact.recovery_eligible {
            debug!("Waiting for sync: {:?}", path);
            let wait_started = Instant::now();
            let mut shutdown = self.shutdown_rx.clone();
            let poll = self.config.sync_poll();
            let max_wait = self.config.max_sync_wait();
            let synced = tokio::select! {
                synced = self.oracle.wait_for_sync(path, poll, max_wait) => synced,
                _ = stopped(&mut shutdown) => {
                    debug!("Sync wait cancelled: {:?}", path);
                    return ProcessOutcome::Cancelled;
                }
            };
            if !synced {
                warn!("Timed out waiting for sync: {:?}", path);
                self.stats.record_skip();
                return ProcessOutcome::SyncTimeout;
            }
            failed_at = now + wait_started.elapsed();
        }

        let remover = Arc::clone(&self.remover);
        let job = artifact.clone();
        let removal = tokio::task::spawn_blocking(move || remover.remove_artifact(&job));
        let outcome = match removal.await {
            Ok(outcome) => outcome,
            Err(e) => RemovalOutcome::failed(path, &io::Error::other(e.to_string())),
        };

        if outcome.success() {
            self.failures.clear(path);
        } else if outcome.transient {
            warn!("Resource temporarily locked, will retry later: {:?}", path);
        } else {
            self.failures.record_failure(path, failed_at);
        }
        self.stats.record_outcome(artifact.module, &outcome);

        ProcessOutcome::Dispatched(outcome)
    }

    /// Remove expired quarantine buckets on a blocking worker.
    pub async fn sweep_quarantine(&self) -> usize {
        let remover = Arc::clone(&self.remover);
        match tokio::task::spawn_blocking(move || remover.sweep_expired()).await {
            Ok(removed) => {
                if removed > 0 {
                    info!("Removed {} expired quarantine buckets", removed);
                }
                removed
            }
            Err(e) => {
                error!("Quarantine sweep failed: {}", e);
                0
            }
        }
    }

    /// Verify every `.nosync` link under the watch roots.
    pub async fn repair_links(&self) {
        let guardian = Arc::clone(&self.guardian);
        let results = match tokio::task::spawn_blocking(move || guardian.repair_all()).await {
            Ok(results) => results,
            Err(e) => {
                error!("Symlink repair failed: {}", e);
                return;
            }
        };
        for result in &results {
            match result.action {
                RepairAction::Repaired => info!("Repaired {:?}: {}", result.path, result.detail),
                RepairAction::Warning => warn!("{:?}: {}", result.path, result.detail),
                RepairAction::Error => error!("{:?}: {}", result.path, result.detail),
            }
        }
    }

    /// One pass: scan, wait out every delay, then sweep and repair.
    pub async fn run_once(&mut self) -> Vec<ProcessedArtifact> {
        info!("Starting single cleanup pass...");
        self.scan_and_queue().await;
        info!(
            "Found {} artifacts across {} modules",
            self.pending.len(),
            self.registry.len()
        );

        let mut processed = Vec::new();
        while !self.pending.is_empty() && !self.is_stopping() {
            processed.extend(self.process_due(Instant::now()).await);

            if let Some(next) = self.pending.next_due() {
                let mut shutdown = self.shutdown_rx.clone();
                tokio::select! {
                    _ = sleep_until(next) => {}
                    _ = stopped(&mut shutdown) => break,
                }
            }
        }

        self.sweep_quarantine().await;
        if self.config.nosync.auto_repair {
            self.repair_links().await;
        }
        info!("Pass complete: {}", self.stats.summary());
        processed
    }

    /// Run until the shutdown handle fires.
    pub async fn run_daemon(&mut self) -> notify::Result<()> {
        info!("Starting cloudsweep daemon...");
        info!("Watching: {:?}", self.config.watch_directories);
        info!("Modules: {}", self.registry.names().join(", "));
        if !self.oracle.is_idle().await {
            info!("Sync service is busy; recoverable artifacts wait for their files to settle");
        }

        let (mut watcher, mut events) =
            FsWatcher::start(&self.config.watch_directories, self.config.watch_queue_capacity)?;

        self.scan_and_queue().await;
        if self.config.nosync.auto_repair {
            self.repair_links().await;
        }

        let mut next_scan = Instant::now() + self.config.scan_every();
        let mut next_sweep = Instant::now();
        let mut events_open = true;

        while !self.is_stopping() {
            self.process_due(Instant::now()).await;

            if events_open {
                for _ in 0..self.config.watch_queue_capacity {
                    match timeout(self.config.watch_poll(), events.next()).await {
                        Ok(Some(event)) => {
                            self.handle_watch_event(event, Instant::now());
                        }
                        Ok(None) => {
                            warn!("Watch stream closed; relying on periodic scans");
                            events_open = false;
                            break;
                        }
                        Err(_) => break,
                    }
                    if self.is_stopping() {
                        break;
                    }
                }
            } else {
                sleep(self.config.watch_poll()).await;
            }

            let now = Instant::now();
            if now >= next_scan {
                self.scan_and_queue().await;
                if self.config.nosync.auto_repair {
                    self.repair_links().await;
                }
                next_scan = now + self.config.scan_every();
            }
            if now >= next_sweep {
                self.sweep_quarantine().await;
                next_sweep = now + self.config.quarantine_sweep_every();
            }
        }

        watcher.stop();
        info!("Daemon stopped. Stats: {}", self.stats.summary());
        Ok(())
    }

    /// Ask the remover what it would do with each artifact, without touching
    /// the filesystem.
    pub fn plan(&self, artifacts: Vec<DetectedArtifact>) -> Vec<PlannedAction> {
        artifacts
            .into_iter()
            .map(|artifact| PlannedAction {
                action: self.remover.plan(&artifact),
                artifact,
            })
            .collect()
    }

    /// Scan every root and report what a pass would do.
    pub async fn dry_run(&self) -> Vec<PlannedAction> {
        let registry = self.registry.clone();
        let detected = tokio::task::spawn_blocking(move || registry.scan_all())
            .await
            .unwrap_or_else(|e| {
                error!("Scan task failed: {}", e);
                Vec::new()
            });
        self.plan(detected)
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Any `.nosync` component, or a classified directory above the last one
fn pruned_below(relative: &Path, classifier: &Classifier) -> bool {
    let names: Vec<&str> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(name) => name.to_str(),
            _ => None,
        })
        .collect();
    let Some((_, ancestors)) = names.split_last() else {
        return false;
    };
    names.iter().any(|name| name.ends_with(NOSYNC_SUFFIX))
        || ancestors.iter().any(|name| classifier.classify(name).is_some())
}
