use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep};

use cloudsweep::core::{
    config::{RecoveryConfig, SweepConfig},
    detection_engine::{DetectedArtifact, ModuleRegistry},
    quarantine::{ArtifactRemover, CleanupAction, QuarantineEngine, RemovalOutcome},
    sync_status::{AssumeSynced, SyncOracle},
    tracker::{ProcessOutcome, SweepDaemon},
    walk::transient_lock_error,
};

fn config_for(root: &Path) -> SweepConfig {
    SweepConfig {
        watch_directories: vec![root.join("drive")],
        recovery: RecoveryConfig {
            enabled: true,
            directory: root.join("trash"),
            retention_days: 7,
            restore_directory: root.join("restored"),
        },
        ..SweepConfig::default()
    }
}

fn daemon_for(root: &Path, config: SweepConfig) -> SweepDaemon {
    let registry = ModuleRegistry::from_config(&config).unwrap();
    let remover = Arc::new(QuarantineEngine::new(&config.recovery).with_home_dir(root));
    SweepDaemon::with_parts(config, registry, Arc::new(AssumeSynced), remover)
}

/// Fails every call with a fixed error
struct FailingRemover {
    calls: AtomicUsize,
    transient: bool,
}

impl FailingRemover {
    fn new(transient: bool) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            transient,
        }
    }
}

impl ArtifactRemover for FailingRemover {
    fn remove_artifact(&self, artifact: &DetectedArtifact) -> RemovalOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let err = if self.transient {
            transient_lock_error()
        } else {
            io::Error::from(io::ErrorKind::PermissionDenied)
        };
        RemovalOutcome::failed(&artifact.path, &err)
    }

    fn sweep_expired(&self) -> usize {
        0
    }
}

/// Reports a file synced from the `after`-th check on
struct SyncsAfter {
    calls: AtomicUsize,
    after: usize,
}

#[async_trait]
impl SyncOracle for SyncsAfter {
    async fn is_synced(&self, _path: &Path) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.after
    }

    async fn is_idle(&self) -> bool {
        true
    }
}

fn cache_artifact(path: &Path) -> DetectedArtifact {
    DetectedArtifact {
        path: path.to_path_buf(),
        module: "ephemeral_caches",
        reason: "ephemeral cache directory".into(),
        recovery_eligible: false,
    }
}

#[tokio::test(start_paused = true)]
async fn conflict_copy_is_quarantined_after_debounce() {
    let dir = tempfile::tempdir().unwrap();
    let drive = dir.path().join("drive/docs");
    fs::create_dir_all(&drive).unwrap();
    fs::write(drive.join("report.pdf"), b"original").unwrap();
    fs::write(drive.join("report 2.pdf"), b"divergent edit").unwrap();

    let mut daemon = daemon_for(dir.path(), config_for(dir.path()));
    let started = Instant::now();
    let processed = daemon.run_once().await;

    assert!(started.elapsed() >= Duration::from_secs(180));
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].artifact.reason, "conflict #2 of report.pdf");
    let ProcessOutcome::Dispatched(outcome) = &processed[0].outcome else {
        panic!("expected dispatch, got {:?}", processed[0].outcome);
    };
    assert_eq!(outcome.action, CleanupAction::Recovered);

    let stored = outcome.recovery_path.as_ref().unwrap();
    assert!(stored.starts_with(dir.path().join("trash")));
    assert_eq!(fs::read(stored).unwrap(), b"divergent edit");
    assert!(!drive.join("report 2.pdf").exists());
    assert!(drive.join("report.pdf").exists());
    assert_eq!(daemon.stats().recovered, 1);
    assert_eq!(daemon.stats().per_module["sync_conflicts"]["recovered"], 1);
}

#[tokio::test(start_paused = true)]
async fn nested_cache_removed_once() {
    let dir = tempfile::tempdir().unwrap();
    let build = dir.path().join("drive/project/build");
    fs::create_dir_all(build.join("lib/__pycache__")).unwrap();
    fs::write(build.join("lib/__pycache__/mod.pyc"), b"x").unwrap();

    let mut daemon = daemon_for(dir.path(), config_for(dir.path()));
    let processed = daemon.run_once().await;

    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].artifact.path, build);
    assert!(!build.exists());
    assert!(dir.path().join("drive/project").exists());
    assert_eq!(daemon.stats().deleted, 1);
    assert_eq!(daemon.stats().errors, 0);
}

#[tokio::test(start_paused = true)]
async fn orphan_conflict_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let drive = dir.path().join("drive");
    fs::create_dir_all(&drive).unwrap();
    fs::write(drive.join("orphan 2.txt"), b"x").unwrap();

    let mut daemon = daemon_for(dir.path(), config_for(dir.path()));
    let processed = daemon.run_once().await;

    assert!(processed.is_empty());
    assert!(drive.join("orphan 2.txt").exists());
}

#[tokio::test]
async fn governor_cools_down_then_resets() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("drive/__pycache__");
    fs::create_dir_all(&cache).unwrap();

    let config = config_for(dir.path());
    let cooldown = config.cooldown();
    let remover = Arc::new(FailingRemover::new(false));
    let mut daemon = daemon_for(dir.path(), config).with_remover(remover.clone());
    let artifact = cache_artifact(&cache);
    let start = Instant::now();

    for attempt in 1..=3u32 {
        let outcome = daemon.process_detected(&artifact, start).await;
        assert!(matches!(outcome, ProcessOutcome::Dispatched(_)));
        assert_eq!(daemon.failures().failures(&cache), attempt);
    }

    let outcome = daemon
        .process_detected(&artifact, start + Duration::from_secs(1))
        .await;
    assert!(matches!(outcome, ProcessOutcome::Cooldown));
    assert_eq!(remover.calls.load(Ordering::SeqCst), 3);
    assert_eq!(daemon.failures().failures(&cache), 3);

    let outcome = daemon.process_detected(&artifact, start + cooldown).await;
    assert!(matches!(outcome, ProcessOutcome::Dispatched(_)));
    assert_eq!(remover.calls.load(Ordering::SeqCst), 4);
    assert_eq!(daemon.failures().failures(&cache), 1);
    assert_eq!(daemon.stats().errors, 4);
}

#[tokio::test]
async fn transient_lock_never_counts() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("drive/.mypy_cache");
    fs::create_dir_all(&cache).unwrap();

    let remover = Arc::new(FailingRemover::new(true));
    let mut daemon = daemon_for(dir.path(), config_for(dir.path())).with_remover(remover.clone());
    let artifact = cache_artifact(&cache);

    for _ in 0..5 {
        let outcome = daemon.process_detected(&artifact, Instant::now()).await;
        let ProcessOutcome::Dispatched(removal) = outcome else {
            panic!("transient failures must never trigger a cooldown");
        };
        assert!(removal.transient);
    }

    assert_eq!(remover.calls.load(Ordering::SeqCst), 5);
    assert_eq!(daemon.failures().failures(&cache), 0);
    assert_eq!(daemon.stats().errors, 0);
    assert_eq!(daemon.stats().transient_locks, 5);
}

#[cfg(unix)]
#[tokio::test(start_paused = true)]
async fn pass_repairs_nosync_links() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("drive/project");
    fs::create_dir_all(project.join("node_modules.nosync/pkg")).unwrap();
    std::os::unix::fs::symlink("node_modules.nosync", project.join("node_modules 2")).unwrap();

    let mut daemon = daemon_for(dir.path(), config_for(dir.path()));
    daemon.run_once().await;

    let link = project.join("node_modules");
    assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    assert!(link.join("pkg").is_dir());
    assert!(fs::symlink_metadata(project.join("node_modules 2")).is_err());
}

#[tokio::test(start_paused = true)]
async fn cooldown_starts_after_sync_wait() {
    let dir = tempfile::tempdir().unwrap();
    let drive = dir.path().join("drive");
    fs::create_dir_all(&drive).unwrap();
    fs::write(drive.join("memo.txt"), b"a").unwrap();
    let conflict = drive.join("memo 2.txt");
    fs::write(&conflict, b"b").unwrap();

    let mut config = config_for(dir.path());
    config.max_delete_retries = 1;
    let cooldown = config.cooldown();
    let poll = config.sync_poll();
    let oracle = Arc::new(SyncsAfter {
        calls: AtomicUsize::new(0),
        after: 3,
    });
    let remover = Arc::new(FailingRemover::new(false));
    let mut daemon = daemon_for(dir.path(), config)
        .with_oracle(oracle)
        .with_remover(remover.clone());
    let artifact = DetectedArtifact {
        path: conflict.clone(),
        module: "sync_conflicts",
        reason: "conflict #2 of memo.txt".into(),
        recovery_eligible: true,
    };

    let start = Instant::now();
    let outcome = daemon.process_detected(&artifact, start).await;
    let waited = start.elapsed();
    assert!(matches!(outcome, ProcessOutcome::Dispatched(_)));
    assert!(waited >= poll * 2);

    let outcome = daemon.process_detected(&artifact, start + cooldown).await;
    assert!(matches!(outcome, ProcessOutcome::Cooldown));
    assert_eq!(remover.calls.load(Ordering::SeqCst), 1);

    let outcome = daemon
        .process_detected(&artifact, start + waited + cooldown)
        .await;
    assert!(matches!(outcome, ProcessOutcome::Dispatched(_)));
    assert_eq!(remover.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn daemon_quarantines_new_conflict_then_stops() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let drive = root.join("drive");
    fs::create_dir_all(&drive).unwrap();
    fs::write(drive.join("notes.txt"), b"original").unwrap();

    let mut config = config_for(&root);
    config.scan_interval = 30;
    let mut daemon = daemon_for(&root, config);
    let handle = daemon.shutdown_handle();
    let conflict = drive.join("notes 2.txt");

    let driver = async {
        sleep(Duration::from_secs(1)).await;
        fs::write(&conflict, b"divergent edit").unwrap();
        for _ in 0..600 {
            if !conflict.exists() {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
        handle.shutdown();
    };
    let (result, ()) = tokio::join!(daemon.run_daemon(), driver);

    assert!(result.is_ok());
    assert!(!conflict.exists());
    assert!(drive.join("notes.txt").exists());
    assert_eq!(daemon.stats().recovered, 1);
    assert_eq!(daemon.stats().errors, 0);

    let buckets: Vec<_> = fs::read_dir(root.join("trash")).unwrap().flatten().collect();
    assert_eq!(buckets.len(), 1);
    let stored: Vec<_> = fs::read_dir(buckets[0].path()).unwrap().flatten().collect();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].file_name().to_string_lossy().ends_with("_notes 2.txt"));
    assert_eq!(fs::read(stored[0].path()).unwrap(), b"divergent edit");
}

#[tokio::test(start_paused = true)]
async fn daemon_stops_promptly_when_idle() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("drive")).unwrap();
    let mut daemon = daemon_for(dir.path(), config_for(dir.path()));
    let handle = daemon.shutdown_handle();

    let started = Instant::now();
    let driver = async {
        sleep(Duration::from_secs(5)).await;
        handle.shutdown();
    };
    let (result, ()) = tokio::join!(daemon.run_daemon(), driver);

    assert!(result.is_ok());
    assert!(daemon.is_stopping());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(daemon.stats().detected, 0);
}
