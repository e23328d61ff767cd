/*!
In-memory state owned by the daemon loop: pending actions, retry governor
records and run statistics
*/

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::detection_engine::DetectedArtifact;
use crate::core::quarantine::{CleanupAction, RemovalOutcome};

/// An artifact waiting out its delay
#[derive(Debug, Clone)]
pub struct PendingAction {
    pub first_seen: Instant,
    pub artifact: DetectedArtifact,
}

/// Artifacts keyed by path; a path is pending at most once
#[derive(Debug)]
pub struct PendingActions {
    entries: BTreeMap<PathBuf, PendingAction>,
    debounce: Duration,
}

impl PendingActions {
    pub fn new(debounce: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            debounce,
        }
    }

    /// Queue `artifact` unless its path is already pending.
    pub fn insert(&mut self, artifact: DetectedArtifact, now: Instant) -> bool {
        if self.entries.contains_key(&artifact.path) {
            return false;
        }
        self.entries.insert(
            artifact.path.clone(),
            PendingAction {
                first_seen: now,
                artifact,
            },
        );
        true
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// A strict ancestor of `path` is already queued.
    pub fn has_pending_ancestor(&self, path: &Path) -> bool {
        path.ancestors().skip(1).any(|ancestor| self.entries.contains_key(ancestor))
    }

    /// Recovery-eligible artifacts wait out the debounce; the rest go at once.
    pub fn delay_for(&self, artifact: &DetectedArtifact) -> Duration {
        if artifact.recovery_eligible {
            self.debounce
        } else {
            Duration::ZERO
        }
    }

    /// Remove and return every entry whose delay has elapsed, in path order.
    pub fn take_due(&mut self, now: Instant) -> Vec<DetectedArtifact> {
        let due: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|(_, pending)| {
                let waited = now.saturating_duration_since(pending.first_seen);
                waited >= self.delay_for(&pending.artifact)
            })
            .map(|(path, _)| path.clone())
            .collect();

        due.iter()
            .filter_map(|path| self.entries.remove(path))
            .map(|pending| pending.artifact)
            .collect()
    }

    /// Earliest moment an entry becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.entries
            .values()
            .map(|pending| pending.first_seen + self.delay_for(&pending.artifact))
            .min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    pub consecutive_failures: u32,
    pub last_failure: Instant,
}

/// Governor verdict for a path about to be dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStatus {
    Ready { prior_failures: u32 },
    Cooldown { failures: u32, remaining: Duration },
}

/// Consecutive failures per path, with a cooldown once the limit is hit
#[derive(Debug)]
pub struct FailureTracker {
    records: HashMap<PathBuf, FailureRecord>,
    max_retries: u32,
    cooldown: Duration,
}

impl FailureTracker {
    pub fn new(max_retries: u32, cooldown: Duration) -> Self {
        Self {
            records: HashMap::new(),
            max_retries,
            cooldown,
        }
    }

    /// Check `path`. An expired cooldown forgets the record entirely.
    pub fn check(&mut self, path: &Path, now: Instant) -> RetryStatus {
        let Some(record) = self.records.get(path).copied() else {
            return RetryStatus::Ready { prior_failures: 0 };
        };
        if record.consecutive_failures < self.max_retries {
            return RetryStatus::Ready {
                prior_failures: record.consecutive_failures,
            };
        }

        let elapsed = now.saturating_duration_since(record.last_failure);
        if elapsed < self.cooldown {
            return RetryStatus::Cooldown {
                failures: record.consecutive_failures,
                remaining: self.cooldown - elapsed,
            };
        }

        info!(
            "Cooldown expired for {:?}, retrying (was {} failures)",
            path, record.consecutive_failures
        );
        self.records.remove(path);
        RetryStatus::Ready { prior_failures: 0 }
    }

    /// Count one more failure, returning the new consecutive count.
    pub fn record_failure(&mut self, path: &Path, now: Instant) -> u32 {
        let count = self
            .records
            .get(path)
            .map_or(0, |record| record.consecutive_failures)
            + 1;
        self.records.insert(
            path.to_path_buf(),
            FailureRecord {
                consecutive_failures: count,
                last_failure: now,
            },
        );

        if count >= self.max_retries {
            warn!(
                "Failed to remove {:?} ({}/{} attempts), cooling down for {:?}",
                path, count, self.max_retries, self.cooldown
            );
        } else {
            debug!("Failed to remove {:?} (attempt {}/{})", path, count, self.max_retries);
        }
        count
    }

    pub fn clear(&mut self, path: &Path) {
        self.records.remove(path);
    }

    pub fn failures(&self, path: &Path) -> u32 {
        self.records.get(path).map_or(0, |r| r.consecutive_failures)
    }
}

/// Counters for one daemon run
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStats {
    pub started_at: DateTime<Utc>,
    pub detected: u64,
    pub deleted: u64,
    pub recovered: u64,
    pub skipped: u64,
    pub errors: u64,
    pub transient_locks: u64,
    /// module -> outcome -> count
    pub per_module: BTreeMap<String, BTreeMap<String, u64>>,
}

impl Default for DaemonStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            detected: 0,
            deleted: 0,
            recovered: 0,
            skipped: 0,
            errors: 0,
            transient_locks: 0,
            per_module: BTreeMap::new(),
        }
    }

    pub fn record_detected(&mut self) {
        self.detected += 1;
    }

    /// Skipped before dispatch: vanished, cooling down or still syncing.
    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    /// Count a dispatched outcome. Transient lock failures only bump their
    /// own counter.
    pub fn record_outcome(&mut self, module: &str, outcome: &RemovalOutcome) {
        let label = match outcome.action {
            CleanupAction::Deleted => {
                self.deleted += 1;
                "deleted"
            }
            CleanupAction::Recovered => {
                self.recovered += 1;
                "recovered"
            }
            CleanupAction::Skipped => {
                self.skipped += 1;
                "skipped"
            }
            CleanupAction::Error if outcome.transient => {
                self.transient_locks += 1;
                return;
            }
            CleanupAction::Error => {
                self.errors += 1;
                "error"
            }
        };
        *self
            .per_module
            .entry(module.to_string())
            .or_default()
            .entry(label.to_string())
            .or_default() += 1;
    }

    pub fn summary(&self) -> String {
        format!(
            "detected={}, deleted={}, recovered={}, skipped={}, errors={}, transient={}",
            self.detected,
            self.deleted,
            self.recovered,
            self.skipped,
            self.errors,
            self.transient_locks
        )
    }
}
