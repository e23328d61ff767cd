/*!
Terminal rendering for command results: one plain line per record, or JSON
*/

use serde::Serialize;

use crate::core::{
    detection_engine::DetectedArtifact,
    nosync::{ConvertAction, ConvertOutcome, RepairAction, RepairResult},
    quarantine::{CleanupAction, PlannedKind, QuarantineEntry, RemovalOutcome},
    state_manager::DaemonStats,
    tracker::{PlannedAction, ProcessOutcome, ProcessedArtifact},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Plain,
    Json,
}

/// A record that knows its one-line plain rendering
pub trait ReportLine {
    fn plain_line(&self) -> String;
}

/// Render `items` as plain lines or a pretty JSON array.
pub fn render<T>(items: &[T], format: ReportFormat) -> String
where
    T: ReportLine + Serialize,
{
    match format {
        ReportFormat::Plain => items
            .iter()
            .map(ReportLine::plain_line)
            .collect::<Vec<_>>()
            .join("\n"),
        ReportFormat::Json => serde_json::to_string_pretty(items)
            .unwrap_or_else(|e| format!("JSON serialization failed: {e}")),
    }
}

pub fn render_stats(stats: &DaemonStats, format: ReportFormat) -> String {
    match format {
        ReportFormat::Plain => stats.summary(),
        ReportFormat::Json => serde_json::to_string_pretty(stats)
            .unwrap_or_else(|e| format!("JSON serialization failed: {e}")),
    }
}

impl ReportLine for DetectedArtifact {
    fn plain_line(&self) -> String {
        format!("[{}] {} ({})", self.module, self.path.display(), self.reason)
    }
}

impl ReportLine for PlannedAction {
    fn plain_line(&self) -> String {
        let verb = match self.action {
            PlannedKind::MoveToQuarantine => "would quarantine",
            PlannedKind::Delete => "would delete",
            PlannedKind::Skip => "would skip (protected path)",
        };
        format!("{verb}: {}", self.artifact.plain_line())
    }
}

impl ReportLine for RemovalOutcome {
    fn plain_line(&self) -> String {
        match (self.action, &self.recovery_path, &self.error) {
            (CleanupAction::Recovered, Some(to), _) => {
                format!("recovered: {} -> {}", self.path.display(), to.display())
            }
            (CleanupAction::Deleted, _, _) => format!("deleted: {}", self.path.display()),
            (_, _, Some(error)) => {
                format!("{}: {} ({error})", label(self.action), self.path.display())
            }
            _ => format!("{}: {}", label(self.action), self.path.display()),
        }
    }
}

impl ReportLine for ProcessedArtifact {
    fn plain_line(&self) -> String {
        let path = self.artifact.path.display();
        match &self.outcome {
            ProcessOutcome::Dispatched(outcome) => outcome.plain_line(),
            ProcessOutcome::Vanished => format!("skipped: {path} (no longer exists)"),
            ProcessOutcome::Cooldown => {
                format!("skipped: {path} (cooling down after repeated failures)")
            }
            ProcessOutcome::SyncTimeout => format!("skipped: {path} (still syncing)"),
            ProcessOutcome::Cancelled => format!("skipped: {path} (shutting down)"),
        }
    }
}

impl ReportLine for QuarantineEntry {
    fn plain_line(&self) -> String {
        format!("{}  {}  {}", self.date, self.original_name, self.path.display())
    }
}

impl ReportLine for ConvertOutcome {
    fn plain_line(&self) -> String {
        match (self.action, &self.nosync_path, &self.error) {
            (ConvertAction::Converted, Some(to), _) => {
                format!("converted: {} -> {}", self.path.display(), to.display())
            }
            (ConvertAction::Skipped, _, Some(e)) => {
                format!("skipped: {} ({e})", self.path.display())
            }
            (_, _, Some(e)) => format!("error: {} ({e})", self.path.display()),
            _ => format!("{:?}: {}", self.action, self.path.display()),
        }
    }
}

impl ReportLine for RepairResult {
    fn plain_line(&self) -> String {
        let tag = match self.action {
            RepairAction::Repaired => "repaired",
            RepairAction::Warning => "warning",
            RepairAction::Error => "error",
        };
        format!("{tag}: {} ({})", self.path.display(), self.detail)
    }
}

fn label(action: CleanupAction) -> &'static str {
    match action {
        CleanupAction::Deleted => "deleted",
        CleanupAction::Recovered => "recovered",
        CleanupAction::Skipped => "skipped",
        CleanupAction::Error => "error",
    }
}
