//! End-of-command report.

use serde::Serialize;

use crate::models::{Changeset, Failure, Stage};
use crate::reconcile::{SyncPlan, SyncReport};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub command: String,
    pub dry_run: bool,
    pub cancelled: bool,

    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub unchanged: usize,

    pub converted: usize,
    pub conversion_failed: usize,
    pub skipped: usize,

    pub uploaded: usize,
    pub deleted: usize,
    pub sync_failed: usize,
    pub skipped_inflight: usize,
    pub held_back: usize,
    /// Operations a dry run would have executed.
    pub planned_uploads: usize,
    pub planned_deletes: usize,

    pub cleared: usize,

    /// `(path, message)` for captioning and other degradations.
    pub warnings: Vec<(String, String)>,
    pub failures: Vec<Failure>,
}

impl RunSummary {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Self::default()
        }
    }

    pub fn record_changes(&mut self, changes: &Changeset) {
        self.added = changes.added.len();
        self.modified = changes.modified.len();
        self.removed = changes.removed.len();
        self.unchanged = changes.unchanged.len();
    }

    pub fn record_plan(&mut self, plan: &SyncPlan) {
        self.planned_uploads = plan.upserts();
        self.planned_deletes = plan.deletes();
        self.skipped_inflight = plan.skipped_inflight.len();
        self.held_back = plan.held_back.len();
    }

    pub fn record_sync(&mut self, report: SyncReport) {
        self.uploaded += report.uploaded;
        self.deleted += report.deleted;
        self.sync_failed += report.failures.len();
        self.cancelled |= report.not_attempted > 0;
        self.failures.extend(report.failures);
    }

    /// Conversion, sync or clear failures. Unreadable files found while
    /// scanning are reported but do not count.
    pub fn has_failures(&self) -> bool {
        self.failures.iter().any(|f| f.stage != Stage::Scan)
    }

    pub fn print(&self) {
        if self.dry_run {
            println!("{} (dry-run)", self.command);
        } else {
            println!("{}", self.command);
        }

        if self.added + self.modified + self.removed + self.unchanged > 0 {
            println!(
                "  changes: {} added, {} modified, {} removed, {} unchanged",
                self.added, self.modified, self.removed, self.unchanged
            );
        }
        if self.converted + self.conversion_failed > 0 || self.command == "run" {
            println!(
                "  converted: {} ({} failed, {} skipped)",
                self.converted, self.conversion_failed, self.skipped
            );
        }
        if self.dry_run {
            println!(
                "  planned: {} uploads, {} deletes",
                self.planned_uploads, self.planned_deletes
            );
        } else if self.command == "sync" || self.command == "run" || self.deleted > 0 {
            println!(
                "  remote: {} uploaded, {} deleted, {} failed",
                self.uploaded, self.deleted, self.sync_failed
            );
        }
        if self.skipped_inflight > 0 {
            println!("  skipped in-flight: {}", self.skipped_inflight);
        }
        if self.held_back > 0 {
            println!("  held back (pending/failed locally): {}", self.held_back);
        }
        if self.cleared > 0 {
            println!("  removed: {} paths", self.cleared);
        }

        if !self.warnings.is_empty() {
            println!();
            println!("  warnings:");
            for (path, message) in &self.warnings {
                println!("    {}  {}", path, message);
            }
        }
        if !self.failures.is_empty() {
            println!();
            println!("  failures:");
            for failure in &self.failures {
                println!(
                    "    [{}] {}  {}",
                    failure.stage, failure.path, failure.reason
                );
            }
        }

        if self.cancelled {
            println!("cancelled");
        } else if self.has_failures() {
            println!("completed with failures");
        } else {
            println!("ok");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_errors_do_not_fail_the_run() {
        let mut summary = RunSummary::new("scan");
        summary
            .failures
            .push(Failure::new(Stage::Scan, "locked/", "permission denied"));
        assert!(!summary.has_failures());

        summary
            .failures
            .push(Failure::new(Stage::Convert, "a.pdf", "timed out"));
        assert!(summary.has_failures());
    }

    #[test]
    fn sync_report_is_folded_in() {
        let mut summary = RunSummary::new("sync");
        summary.record_sync(SyncReport {
            uploaded: 2,
            deleted: 1,
            failures: vec![Failure::new(Stage::Sync, "b.pdf", "HTTP 500")],
            not_attempted: 0,
        });
        assert_eq!(summary.uploaded, 2);
        assert_eq!(summary.sync_failed, 1);
        assert!(summary.has_failures());
        assert!(!summary.cancelled);
    }
}
