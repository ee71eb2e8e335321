//! One snapshot sequence: capture, then prune.

use crate::config::Config;
use crate::retention::{PruneReport, RetentionManager};
use crate::snapshot::{
    FailReason, FileCategory, FileOutcome, FileSpec, SkipReason, SnapshotEngine, SnapshotRequest,
    SnapshotResult, SnapshotStatus, Trigger,
};
use crate::utils::errors::{BrowsessionError, Result};
use chrono::Utc;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(SnapshotResult),
    /// Nothing captured, with the reason
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub outcome: JobOutcome,
    /// `None` when no retention pass ran or it could not read the backup root
    pub prune: Option<PruneReport>,
}

/// Work the scheduler runs on a blocking worker thread.
pub trait BackupJob: Send + Sync + 'static {
    /// Capture one snapshot and apply retention. Checks `cancel` between
    /// files and gives up with [`BrowsessionError::Cancelled`].
    fn run(&self, trigger: Trigger, cancel: &CancellationToken) -> Result<JobReport>;

    /// Retention pass on its own, as run once at startup.
    fn prune(&self) -> Result<PruneReport>;
}

/// Snapshots one browser profile into one backup root.
pub struct ProfileBackup {
    engine: SnapshotEngine,
    specs: Vec<FileSpec>,
    root: PathBuf,
    retention: RetentionManager,
    skip_unchanged: bool,
}

impl ProfileBackup {
    pub fn new(
        engine: SnapshotEngine,
        specs: Vec<FileSpec>,
        retention: RetentionManager,
        skip_unchanged: bool,
    ) -> Self {
        Self {
            engine,
            specs,
            root: retention.root().to_path_buf(),
            retention,
            skip_unchanged,
        }
    }

    /// Engine, retention and file list as configured.
    pub fn from_config(config: &Config) -> Self {
        let naming = config.naming();
        let engine = SnapshotEngine::new(
            config.paths.browser_profile.clone(),
            config.copy_policy(),
            naming.clone(),
        );
        let retention = RetentionManager::new(
            config.paths.backup_dirs_root.clone(),
            naming,
            config.retention_policy(),
            config.compression(),
        );
        Self::new(engine, config.file_specs(), retention, config.snapshot.skip_unchanged)
    }

    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }

    /// Reason to skip, if the sources match the newest complete snapshot.
    fn unchanged_since_last(&self, trigger: Trigger) -> Result<Option<String>> {
        let kind = trigger.kind();
        let set = self.retention.scan()?;
        let Some(latest) = set.latest_complete(kind) else {
            return Ok(None);
        };

        let manifest = match latest.manifest() {
            Ok(manifest) => manifest,
            Err(e) => {
                debug!(id = %latest.id, error = %e, "Unreadable manifest, not comparing");
                return Ok(None);
            }
        };

        let current = self.engine.fingerprint(&self.specs, kind);
        Ok(manifest
            .matches_sources(&current)
            .then(|| format!("sources unchanged since snapshot {}", latest.id)))
    }
}

impl BackupJob for ProfileBackup {
    fn run(&self, trigger: Trigger, cancel: &CancellationToken) -> Result<JobReport> {
        // State changes and manual requests always capture
        let skippable = matches!(trigger, Trigger::Periodic | Trigger::Emergency);
        if self.skip_unchanged && skippable {
            if let Some(reason) = self.unchanged_since_last(trigger)? {
                return Ok(JobReport {
                    outcome: JobOutcome::Skipped(reason),
                    prune: None,
                });
            }
        }

        let request = SnapshotRequest {
            id: self.retention.scan()?.next_id(),
            trigger,
            created_at: Utc::now(),
        };
        let result = self.engine.snapshot(&self.specs, request, &self.root, cancel)?;
        log_misses(&result);

        let prune = match self.retention.prune() {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "Retention pass failed");
                None
            }
        };

        Ok(JobReport {
            outcome: JobOutcome::Completed(result),
            prune,
        })
    }

    fn prune(&self) -> Result<PruneReport> {
        self.retention.prune()
    }
}

/// Log every main source the snapshot did not capture.
fn log_misses(result: &SnapshotResult) {
    if result.status == SnapshotStatus::Complete {
        return;
    }

    for record in result.per_file.iter().filter(|r| r.category == FileCategory::Main) {
        let source = PathBuf::from(&record.source);
        let error = match &record.outcome {
            FileOutcome::Failed {
                reason: FailReason::NotFound,
            }
            | FileOutcome::Skipped {
                reason: SkipReason::NotFound,
            } => BrowsessionError::SourceMissing(source),
            FileOutcome::Skipped {
                reason: SkipReason::Locked,
            } => BrowsessionError::SourceLocked(source),
            _ => continue,
        };
        warn!(id = %result.id, error = %error, "Main source not captured");
    }

    let missing = result.main_misses();
    if missing > 0 {
        let error = BrowsessionError::PartialSnapshot {
            id: result.id.0,
            missing,
        };
        warn!(error = %error, "Snapshot degraded");
    }
}
