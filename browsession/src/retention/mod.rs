//! Retention manager.
//!
//! Each pass rescans the backup root, removes leftovers of interrupted runs,
//! deletes snapshots the policy no longer wants (oldest first, never the last
//! one), and optionally compresses the ones that are kept but no longer fresh.
//! A deletion that fails is logged and left for the next pass.

pub mod backup_set;
pub mod compress;
pub mod policy;

use crate::snapshot::layout::{SnapshotId, SnapshotNaming, STAGING_SUFFIX};
use crate::utils::errors::{BrowsessionError, Result};
use backup_set::BackupSet;
use chrono::Utc;
use policy::RetentionPolicy;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Compression of kept snapshots
#[derive(Debug, Clone, Copy)]
pub struct CompressionPolicy {
    /// Newest snapshots of each kind left uncompressed
    pub keep_uncompressed: usize,

    /// zstd level (1-22)
    pub level: i32,
}

/// What one pruning pass did
#[derive(Debug, Default, Clone, Serialize)]
pub struct PruneReport {
    pub deleted: Vec<SnapshotId>,
    /// Snapshots that could not be deleted this pass, with the reason
    pub failed: Vec<(SnapshotId, String)>,
    pub purged_orphans: Vec<PathBuf>,
    pub compressed: Vec<SnapshotId>,
    /// Snapshots left after the pass
    pub remaining: usize,
}

#[derive(Debug, Clone)]
pub struct RetentionManager {
    root: PathBuf,
    naming: SnapshotNaming,
    policy: RetentionPolicy,
    compression: Option<CompressionPolicy>,
}

impl RetentionManager {
    pub fn new(
        root: impl Into<PathBuf>,
        naming: SnapshotNaming,
        policy: RetentionPolicy,
        compression: Option<CompressionPolicy>,
    ) -> Self {
        Self {
            root: root.into(),
            naming,
            policy,
            compression,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scan(&self) -> Result<BackupSet> {
        BackupSet::scan(&self.root, &self.naming)
    }

    /// Run one pruning pass.
    ///
    /// Only failing to read the backup root is an error; everything else is
    /// recorded in the report and retried next time.
    pub fn prune(&self) -> Result<PruneReport> {
        let set = self.scan()?;
        let mut report = PruneReport::default();

        for orphan in &set.orphans {
            match fs::remove_dir_all(orphan) {
                Ok(()) => {
                    info!(path = %orphan.display(), "Removed unfinished snapshot");
                    report.purged_orphans.push(orphan.clone());
                }
                Err(e) => {
                    warn!(path = %orphan.display(), error = %e, "Could not remove unfinished snapshot");
                }
            }
        }

        let doomed = policy::plan(&set.snapshots, &self.policy, Utc::now());

        for snapshot in set.snapshots.iter().filter(|s| doomed.contains(&s.id)) {
            match retire(&snapshot.path) {
                Ok(()) => {
                    info!(id = %snapshot.id, path = %snapshot.path.display(), "Removed old snapshot");
                    report.deleted.push(snapshot.id);
                }
                Err(e) => {
                    warn!(id = %snapshot.id, error = %e, "Snapshot deletion failed, will retry");
                    report.failed.push((snapshot.id, e.to_string()));
                }
            }
        }

        if let Some(compression) = self.compression {
            let candidates =
                policy::compression_candidates(&set.snapshots, compression.keep_uncompressed, &report.deleted);
            for snapshot in candidates {
                match compress::compress_snapshot(&snapshot.path, compression.level) {
                    Ok(_) => report.compressed.push(snapshot.id),
                    Err(e) => warn!(id = %snapshot.id, error = %e, "Snapshot compression failed"),
                }
            }
        }

        report.remaining = set.len() - report.deleted.len();
        Ok(report)
    }
}

/// Take a snapshot out of the set, then delete it.
///
/// The rename to a staging name is the point of no return: once it succeeds
/// the directory is no longer a snapshot, and whatever `remove_dir_all` leaves
/// behind is purged as an orphan on a later pass.
fn retire(path: &Path) -> Result<()> {
    let mut staged = path.as_os_str().to_os_string();
    staged.push(STAGING_SUFFIX);
    let staged = PathBuf::from(staged);

    fs::rename(path, &staged).map_err(|source| BrowsessionError::PruneFailure {
        path: path.to_path_buf(),
        source,
    })?;

    if let Err(e) = fs::remove_dir_all(&staged) {
        warn!(path = %staged.display(), error = %e, "Partially deleted snapshot left for next pass");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::layout::{SnapshotKind, MARKER_FILE};
    use backup_set::tests::write_snapshot;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn manager(root: &Path, max_count: usize) -> RetentionManager {
        RetentionManager::new(
            root,
            SnapshotNaming::default(),
            RetentionPolicy {
                max_count: Some(max_count),
                ..Default::default()
            },
            None,
        )
    }

    #[test]
    fn test_prune_keeps_newest() -> Result<()> {
        let dir = TempDir::new()?;
        let naming = SnapshotNaming::default();
        let now = Utc::now();
        for id in 1..=6 {
            write_snapshot(dir.path(), &naming, id, SnapshotKind::Regular, now - ChronoDuration::minutes(10 - id as i64));
        }

        let report = manager(dir.path(), 2).prune()?;
        assert_eq!(
            report.deleted,
            vec![SnapshotId(1), SnapshotId(2), SnapshotId(3), SnapshotId(4)]
        );
        assert_eq!(report.remaining, 2);

        let set = BackupSet::scan(dir.path(), &naming)?;
        assert_eq!(set.ids(), vec![SnapshotId(5), SnapshotId(6)]);
        assert!(set.orphans.is_empty());
        Ok(())
    }

    #[test]
    fn test_zero_limit_keeps_one() -> Result<()> {
        let dir = TempDir::new()?;
        let naming = SnapshotNaming::default();
        for id in 1..=3 {
            write_snapshot(dir.path(), &naming, id, SnapshotKind::Regular, Utc::now());
        }

        let report = manager(dir.path(), 0).prune()?;
        assert_eq!(report.remaining, 1);
        assert_eq!(BackupSet::scan(dir.path(), &naming)?.ids(), vec![SnapshotId(3)]);
        Ok(())
    }

    #[test]
    fn test_orphans_purged_without_touching_snapshots() -> Result<()> {
        let dir = TempDir::new()?;
        let naming = SnapshotNaming::default();
        let now = Utc::now();
        let kept = write_snapshot(dir.path(), &naming, 1, SnapshotKind::Regular, now);

        let staging = dir
            .path()
            .join(naming.staging_name(SnapshotId(2), SnapshotKind::Regular, now));
        fs::create_dir_all(staging.join("Sessions"))?;
        fs::write(staging.join("Sessions/Session_1"), b"half")?;
        fs::write(dir.path().join("unrelated.txt"), b"keep me")?;

        let report = manager(dir.path(), 5).prune()?;
        assert_eq!(report.purged_orphans, vec![staging.clone()]);
        assert!(report.deleted.is_empty());
        assert!(!staging.exists());
        assert!(kept.join(MARKER_FILE).exists());
        assert!(dir.path().join("unrelated.txt").exists());
        Ok(())
    }

    #[test]
    fn test_compresses_older_snapshots() -> Result<()> {
        let dir = TempDir::new()?;
        let naming = SnapshotNaming::default();
        for id in 1..=3 {
            write_snapshot(dir.path(), &naming, id, SnapshotKind::Regular, Utc::now());
        }

        let manager = RetentionManager::new(
            dir.path(),
            naming.clone(),
            RetentionPolicy {
                max_count: Some(2),
                ..Default::default()
            },
            Some(CompressionPolicy {
                keep_uncompressed: 1,
                level: 3,
            }),
        );
        let report = manager.prune()?;
        assert_eq!(report.deleted, vec![SnapshotId(1)]);
        assert_eq!(report.compressed, vec![SnapshotId(2)]);

        let set = BackupSet::scan(dir.path(), &naming)?;
        assert!(set.snapshots[0].compressed);
        assert!(!set.snapshots[1].compressed);
        Ok(())
    }

    #[test]
    fn test_foreign_numbered_directory_survives() -> Result<()> {
        let dir = TempDir::new()?;
        let naming = SnapshotNaming::default();
        write_snapshot(dir.path(), &naming, 1, SnapshotKind::Regular, Utc::now());
        let photos = dir.path().join("2023 photos");
        fs::create_dir(&photos)?;
        fs::write(photos.join("img.jpg"), b"jpeg")?;
        let padded = dir.path().join("000004 notes.partial");
        fs::create_dir(&padded)?;

        let report = manager(dir.path(), 5).prune()?;
        assert!(report.purged_orphans.is_empty());
        assert!(photos.join("img.jpg").exists());
        assert!(padded.exists());
        assert_eq!(BackupSet::scan(dir.path(), &naming)?.next_id(), SnapshotId(2));
        Ok(())
    }

    #[test]
    fn test_failed_deletion_is_reported_and_retried() -> Result<()> {
        let dir = TempDir::new()?;
        let naming = SnapshotNaming::default();
        let now = Utc::now();
        let oldest = write_snapshot(dir.path(), &naming, 1, SnapshotKind::Regular, now - ChronoDuration::minutes(2));
        write_snapshot(dir.path(), &naming, 2, SnapshotKind::Regular, now);

        // A plain file where the rename target would go blocks the retirement
        let mut blocker = oldest.as_os_str().to_os_string();
        blocker.push(STAGING_SUFFIX);
        let blocker = PathBuf::from(blocker);
        fs::write(&blocker, b"in the way")?;

        let manager = manager(dir.path(), 1);
        let report = manager.prune()?;
        assert!(report.deleted.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, SnapshotId(1));
        assert!(report.failed[0].1.starts_with("Failed to prune"));
        assert_eq!(report.remaining, 2);
        assert_eq!(manager.scan()?.ids(), vec![SnapshotId(1), SnapshotId(2)]);

        fs::remove_file(&blocker)?;
        let report = manager.prune()?;
        assert_eq!(report.deleted, vec![SnapshotId(1)]);
        assert!(report.failed.is_empty());
        assert!(!oldest.exists());
        assert_eq!(manager.scan()?.ids(), vec![SnapshotId(2)]);
        Ok(())
    }
}
