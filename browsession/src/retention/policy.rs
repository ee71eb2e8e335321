//! Which snapshots to delete and which to compress.
//!
//! Pure functions over a scanned [`BackupSet`](super::backup_set::BackupSet);
//! nothing here touches the disk.

use super::backup_set::SnapshotEntry;
use crate::snapshot::layout::{SnapshotId, SnapshotKind};
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep at most this many regular snapshots
    pub max_count: Option<usize>,

    /// Delete snapshots older than this
    pub max_age: Option<Duration>,

    /// Separate count limit for emergency snapshots (falls back to `max_count`)
    pub emergency_max_count: Option<usize>,
}

impl RetentionPolicy {
    fn count_limit(&self, kind: SnapshotKind) -> Option<usize> {
        match kind {
            SnapshotKind::Regular => self.max_count,
            SnapshotKind::Emergency => self.emergency_max_count.or(self.max_count),
        }
    }

    fn too_old(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match (self.max_age, (now - created_at).to_std()) {
            (Some(max_age), Ok(age)) => age > max_age,
            _ => false,
        }
    }
}

/// Ids to delete, oldest first.
///
/// `snapshots` must be sorted ascending by id. The newest snapshot is never
/// selected, so at least one survives whatever the policy says.
pub fn plan(snapshots: &[SnapshotEntry], policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<SnapshotId> {
    let Some(newest) = snapshots.last().map(|s| s.id) else {
        return Vec::new();
    };

    let mut doomed = Vec::new();

    for kind in [SnapshotKind::Regular, SnapshotKind::Emergency] {
        let group: Vec<&SnapshotEntry> = snapshots.iter().filter(|s| s.kind == kind).collect();
        let excess = policy
            .count_limit(kind)
            .map_or(0, |limit| group.len().saturating_sub(limit));

        for (index, snapshot) in group.iter().enumerate() {
            if index < excess || policy.too_old(snapshot.created_at, now) {
                doomed.push(snapshot.id);
            }
        }
    }

    doomed.retain(|id| *id != newest);
    doomed.sort();
    doomed.dedup();
    doomed
}

/// Snapshots to compress: everything older than the newest `keep_uncompressed`
/// of each kind that is not compressed yet. `doomed` ids are left out.
pub fn compression_candidates<'a>(
    snapshots: &'a [SnapshotEntry],
    keep_uncompressed: usize,
    doomed: &[SnapshotId],
) -> Vec<&'a SnapshotEntry> {
    let mut candidates = Vec::new();

    for kind in [SnapshotKind::Regular, SnapshotKind::Emergency] {
        let group: Vec<&SnapshotEntry> = snapshots
            .iter()
            .filter(|s| s.kind == kind && !doomed.contains(&s.id))
            .collect();
        let cutoff = group.len().saturating_sub(keep_uncompressed);
        candidates.extend(group[..cutoff].iter().filter(|s| !s.compressed).copied());
    }

    candidates.sort_by_key(|s| s.id);
    candidates
}
