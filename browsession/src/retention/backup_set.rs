//! Discovery of snapshots under the backup root.
//!
//! Nothing about the backup set is kept across restarts; the directory tree
//! is scanned each time and is the only source of truth.

use crate::snapshot::layout::{SnapshotId, SnapshotKind, SnapshotNaming, MARKER_FILE};
use crate::snapshot::manifest::SnapshotManifest;
use crate::snapshot::SnapshotStatus;
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A published snapshot found on disk
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub id: SnapshotId,
    pub kind: SnapshotKind,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// `None` when the manifest could not be read
    pub status: Option<SnapshotStatus>,
    pub compressed: bool,
}

impl SnapshotEntry {
    pub fn manifest(&self) -> Result<SnapshotManifest> {
        SnapshotManifest::load(&self.path)
    }
}

/// All snapshots of one backup root, ascending by id.
#[derive(Debug, Clone)]
pub struct BackupSet {
    pub root: PathBuf,
    pub snapshots: Vec<SnapshotEntry>,
    /// Staging leftovers and unmarked directories from interrupted runs
    pub orphans: Vec<PathBuf>,
    /// Highest id seen on disk, orphans included
    pub highest_id: Option<SnapshotId>,
}

impl BackupSet {
    /// Scan `root`. A root that does not exist yet is an empty set.
    pub fn scan(root: &Path, naming: &SnapshotNaming) -> Result<Self> {
        let mut set = BackupSet {
            root: root.to_path_buf(),
            snapshots: Vec::new(),
            orphans: Vec::new(),
            highest_id: None,
        };

        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(set),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(parsed) = naming.parse(&name) else {
                continue;
            };
            if !entry.file_type()?.is_dir() {
                continue;
            }

            set.highest_id = set.highest_id.max(Some(parsed.id));
            let path = entry.path();

            if parsed.staging || !path.join(MARKER_FILE).exists() {
                debug!(path = %path.display(), "Found unfinished snapshot directory");
                set.orphans.push(path);
                continue;
            }

            set.snapshots.push(load_entry(path, parsed.id, parsed.kind));
        }

        set.snapshots.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.path.cmp(&b.path)));
        set.orphans.sort();

        for pair in set.snapshots.windows(2) {
            if pair[0].id == pair[1].id {
                warn!(
                    id = %pair[0].id,
                    first = %pair[0].path.display(),
                    second = %pair[1].path.display(),
                    "Two snapshots share one id"
                );
            }
        }

        Ok(set)
    }

    /// Id for the next snapshot: one past anything on disk
    pub fn next_id(&self) -> SnapshotId {
        self.highest_id.map_or(SnapshotId(1), SnapshotId::next)
    }

    /// Newest snapshot of `kind` whose manifest says it is complete
    pub fn latest_complete(&self, kind: SnapshotKind) -> Option<&SnapshotEntry> {
        self.snapshots
            .iter()
            .rev()
            .find(|s| s.kind == kind && s.status == Some(SnapshotStatus::Complete))
    }

    pub fn ids(&self) -> Vec<SnapshotId> {
        self.snapshots.iter().map(|s| s.id).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

fn load_entry(path: PathBuf, id: SnapshotId, kind_from_name: SnapshotKind) -> SnapshotEntry {
    match SnapshotManifest::load(&path) {
        Ok(manifest) => SnapshotEntry {
            id,
            kind: manifest.kind,
            created_at: manifest.created_at,
            status: Some(manifest.status),
            compressed: manifest.compressed,
            path,
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Snapshot manifest unreadable");
            let created_at = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            SnapshotEntry {
                id,
                kind: kind_from_name,
                created_at,
                status: None,
                compressed: false,
                path,
            }
        }
    }
}
