//! Snapshot metadata record.
//!
//! Serialized as `snapshot.json` in each snapshot directory. It records why the
//! snapshot was taken, what happened to every attempted source, and the size
//! and mtime of each captured file so later runs can tell whether anything
//! changed since.

use super::layout::{SnapshotId, SnapshotKind, MANIFEST_FILE, TEMP_SUFFIX};
use super::{FileCategory, FileOutcome, SnapshotStatus, Trigger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub version: u32,
    pub id: SnapshotId,
    pub kind: SnapshotKind,
    pub created_at: DateTime<Utc>,
    pub trigger: Trigger,
    pub status: SnapshotStatus,
    /// Captured files are stored zstd-compressed with a `.zst` suffix
    #[serde(default)]
    pub compressed: bool,
    pub records: Vec<FileRecord>,
    /// Every captured file, keyed by its path relative to the profile
    pub files: BTreeMap<String, ManifestEntry>,
}

/// Outcome for one attempted source path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub category: FileCategory,
    /// Path relative to the profile, or the configured pattern if nothing matched
    pub source: String,
    #[serde(flatten)]
    pub outcome: FileOutcome,
}

/// Size and mtime of a captured file, as seen when it was copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub size: u64,
    pub mtime: i64,
}

pub const MANIFEST_VERSION: u32 = 1;

impl SnapshotManifest {
    pub fn load(snapshot_dir: &Path) -> crate::Result<Self> {
        let data = fs::read(snapshot_dir.join(MANIFEST_FILE))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Write (or rewrite) the record via temp file and rename.
    pub fn store(&self, snapshot_dir: &Path) -> crate::Result<()> {
        let payload = serde_json::to_vec_pretty(self)?;
        let final_path = snapshot_dir.join(MANIFEST_FILE);
        let tmp_path = snapshot_dir.join(format!("{}{}", MANIFEST_FILE, TEMP_SUFFIX));

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// True when `current` describes exactly the files this snapshot captured.
    pub fn matches_sources(&self, current: &BTreeMap<String, ManifestEntry>) -> bool {
        !self.files.is_empty() && &self.files == current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SkipReason;
    use tempfile::TempDir;

    fn sample() -> SnapshotManifest {
        let mut files = BTreeMap::new();
        files.insert(
            "Current Session".to_string(),
            ManifestEntry { size: 10, mtime: 1_700_000_000_000 },
        );
        SnapshotManifest {
            version: MANIFEST_VERSION,
            id: SnapshotId(3),
            kind: SnapshotKind::Regular,
            created_at: Utc::now(),
            trigger: Trigger::BrowserStopped,
            status: SnapshotStatus::Partial,
            compressed: false,
            records: vec![
                FileRecord {
                    category: FileCategory::Main,
                    source: "Current Session".to_string(),
                    outcome: FileOutcome::Copied { files: 1, bytes: 10, skipped_files: 0 },
                },
                FileRecord {
                    category: FileCategory::Main,
                    source: "Current Tabs".to_string(),
                    outcome: FileOutcome::Skipped { reason: SkipReason::Locked },
                },
            ],
            files,
        }
    }

    #[test]
    fn test_store_and_load() -> crate::Result<()> {
        let dir = TempDir::new()?;
        let manifest = sample();
        manifest.store(dir.path())?;

        assert!(!dir.path().join(format!("{}{}", MANIFEST_FILE, TEMP_SUFFIX)).exists());

        let loaded = SnapshotManifest::load(dir.path())?;
        assert_eq!(loaded.id, SnapshotId(3));
        assert_eq!(loaded.status, SnapshotStatus::Partial);
        assert_eq!(loaded.records, manifest.records);
        Ok(())
    }

    #[test]
    fn test_outcome_is_readable_json() -> crate::Result<()> {
        let json = serde_json::to_value(&sample())?;
        assert_eq!(json["records"][1]["outcome"], "skipped");
        assert_eq!(json["records"][1]["reason"], "locked");
        assert_eq!(json["trigger"], "browser-stopped");
        Ok(())
    }

    #[test]
    fn test_matches_sources() {
        let manifest = sample();
        let mut current = manifest.files.clone();
        assert!(manifest.matches_sources(&current));

        current.get_mut("Current Session").unwrap().mtime += 1;
        assert!(!manifest.matches_sources(&current));
        assert!(!manifest.matches_sources(&BTreeMap::new()));
    }
}
