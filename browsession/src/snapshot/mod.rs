//! File snapshot engine.
//!
//! Copies the configured profile files into a staging directory under the
//! backup root and only then publishes it: every per-file operation finishes,
//! the manifest is written, the completion marker is created, and the staging
//! directory is renamed to its final name. A run that dies anywhere before the
//! rename leaves a `.partial` directory that retention later purges.

pub mod copy;
pub mod layout;
pub mod manifest;

use crate::fs::pattern;
use crate::utils::errors::{BrowsessionError, Result};
use chrono::{DateTime, Utc};
use copy::{copy_file_atomic, copy_tree, CopyError, CopyPolicy};
use layout::{SnapshotId, SnapshotKind, SnapshotNaming, MARKER_FILE};
use manifest::{FileRecord, ManifestEntry, SnapshotManifest, MANIFEST_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    /// Always attempted; a miss degrades the snapshot
    Main,
    /// Best-effort, and left out of emergency snapshots
    Extra,
}

/// One configured source, relative to the browser profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    pub category: FileCategory,
    /// File or directory; `*` and `?` allowed in the last component
    pub pattern: String,
}

impl FileSpec {
    pub fn main(pattern: impl Into<String>) -> Self {
        Self {
            category: FileCategory::Main,
            pattern: pattern.into(),
        }
    }

    pub fn extra(pattern: impl Into<String>) -> Self {
        Self {
            category: FileCategory::Extra,
            pattern: pattern.into(),
        }
    }
}

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    BrowserStarted,
    BrowserStopped,
    Periodic,
    Manual,
    Emergency,
}

impl Trigger {
    pub fn kind(self) -> SnapshotKind {
        match self {
            Trigger::Emergency => SnapshotKind::Emergency,
            _ => SnapshotKind::Regular,
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Trigger::BrowserStarted => "browser-started",
            Trigger::BrowserStopped => "browser-stopped",
            Trigger::Periodic => "periodic",
            Trigger::Manual => "manual",
            Trigger::Emergency => "emergency",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    NotFound,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailReason {
    NotFound,
    Io(String),
}

/// What happened to one attempted source path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum FileOutcome {
    Copied {
        files: usize,
        bytes: u64,
        /// Files inside a copied directory that stayed locked or vanished
        #[serde(default)]
        skipped_files: usize,
    },
    Skipped {
        reason: SkipReason,
    },
    Failed {
        reason: FailReason,
    },
}

impl FileOutcome {
    /// Fully captured, with nothing inside skipped
    pub fn is_complete(&self) -> bool {
        matches!(self, FileOutcome::Copied { skipped_files: 0, .. })
    }

    pub fn captured_files(&self) -> usize {
        match self {
            FileOutcome::Copied { files, .. } => *files,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    /// Every main source captured in full
    Complete,
    /// Something captured, but at least one main source was not
    Partial,
    /// Nothing captured at all
    Empty,
}

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SnapshotStatus::Complete => "complete",
            SnapshotStatus::Partial => "partial",
            SnapshotStatus::Empty => "empty",
        };
        f.write_str(label)
    }
}

/// Parameters of one snapshot run
#[derive(Debug, Clone, Copy)]
pub struct SnapshotRequest {
    pub id: SnapshotId,
    pub trigger: Trigger,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SnapshotResult {
    pub id: SnapshotId,
    pub path: PathBuf,
    pub per_file: Vec<FileRecord>,
    pub status: SnapshotStatus,
}

impl SnapshotResult {
    /// Main sources that were not captured in full
    pub fn main_misses(&self) -> usize {
        self.per_file
            .iter()
            .filter(|r| r.category == FileCategory::Main && !r.outcome.is_complete())
            .count()
    }
}

/// Copies a browser profile's configured files into the backup root.
#[derive(Debug, Clone)]
pub struct SnapshotEngine {
    profile: PathBuf,
    policy: CopyPolicy,
    naming: SnapshotNaming,
}

impl SnapshotEngine {
    pub fn new(profile: impl Into<PathBuf>, policy: CopyPolicy, naming: SnapshotNaming) -> Self {
        Self {
            profile: profile.into(),
            policy,
            naming,
        }
    }

    pub fn naming(&self) -> &SnapshotNaming {
        &self.naming
    }

    /// Capture `specs` into a new snapshot under `root`.
    ///
    /// Extra specs are ignored for emergency snapshots. Source problems are
    /// recorded per file; only destination failures, contention on the
    /// snapshot name, or cancellation end the run with an error, and each of
    /// those leaves the staging directory unpublished.
    pub fn snapshot(
        &self,
        specs: &[FileSpec],
        request: SnapshotRequest,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<SnapshotResult> {
        let kind = request.trigger.kind();
        fs::create_dir_all(root).map_err(|e| BrowsessionError::unwritable(root, e))?;

        let final_path = root.join(self.naming.dir_name(request.id, kind, request.created_at));
        let staging = root.join(self.naming.staging_name(request.id, kind, request.created_at));

        match fs::create_dir(&staging) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(BrowsessionError::Contention {
                    path: staging,
                    reason: "staging directory already exists".to_string(),
                })
            }
            Err(e) => return Err(BrowsessionError::unwritable(&staging, e)),
        }

        info!(
            id = %request.id,
            trigger = %request.trigger,
            path = %staging.display(),
            "Capturing snapshot"
        );

        let mut records = Vec::new();
        let mut files = BTreeMap::new();

        for spec in specs {
            if kind == SnapshotKind::Emergency && spec.category == FileCategory::Extra {
                continue;
            }
            if cancel.is_cancelled() {
                warn!(id = %request.id, "Snapshot cancelled, leaving staging directory");
                return Err(BrowsessionError::Cancelled);
            }
            self.capture_spec(spec, &staging, &mut records, &mut files)?;
        }

        let status = overall_status(&records);
        let manifest = SnapshotManifest {
            version: MANIFEST_VERSION,
            id: request.id,
            kind,
            created_at: request.created_at,
            trigger: request.trigger,
            status,
            compressed: false,
            records,
            files,
        };
        manifest.store(&staging).map_err(|e| match e {
            BrowsessionError::Io(io) => BrowsessionError::unwritable(&staging, io),
            other => other,
        })?;

        publish(&staging, &final_path)?;

        info!(
            id = %request.id,
            status = %status,
            path = %final_path.display(),
            "Snapshot published"
        );

        Ok(SnapshotResult {
            id: request.id,
            path: final_path,
            per_file: manifest.records,
            status,
        })
    }

    fn capture_spec(
        &self,
        spec: &FileSpec,
        staging: &Path,
        records: &mut Vec<FileRecord>,
        files: &mut BTreeMap<String, ManifestEntry>,
    ) -> Result<()> {
        let sources = match pattern::expand(&self.profile, &spec.pattern) {
            Ok(sources) => sources,
            Err(e) => {
                warn!(pattern = %spec.pattern, error = %e, "Cannot resolve source");
                records.push(FileRecord {
                    category: spec.category,
                    source: spec.pattern.clone(),
                    outcome: FileOutcome::Failed {
                        reason: FailReason::Io(e.to_string()),
                    },
                });
                return Ok(());
            }
        };

        if sources.is_empty() {
            let outcome = missing_outcome(spec.category);
            debug!(pattern = %spec.pattern, ?outcome, "Source not found");
            records.push(FileRecord {
                category: spec.category,
                source: spec.pattern.clone(),
                outcome,
            });
            return Ok(());
        }

        for source in sources {
            let relative = source
                .strip_prefix(&self.profile)
                .unwrap_or(&source)
                .to_path_buf();
            let target = staging.join(&relative);
            let key = relative_key(&relative);

            let outcome = match self.copy_source(&source, &target, &relative, files) {
                Ok(outcome) => outcome,
                Err(CopyError::Destination(e)) => {
                    return Err(BrowsessionError::unwritable(&target, e))
                }
                Err(CopyError::NotFound) => missing_outcome(spec.category),
                Err(CopyError::Locked) => {
                    warn!(path = %source.display(), "Source stayed locked, skipped");
                    FileOutcome::Skipped {
                        reason: SkipReason::Locked,
                    }
                }
                Err(CopyError::Source(e)) => {
                    warn!(path = %source.display(), error = %e, "Source unreadable");
                    FileOutcome::Failed {
                        reason: FailReason::Io(e.to_string()),
                    }
                }
            };

            records.push(FileRecord {
                category: spec.category,
                source: key,
                outcome,
            });
        }

        Ok(())
    }

    fn copy_source(
        &self,
        source: &Path,
        target: &Path,
        relative: &Path,
        files: &mut BTreeMap<String, ManifestEntry>,
    ) -> std::result::Result<FileOutcome, CopyError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(CopyError::Destination)?;
        }

        if source.is_dir() {
            let tree = copy_tree(source, target, &self.policy)?;
            if tree.files.is_empty() && tree.locked_files > 0 {
                return Err(CopyError::Locked);
            }
            for (inner, copied) in &tree.files {
                files.insert(
                    relative_key(&relative.join(inner)),
                    ManifestEntry {
                        size: copied.metadata.size,
                        mtime: copied.metadata.modified,
                    },
                );
            }
            return Ok(FileOutcome::Copied {
                files: tree.files.len(),
                bytes: tree.bytes,
                skipped_files: tree.skipped_files,
            });
        }

        let copied = copy_file_atomic(source, target, &self.policy)?;
        files.insert(
            relative_key(relative),
            ManifestEntry {
                size: copied.metadata.size,
                mtime: copied.metadata.modified,
            },
        );
        Ok(FileOutcome::Copied {
            files: 1,
            bytes: copied.bytes,
            skipped_files: 0,
        })
    }

    /// Size and mtime of every file `specs` currently resolve to, keyed like
    /// [`SnapshotManifest::files`].
    pub fn fingerprint(&self, specs: &[FileSpec], kind: SnapshotKind) -> BTreeMap<String, ManifestEntry> {
        let mut entries = BTreeMap::new();

        for spec in specs {
            if kind == SnapshotKind::Emergency && spec.category == FileCategory::Extra {
                continue;
            }
            let Ok(sources) = pattern::expand(&self.profile, &spec.pattern) else {
                continue;
            };
            for source in sources {
                let walker = walkdir::WalkDir::new(&source)
                    .into_iter()
                    .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().ends_with(".tmp"));
                for entry in walker.flatten() {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let Ok(metadata) = entry.metadata() else {
                        continue;
                    };
                    let meta = crate::fs::metadata::FileMetadata::from_metadata(&metadata);
                    let relative = entry
                        .path()
                        .strip_prefix(&self.profile)
                        .unwrap_or(entry.path());
                    entries.insert(
                        relative_key(relative),
                        ManifestEntry {
                            size: meta.size,
                            mtime: meta.modified,
                        },
                    );
                }
            }
        }

        entries
    }
}

fn missing_outcome(category: FileCategory) -> FileOutcome {
    match category {
        FileCategory::Main => FileOutcome::Failed {
            reason: FailReason::NotFound,
        },
        FileCategory::Extra => FileOutcome::Skipped {
            reason: SkipReason::NotFound,
        },
    }
}

fn relative_key(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Classify a finished run from its per-file records.
pub fn overall_status(records: &[FileRecord]) -> SnapshotStatus {
    let captured: usize = records.iter().map(|r| r.outcome.captured_files()).sum();
    if captured == 0 {
        return SnapshotStatus::Empty;
    }

    let main_missed = records
        .iter()
        .any(|r| r.category == FileCategory::Main && !r.outcome.is_complete());
    if main_missed {
        SnapshotStatus::Partial
    } else {
        SnapshotStatus::Complete
    }
}

/// Write the completion marker and move the staging directory into place.
fn publish(staging: &Path, final_path: &Path) -> Result<()> {
    let marker = staging.join(MARKER_FILE);
    match OpenOptions::new().write(true).create_new(true).open(&marker) {
        Ok(file) => file.sync_all().map_err(|e| BrowsessionError::unwritable(&marker, e))?,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(BrowsessionError::Contention {
                path: marker,
                reason: "completion marker already present".to_string(),
            })
        }
        Err(e) => return Err(BrowsessionError::unwritable(&marker, e)),
    }

    if final_path.exists() {
        return Err(BrowsessionError::Contention {
            path: final_path.to_path_buf(),
            reason: "snapshot name already taken".to_string(),
        });
    }

    fs::rename(staging, final_path).map_err(|e| BrowsessionError::unwritable(final_path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::layout::{MANIFEST_FILE, STAGING_SUFFIX};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        profile: PathBuf,
        root: PathBuf,
        engine: SnapshotEngine,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let profile = dir.path().join("profile");
        let root = dir.path().join("backups");
        fs::create_dir_all(&profile).unwrap();
        let engine = SnapshotEngine::new(
            &profile,
            CopyPolicy {
                lock_retry_attempts: 2,
                lock_retry_delay: Duration::from_millis(5),
            },
            SnapshotNaming::default(),
        );
        Fixture {
            _dir: dir,
            profile,
            root,
            engine,
        }
    }

    fn request(id: u64, trigger: Trigger) -> SnapshotRequest {
        SnapshotRequest {
            id: SnapshotId(id),
            trigger,
            created_at: Utc::now(),
        }
    }

    fn entries(root: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_complete_snapshot() -> Result<()> {
        let fx = fixture();
        fs::write(fx.profile.join("session.dat"), b"tabs")?;
        fs::create_dir(fx.profile.join("Sessions"))?;
        fs::write(fx.profile.join("Sessions/Session_1"), b"s1")?;

        let specs = vec![FileSpec::main("session.dat"), FileSpec::main("Sessions")];
        let result = fx.engine.snapshot(
            &specs,
            request(1, Trigger::BrowserStopped),
            &fx.root,
            &CancellationToken::new(),
        )?;

        assert_eq!(result.status, SnapshotStatus::Complete);
        assert_eq!(fs::read(result.path.join("session.dat"))?, b"tabs");
        assert_eq!(fs::read(result.path.join("Sessions/Session_1"))?, b"s1");
        assert!(result.path.join(MARKER_FILE).exists());

        let manifest = SnapshotManifest::load(&result.path)?;
        assert_eq!(manifest.trigger, Trigger::BrowserStopped);
        assert_eq!(manifest.files.len(), 2);
        assert!(manifest.files.contains_key("Sessions/Session_1"));

        let names = entries(&fx.root);
        assert_eq!(names.len(), 1);
        assert!(!names[0].ends_with(STAGING_SUFFIX));
        Ok(())
    }

    #[test]
    fn test_missing_main_fails_missing_extra_skips() -> Result<()> {
        let fx = fixture();
        fs::write(fx.profile.join("session.dat"), b"tabs")?;

        let specs = vec![
            FileSpec::main("session.dat"),
            FileSpec::main("Current Tabs"),
            FileSpec::extra("History"),
        ];
        let result = fx.engine.snapshot(
            &specs,
            request(1, Trigger::Periodic),
            &fx.root,
            &CancellationToken::new(),
        )?;

        assert_eq!(result.status, SnapshotStatus::Partial);
        assert_eq!(
            result.per_file[1].outcome,
            FileOutcome::Failed { reason: FailReason::NotFound }
        );
        assert_eq!(
            result.per_file[2].outcome,
            FileOutcome::Skipped { reason: SkipReason::NotFound }
        );
        assert_eq!(result.main_misses(), 1);
        Ok(())
    }

    #[test]
    fn test_nothing_captured_is_empty_but_published() -> Result<()> {
        let fx = fixture();
        let result = fx.engine.snapshot(
            &[FileSpec::main("session.dat")],
            request(4, Trigger::Manual),
            &fx.root,
            &CancellationToken::new(),
        )?;

        assert_eq!(result.status, SnapshotStatus::Empty);
        assert!(result.path.join(MARKER_FILE).exists());
        assert!(result.path.join(MANIFEST_FILE).exists());
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_locked_main_file_gives_partial() -> Result<()> {
        use fs2::FileExt;

        let fx = fixture();
        fs::write(fx.profile.join("session.dat"), b"tabs")?;
        fs::write(fx.profile.join("Current Tabs"), b"locked")?;
        let holder = fs::File::open(fx.profile.join("Current Tabs"))?;
        FileExt::lock_exclusive(&holder)?;

        let specs = vec![FileSpec::main("session.dat"), FileSpec::main("Current Tabs")];
        let result = fx.engine.snapshot(
            &specs,
            request(2, Trigger::Periodic),
            &fx.root,
            &CancellationToken::new(),
        )?;

        assert_eq!(result.status, SnapshotStatus::Partial);
        assert_eq!(
            result.per_file[1].outcome,
            FileOutcome::Skipped { reason: SkipReason::Locked }
        );
        assert!(!result.path.join("Current Tabs").exists());
        Ok(())
    }

    #[test]
    fn test_emergency_leaves_out_extra() -> Result<()> {
        let fx = fixture();
        fs::write(fx.profile.join("session.dat"), b"tabs")?;
        fs::write(fx.profile.join("History"), b"heavy")?;

        let specs = vec![FileSpec::main("session.dat"), FileSpec::extra("History")];
        let result = fx.engine.snapshot(
            &specs,
            request(3, Trigger::Emergency),
            &fx.root,
            &CancellationToken::new(),
        )?;

        assert_eq!(result.per_file.len(), 1);
        assert!(!result.path.join("History").exists());
        assert!(result
            .path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("(emergency)"));
        Ok(())
    }

    #[test]
    fn test_wildcard_sources() -> Result<()> {
        let fx = fixture();
        fs::create_dir(fx.profile.join("Sessions"))?;
        fs::write(fx.profile.join("Sessions/Session_1"), b"a")?;
        fs::write(fx.profile.join("Sessions/Session_2"), b"b")?;
        fs::write(fx.profile.join("Sessions/Tabs_1"), b"c")?;

        let result = fx.engine.snapshot(
            &[FileSpec::main("Sessions/Session_*")],
            request(1, Trigger::Manual),
            &fx.root,
            &CancellationToken::new(),
        )?;

        assert_eq!(result.per_file.len(), 2);
        assert_eq!(result.per_file[0].source, "Sessions/Session_1");
        assert!(result.path.join("Sessions/Session_2").exists());
        assert!(!result.path.join("Sessions/Tabs_1").exists());
        Ok(())
    }

    #[test]
    fn test_cancelled_run_is_never_published() {
        let fx = fixture();
        fs::write(fx.profile.join("session.dat"), b"tabs").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = fx.engine.snapshot(
            &[FileSpec::main("session.dat")],
            request(9, Trigger::Periodic),
            &fx.root,
            &cancel,
        );

        assert!(matches!(result, Err(BrowsessionError::Cancelled)));
        let names = entries(&fx.root);
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(STAGING_SUFFIX));
        assert!(!fx.root.join(&names[0]).join(MARKER_FILE).exists());
    }

    #[test]
    fn test_existing_staging_is_contention() -> Result<()> {
        let fx = fixture();
        let req = request(5, Trigger::Periodic);
        let staging = fx
            .root
            .join(fx.engine.naming().staging_name(req.id, SnapshotKind::Regular, req.created_at));
        fs::create_dir_all(&staging)?;

        let result = fx.engine.snapshot(
            &[FileSpec::main("session.dat")],
            req,
            &fx.root,
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(BrowsessionError::Contention { .. })));
        Ok(())
    }

    #[test]
    fn test_fingerprint_tracks_changes() -> Result<()> {
        let fx = fixture();
        fs::write(fx.profile.join("session.dat"), b"tabs")?;

        let specs = vec![FileSpec::main("session.dat")];
        let result = fx.engine.snapshot(
            &specs,
            request(1, Trigger::Periodic),
            &fx.root,
            &CancellationToken::new(),
        )?;
        let manifest = SnapshotManifest::load(&result.path)?;

        let before = fx.engine.fingerprint(&specs, SnapshotKind::Regular);
        assert!(manifest.matches_sources(&before));

        fs::write(fx.profile.join("session.dat"), b"more tabs")?;
        let after = fx.engine.fingerprint(&specs, SnapshotKind::Regular);
        assert!(!manifest.matches_sources(&after));
        Ok(())
    }
}
