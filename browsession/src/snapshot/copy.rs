//! Crash-safe copying of files the browser may be holding open.
//!
//! Each file is written to `<name>.bsk-tmp` beside its destination, synced,
//! and renamed into place, so an interrupted copy never leaves a truncated
//! file under its final name. A source held under an exclusive lock is
//! retried a fixed number of times and then reported as locked; the lock is
//! never broken.

use crate::fs::metadata::FileMetadata;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::snapshot::layout::TEMP_SUFFIX;
use fs2::FileExt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Retry policy for sources held under a lock
#[derive(Debug, Clone, Copy)]
pub struct CopyPolicy {
    /// Total attempts per file, including the first
    pub lock_retry_attempts: u32,

    /// Fixed pause between attempts
    pub lock_retry_delay: Duration,
}

impl Default for CopyPolicy {
    fn default() -> Self {
        Self {
            lock_retry_attempts: 3,
            lock_retry_delay: Duration::from_millis(250),
        }
    }
}

#[derive(Debug)]
pub enum CopyError {
    /// Source does not exist (or vanished before it could be opened)
    NotFound,
    /// Source stayed locked through every attempt
    Locked,
    /// Reading the source failed for another reason
    Source(io::Error),
    /// Writing under the backup root failed
    Destination(io::Error),
}

impl std::fmt::Display for CopyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyError::NotFound => write!(f, "not found"),
            CopyError::Locked => write!(f, "locked"),
            CopyError::Source(e) => write!(f, "read failed: {}", e),
            CopyError::Destination(e) => write!(f, "write failed: {}", e),
        }
    }
}

/// A copied file
#[derive(Debug, Clone, Copy)]
pub struct CopiedFile {
    pub bytes: u64,
    pub metadata: FileMetadata,
}

/// A copied directory tree
#[derive(Debug, Default)]
pub struct CopiedTree {
    /// Captured files, relative to the tree root
    pub files: Vec<(PathBuf, CopiedFile)>,
    pub bytes: u64,
    /// Files that stayed locked or vanished mid-copy
    pub skipped_files: usize,
    /// Files skipped because they stayed locked
    pub locked_files: usize,
}

/// Copy one file, retrying while it is locked.
pub fn copy_file_atomic(src: &Path, dst: &Path, policy: &CopyPolicy) -> Result<CopiedFile, CopyError> {
    let attempts = policy.lock_retry_attempts.max(1);

    for attempt in 1..=attempts {
        match try_copy_file(src, dst) {
            Err(CopyError::Locked) if attempt < attempts => {
                debug!(
                    path = %src.display(),
                    attempt,
                    attempts,
                    "Source locked, retrying"
                );
                thread::sleep(policy.lock_retry_delay);
            }
            result => return result,
        }
    }

    Err(CopyError::Locked)
}

/// Copy a directory tree file by file, preserving relative structure.
///
/// Individual files that stay locked or vanish are counted and skipped.
/// A destination failure aborts the whole tree.
pub fn copy_tree(src: &Path, dst: &Path, policy: &CopyPolicy) -> Result<CopiedTree, CopyError> {
    let listing = walk_directory(src, &WalkOptions::default()).map_err(classify_source_error)?;

    fs::create_dir_all(dst).map_err(CopyError::Destination)?;

    let mut tree = CopiedTree {
        skipped_files: listing.unreadable,
        ..CopiedTree::default()
    };

    for file in listing.files {
        let target = dst.join(&file.relative_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(CopyError::Destination)?;
        }

        match copy_file_atomic(&file.path, &target, policy) {
            Ok(copied) => {
                tree.bytes += copied.bytes;
                tree.files.push((file.relative_path, copied));
            }
            Err(CopyError::Destination(e)) => return Err(CopyError::Destination(e)),
            Err(CopyError::Locked) => {
                warn!(path = %file.path.display(), "Skipping locked file");
                tree.skipped_files += 1;
                tree.locked_files += 1;
            }
            Err(e) => {
                warn!(path = %file.path.display(), error = %e, "Skipping unreadable file");
                tree.skipped_files += 1;
            }
        }
    }

    Ok(tree)
}

fn try_copy_file(src: &Path, dst: &Path) -> Result<CopiedFile, CopyError> {
    let mut source = File::open(src).map_err(classify_source_error)?;

    match FileExt::try_lock_shared(&source) {
        Ok(()) => {}
        Err(e) if is_lock_contention(&e) => return Err(CopyError::Locked),
        // Some filesystems do not support advisory locks; copy unguarded.
        Err(e) => debug!(path = %src.display(), error = %e, "Lock probe unsupported"),
    }

    let result = write_via_temp(&mut source, dst);
    let _ = FileExt::unlock(&source);
    result
}

fn write_via_temp(source: &mut File, dst: &Path) -> Result<CopiedFile, CopyError> {
    let metadata = FileMetadata::from_metadata(&source.metadata().map_err(classify_source_error)?);
    let tmp = temp_path(dst);

    let outcome = commit_copy(source, &tmp, dst, metadata);
    if outcome.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    outcome
}

fn commit_copy(
    source: &mut File,
    tmp: &Path,
    dst: &Path,
    metadata: FileMetadata,
) -> Result<CopiedFile, CopyError> {
    let mut target = File::create(tmp).map_err(CopyError::Destination)?;
    let bytes = pump(source, &mut target)?;
    target.sync_all().map_err(CopyError::Destination)?;
    metadata.apply_to_file(&target).map_err(CopyError::Destination)?;
    drop(target);
    fs::rename(tmp, dst).map_err(CopyError::Destination)?;
    Ok(CopiedFile { bytes, metadata })
}

fn pump(source: &mut File, target: &mut File) -> Result<u64, CopyError> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = match source.read(&mut buffer) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(classify_source_error(e)),
        };
        target
            .write_all(&buffer[..read])
            .map_err(CopyError::Destination)?;
        total += read as u64;
    }
}

fn temp_path(dst: &Path) -> PathBuf {
    let mut name = dst.file_name().unwrap_or_default().to_os_string();
    name.push(TEMP_SUFFIX);
    dst.with_file_name(name)
}

fn classify_source_error(e: io::Error) -> CopyError {
    if e.kind() == io::ErrorKind::NotFound {
        CopyError::NotFound
    } else if is_sharing_violation(&e) {
        CopyError::Locked
    } else {
        CopyError::Source(e)
    }
}

pub(crate) fn is_lock_contention(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Windows refuses to open or read files another process holds exclusively.
pub(crate) fn is_sharing_violation(e: &io::Error) -> bool {
    #[cfg(windows)]
    {
        // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
        matches!(e.raw_os_error(), Some(32) | Some(33))
    }
    #[cfg(not(windows))]
    {
        let _ = e;
        false
    }
}
