//! Directory traversal for snapshotting profile subdirectories.
//!
//! Browsers rewrite files inside their profile while we walk it, so entries
//! that disappear or become unreadable mid-walk are counted and skipped
//! instead of aborting the traversal.

use super::pattern::Wildcard;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Entry names to leave out (wildcards allowed)
    pub exclude_patterns: Vec<Wildcard>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            // Browser scratch files; never meaningful in a snapshot.
            exclude_patterns: vec![Wildcard::new("*.tmp").expect("static pattern")],
        }
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> Self {
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        Self { path, relative_path }
    }
}

/// Result of walking a directory tree
#[derive(Debug, Default)]
pub struct WalkListing {
    /// Regular files found, in walk order
    pub files: Vec<FileInfo>,

    /// Entries that vanished or could not be read during the walk
    pub unreadable: usize,
}

/// Walk a directory tree and collect all regular files.
///
/// Fails only if `root` itself cannot be read.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<WalkListing> {
    // Surface a missing or unreadable root as an error rather than an empty listing.
    std::fs::read_dir(root)?;

    let mut listing = WalkListing::default();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !should_exclude(entry, &options.exclude_patterns));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "Skipping unreadable entry");
                listing.unreadable += 1;
                continue;
            }
        };

        // Only regular files are copied; directories are recreated from file paths.
        if !entry.file_type().is_file() {
            continue;
        }

        listing.files.push(FileInfo::from_entry(&entry, root));
    }

    Ok(listing)
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[Wildcard]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| pattern.is_match(&file_name))
}
