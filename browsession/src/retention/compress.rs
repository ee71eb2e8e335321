//! In-place zstd compression of aged snapshots.
//!
//! Every captured file `x` becomes `x.zst` (written to a temp name, then
//! renamed), after which `x` is removed and the manifest is flagged. Reruns
//! after a crash pick up where the last one stopped.

use crate::fs::walker::{walk_directory, WalkOptions};
use crate::snapshot::layout::{MANIFEST_FILE, MARKER_FILE, TEMP_SUFFIX};
use crate::snapshot::manifest::SnapshotManifest;
use crate::utils::errors::Result;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const COMPRESSED_SUFFIX: &str = ".zst";

/// Compress every captured file of the snapshot at `path`.
///
/// Returns the number of files compressed by this call.
pub fn compress_snapshot(path: &Path, level: i32) -> Result<usize> {
    let mut manifest = SnapshotManifest::load(path)?;
    if manifest.compressed {
        return Ok(0);
    }

    let options = WalkOptions {
        exclude_patterns: Vec::new(),
        ..WalkOptions::default()
    };
    let listing = walk_directory(path, &options)?;
    let mut compressed = 0;

    for file in listing.files {
        let name = file.path.file_name().unwrap_or_default().to_string_lossy().into_owned();

        if file.relative_path == Path::new(MANIFEST_FILE) || file.relative_path == Path::new(MARKER_FILE) {
            continue;
        }
        if name.ends_with(TEMP_SUFFIX) {
            // Leftover from an interrupted pass; may already be renamed away.
            match fs::remove_file(&file.path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => continue,
            }
        }
        if name.ends_with(COMPRESSED_SUFFIX) {
            continue;
        }

        let packed = with_suffix(&file.path, COMPRESSED_SUFFIX);
        if !packed.exists() {
            compress_file(&file.path, &packed, level)?;
            compressed += 1;
        }
        fs::remove_file(&file.path)?;
    }

    manifest.compressed = true;
    manifest.store(path)?;

    info!(id = %manifest.id, files = compressed, "Snapshot compressed");
    Ok(compressed)
}

fn compress_file(source: &Path, packed: &Path, level: i32) -> io::Result<()> {
    let tmp = with_suffix(packed, TEMP_SUFFIX);
    let mut reader = BufReader::new(File::open(source)?);
    let writer = File::create(&tmp)?;

    let mut encoder = zstd::stream::write::Encoder::new(writer, level)?;
    io::copy(&mut reader, &mut encoder)?;
    let writer = encoder.finish()?;
    writer.sync_all()?;
    drop(writer);

    // Keep the original mtime on the packed file for anyone browsing the root.
    if let Ok(modified) = fs::metadata(source).and_then(|m| m.modified()) {
        File::options().write(true).open(&tmp)?.set_modified(modified)?;
    }

    fs::rename(&tmp, packed)?;
    debug!(path = %packed.display(), "Compressed");
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retention::backup_set::tests::write_snapshot;
    use crate::snapshot::layout::{SnapshotKind, SnapshotNaming};
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_compress_snapshot_in_place() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_snapshot(
            dir.path(),
            &SnapshotNaming::default(),
            1,
            SnapshotKind::Regular,
            Utc::now(),
        );
        fs::create_dir(path.join("Sessions"))?;
        fs::write(path.join("Sessions/Session_1"), vec![b'x'; 4096])?;

        assert_eq!(compress_snapshot(&path, 3)?, 2);
        assert!(!path.join("session.dat").exists());
        assert!(path.join("session.dat.zst").exists());
        assert!(path.join("Sessions/Session_1.zst").exists());
        assert!(path.join(MARKER_FILE).exists());
        assert!(SnapshotManifest::load(&path)?.compressed);

        let packed = File::open(path.join("Sessions/Session_1.zst"))?;
        assert_eq!(zstd::stream::decode_all(packed)?, vec![b'x'; 4096]);

        // Second pass is a no-op
        assert_eq!(compress_snapshot(&path, 3)?, 0);
        Ok(())
    }

    #[test]
    fn test_resumes_after_interruption() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_snapshot(
            dir.path(),
            &SnapshotNaming::default(),
            2,
            SnapshotKind::Regular,
            Utc::now(),
        );
        fs::write(path.join("Preferences"), b"{}")?;

        // A previous pass packed session.dat but died before removing it,
        // and left a temp file behind for Preferences.
        compress_file(&path.join("session.dat"), &path.join("session.dat.zst"), 3)?;
        fs::write(path.join(format!("Preferences.zst{}", TEMP_SUFFIX)), b"junk")?;

        assert_eq!(compress_snapshot(&path, 3)?, 1);
        assert!(!path.join("session.dat").exists());
        assert!(path.join("Preferences.zst").exists());
        assert!(!path.join(format!("Preferences.zst{}", TEMP_SUFFIX)).exists());
        Ok(())
    }
}
