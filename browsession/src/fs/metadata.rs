//! File metadata handling for snapshot copies.
//!
//! Copies keep the source's modification time and (on Unix) permission bits,
//! and the same size/mtime pair doubles as a cheap change fingerprint.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// File metadata captured from a snapshot source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Last modified time (milliseconds since Unix epoch)
    pub modified: i64,

    /// File permissions (Unix mode bits)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
}

impl FileMetadata {
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        let modified = metadata
            .modified()
            .map(system_time_to_millis)
            .unwrap_or_default();

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let permissions = None;

        Self {
            size: metadata.len(),
            modified,
            permissions,
        }
    }

    /// Modification time as a `SystemTime`
    pub fn modified_time(&self) -> SystemTime {
        if self.modified >= 0 {
            UNIX_EPOCH + Duration::from_millis(self.modified as u64)
        } else {
            UNIX_EPOCH - Duration::from_millis(self.modified.unsigned_abs())
        }
    }

    /// Apply modification time and permissions to a copied file
    pub fn apply_to_file(&self, file: &fs::File) -> std::io::Result<()> {
        file.set_modified(self.modified_time())?;

        #[cfg(unix)]
        if let Some(mode) = self.permissions {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(mode))?;
        }

        Ok(())
    }
}

fn system_time_to_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_millis() as i64,
        Err(before) => -(before.duration().as_millis() as i64),
    }
}

/// Newest modification time among `paths`, descending into directories.
///
/// Paths that do not exist are ignored. Returns `None` when nothing was found.
pub fn newest_modification<'a, I>(paths: I) -> Option<SystemTime>
where
    I: IntoIterator<Item = &'a Path>,
{
    let mut newest: Option<SystemTime> = None;

    for path in paths {
        for entry in walkdir::WalkDir::new(path).into_iter().flatten() {
            let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
                continue;
            };
            if newest.map_or(true, |current| modified > current) {
                newest = Some(modified);
            }
        }
    }

    newest
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_extract_metadata() -> std::io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let metadata = FileMetadata::from_metadata(&fs::metadata(temp_file.path())?);

        assert_eq!(metadata.size, 12);
        assert!(metadata.modified > 0);

        Ok(())
    }

    #[test]
    fn test_apply_preserves_mtime() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("source");
        let copy = dir.path().join("copy");
        fs::write(&source, b"abc")?;
        fs::write(&copy, b"abc")?;

        let old = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options().write(true).open(&source)?.set_modified(old)?;

        let meta = FileMetadata::from_metadata(&fs::metadata(&source)?);
        meta.apply_to_file(&fs::File::options().write(true).open(&copy)?)?;

        let copied = FileMetadata::from_metadata(&fs::metadata(&copy)?);
        assert_eq!(copied.modified, meta.modified);
        Ok(())
    }

    #[test]
    fn test_newest_modification_descends() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir(dir.path().join("Sessions"))?;
        let old_file = dir.path().join("Preferences");
        let new_file = dir.path().join("Sessions/Session_1");
        fs::write(&old_file, b"{}")?;
        fs::write(&new_file, b"tabs")?;

        let old = SystemTime::now() - Duration::from_secs(7200);
        let new = SystemTime::now() - Duration::from_secs(60);
        fs::File::options().write(true).open(&old_file)?.set_modified(old)?;
        fs::File::options().write(true).open(&new_file)?.set_modified(new)?;
        fs::File::open(dir.path().join("Sessions"))
            .and_then(|d| d.set_modified(old))
            .ok();

        let found = newest_modification([old_file.as_path(), dir.path().join("Sessions").as_path()]);
        let found = found.expect("newest modification");
        assert!(found >= new - Duration::from_secs(1));

        assert!(newest_modification([dir.path().join("missing").as_path()]).is_none());
        Ok(())
    }
}
