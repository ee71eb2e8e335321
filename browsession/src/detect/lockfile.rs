//! Lock-file based detection.
//!
//! Browsers leave traces in their profile while they run: a journal that is
//! only non-empty mid-session, a lock file, or files they keep open
//! exclusively. Each mode reads one of those traces.

use super::{BrowserState, StateProbe};
use crate::fs::pattern;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::snapshot::copy::{is_lock_contention, is_sharing_violation};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockProbeMode {
    /// Running while a matching file is held open exclusively by someone else
    Held,
    /// Running while a matching file exists
    Exists,
    /// Running while a matching file exists and is not empty
    NonEmpty,
    /// Running while no matching file exists
    Absent,
    /// Target is a directory; running while any file inside it is held
    AnyHeld,
}

pub struct LockFileProbe {
    profile: PathBuf,
    target: String,
    mode: LockProbeMode,
}

impl LockFileProbe {
    /// `target` is relative to `profile` and may end in a wildcard component.
    pub fn new(profile: impl Into<PathBuf>, target: impl Into<String>, mode: LockProbeMode) -> Self {
        Self {
            profile: profile.into(),
            target: target.into(),
            mode,
        }
    }

    fn probe(&self) -> io::Result<bool> {
        let matches = pattern::expand(&self.profile, &self.target)?;

        match self.mode {
            LockProbeMode::Exists => Ok(!matches.is_empty()),
            LockProbeMode::Absent => Ok(matches.is_empty()),
            LockProbeMode::NonEmpty => {
                for path in &matches {
                    match fs::metadata(path) {
                        Ok(meta) if meta.is_file() && meta.len() > 0 => return Ok(true),
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(false)
            }
            LockProbeMode::Held => {
                for path in &matches {
                    if is_held(path)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            LockProbeMode::AnyHeld => {
                let options = WalkOptions {
                    exclude_patterns: Vec::new(),
                    ..WalkOptions::default()
                };
                for dir in matches.iter().filter(|p| p.is_dir()) {
                    for file in walk_directory(dir, &options)?.files {
                        if is_held(&file.path)? {
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
        }
    }
}

impl StateProbe for LockFileProbe {
    fn observe(&mut self) -> BrowserState {
        match self.probe() {
            Ok(true) => BrowserState::Running,
            Ok(false) => BrowserState::Stopped,
            Err(e) => {
                debug!(target_path = %self.target, error = %e, "Lock probe inconclusive");
                BrowserState::Unknown
            }
        }
    }

    fn name(&self) -> &'static str {
        "lock-file"
    }
}

/// Whether another handle holds `path` exclusively. A file that has gone away
/// is not held.
fn is_held(path: &Path) -> io::Result<bool> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) if is_sharing_violation(&e) => return Ok(true),
        Err(e) => return Err(e),
    };

    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            FileExt::unlock(&file)?;
            Ok(false)
        }
        Err(e) if is_lock_contention(&e) || is_sharing_violation(&e) => Ok(true),
        Err(e) => Err(e),
    }
}
