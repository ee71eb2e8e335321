//! Names and reserved files inside the backup root.
//!
//! ```text
//! <root>/000041 2026-10-19 09-12-03 (regular)/           finished snapshot
//! <root>/000042 2026-10-19 09-30-00 (emergency).partial/ staging or being deleted
//! ```

use chrono::format::{self, Parsed, StrftimeItems};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker written last into a staging directory, before its final rename.
pub const MARKER_FILE: &str = ".complete";

/// Metadata record of a snapshot.
pub const MANIFEST_FILE: &str = "snapshot.json";

/// Suffix of directories that are not (or no longer) valid snapshots.
pub const STAGING_SUFFIX: &str = ".partial";

/// Suffix of files being written, renamed away once complete.
pub const TEMP_SUFFIX: &str = ".bsk-tmp";

/// Sequence id of a snapshot within one backup root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    pub fn next(self) -> Self {
        SnapshotId(self.0 + 1)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Main and Extra files, taken on state changes, timer ticks or on demand
    Regular,
    /// Main files only, taken when the profile volume runs out of space
    Emergency,
}

/// What a directory name under the backup root says about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub id: SnapshotId,
    pub kind: SnapshotKind,
    pub staging: bool,
}

/// Renders and parses snapshot directory names.
#[derive(Debug, Clone)]
pub struct SnapshotNaming {
    pub datetime_format: String,
    pub regular_tag: String,
    pub emergency_tag: String,
}

impl Default for SnapshotNaming {
    fn default() -> Self {
        Self {
            datetime_format: "%Y-%m-%d %H-%M-%S".to_string(),
            regular_tag: "regular".to_string(),
            emergency_tag: "emergency".to_string(),
        }
    }
}

impl SnapshotNaming {
    pub fn tag(&self, kind: SnapshotKind) -> &str {
        match kind {
            SnapshotKind::Regular => &self.regular_tag,
            SnapshotKind::Emergency => &self.emergency_tag,
        }
    }

    /// Final directory name; the timestamp is rendered in local time.
    pub fn dir_name(&self, id: SnapshotId, kind: SnapshotKind, created_at: DateTime<Utc>) -> String {
        let stamp = created_at
            .with_timezone(&Local)
            .format(&self.datetime_format);
        format!("{} {} ({})", id, stamp, self.tag(kind))
    }

    pub fn staging_name(&self, id: SnapshotId, kind: SnapshotKind, created_at: DateTime<Utc>) -> String {
        format!("{}{}", self.dir_name(id, kind, created_at), STAGING_SUFFIX)
    }

    /// Parse a directory name produced by this naming scheme.
    ///
    /// The whole name must match: sequence id, timestamp in the configured
    /// format, kind tag, and optionally the staging suffix. Anything else
    /// belongs to someone else and yields `None`.
    pub fn parse(&self, name: &str) -> Option<ParsedName> {
        let (base, staging) = match name.strip_suffix(STAGING_SUFFIX) {
            Some(base) => (base, true),
            None => (name, false),
        };

        let (digits, rest) = base.split_once(' ')?;
        if digits.len() < 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let id = SnapshotId(digits.parse().ok()?);

        let (stamp, kind) = [SnapshotKind::Regular, SnapshotKind::Emergency]
            .into_iter()
            .find_map(|kind| {
                let suffix = format!(" ({})", self.tag(kind));
                rest.strip_suffix(suffix.as_str()).map(|stamp| (stamp, kind))
            })?;
        if !self.is_stamp(stamp) {
            return None;
        }

        Some(ParsedName { id, kind, staging })
    }

    fn is_stamp(&self, stamp: &str) -> bool {
        let mut parsed = Parsed::new();
        !stamp.is_empty()
            && format::parse(&mut parsed, stamp, StrftimeItems::new(&self.datetime_format)).is_ok()
    }
}
