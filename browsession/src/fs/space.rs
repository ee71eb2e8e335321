//! Free space queries for the emergency trigger.

use std::io;
use std::path::Path;

/// Bytes available to this process on the volume holding `path`.
pub fn available_space(path: &Path) -> io::Result<u64> {
    fs2::available_space(path)
}
