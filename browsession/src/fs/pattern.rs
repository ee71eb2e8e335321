//! Wildcard matching for configured profile paths.
//!
//! Only `*` (any run of characters) and `?` (one character) are special, and
//! only in the final path component. `Sessions/Session_*` works,
//! `*/Session_1` does not.

use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A compiled single-component wildcard pattern.
#[derive(Debug, Clone)]
pub struct Wildcard {
    regex: Regex,
}

impl Wildcard {
    /// Compile `pattern`. Matching follows the platform's file names:
    /// case-insensitive on Windows, case-sensitive elsewhere.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        if cfg!(windows) {
            expr.push_str("(?i)");
        }
        expr.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');

        Ok(Self {
            regex: Regex::new(&expr)?,
        })
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

pub fn has_wildcards(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

/// Resolve `pattern` (relative to `base`) to the paths that currently exist.
///
/// A literal pattern yields its path if it exists. A wildcard pattern yields
/// every entry of its parent directory whose name matches, sorted by name.
/// A missing parent directory yields nothing.
pub fn expand(base: &Path, pattern: &str) -> io::Result<Vec<PathBuf>> {
    let full = base.join(pattern);

    if !has_wildcards(pattern) {
        return Ok(if full.symlink_metadata().is_ok() {
            vec![full]
        } else {
            Vec::new()
        });
    }

    let name = match full.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => return Ok(Vec::new()),
    };
    let parent = full.parent().unwrap_or(base);
    let wildcard = Wildcard::new(&name)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry?;
        if wildcard.is_match(&entry.file_name().to_string_lossy()) {
            matches.push(entry.path());
        }
    }
    matches.sort();

    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_wildcard_matching() {
        let w = Wildcard::new("ssdfp*.lock").unwrap();
        assert!(w.is_match("ssdfp0042.lock"));
        assert!(w.is_match("ssdfp.lock"));
        assert!(!w.is_match("ssdfp0042.lock.old"));
        assert!(!w.is_match("xssdfp.lock"));

        let q = Wildcard::new("Tab?").unwrap();
        assert!(q.is_match("Tabs"));
        assert!(!q.is_match("Tab"));
    }

    #[test]
    fn test_case_follows_platform() {
        let w = Wildcard::new("Session_*").unwrap();
        assert!(w.is_match("Session_1"));
        assert_eq!(w.is_match("SESSION_1"), cfg!(windows));
        assert_eq!(w.is_match("session_1"), cfg!(windows));
    }

    #[test]
    fn test_dots_are_literal() {
        let w = Wildcard::new("*.tmp").unwrap();
        assert!(w.is_match("a.tmp"));
        assert!(!w.is_match("atmp"));
    }

    #[test]
    fn test_expand_literal_and_wildcard() -> io::Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir(dir.path().join("Sessions"))?;
        fs::write(dir.path().join("Sessions/Session_1"), b"a")?;
        fs::write(dir.path().join("Sessions/Session_2"), b"b")?;
        fs::write(dir.path().join("Sessions/Tabs_1"), b"c")?;
        fs::write(dir.path().join("Preferences"), b"{}")?;

        let literal = expand(dir.path(), "Preferences")?;
        assert_eq!(literal, vec![dir.path().join("Preferences")]);

        let sessions = expand(dir.path(), "Sessions/Session_*")?;
        assert_eq!(
            sessions,
            vec![
                dir.path().join("Sessions/Session_1"),
                dir.path().join("Sessions/Session_2"),
            ]
        );

        assert!(expand(dir.path(), "Missing")?.is_empty());
        assert!(expand(dir.path(), "Nowhere/*.log")?.is_empty());
        Ok(())
    }
}
