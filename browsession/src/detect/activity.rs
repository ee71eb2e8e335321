//! Activity heuristic: the browser counts as running while its session files
//! keep changing.

use super::{BrowserState, StateProbe};
use crate::fs::metadata::newest_modification;
use crate::fs::pattern;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::debug;

pub struct ActivityProbe {
    profile: PathBuf,
    patterns: Vec<String>,
    grace: Duration,
}

impl ActivityProbe {
    pub fn new(profile: impl Into<PathBuf>, patterns: Vec<String>, grace: Duration) -> Self {
        Self {
            profile: profile.into(),
            patterns,
            grace,
        }
    }

    /// Observe as of `now`.
    ///
    /// Nothing to look at means stopped; an unreadable pattern is inconclusive.
    pub fn observe_at(&self, now: SystemTime) -> BrowserState {
        let mut paths = Vec::new();
        for pattern in &self.patterns {
            match pattern::expand(&self.profile, pattern) {
                Ok(found) => paths.extend(found),
                Err(e) => {
                    debug!(pattern = %pattern, error = %e, "Activity probe inconclusive");
                    return BrowserState::Unknown;
                }
            }
        }

        let Some(newest) = newest_modification(paths.iter().map(PathBuf::as_path)) else {
            return BrowserState::Stopped;
        };

        // A timestamp in the future counts as fresh.
        let fresh = match now.duration_since(newest) {
            Ok(age) => age <= self.grace,
            Err(_) => true,
        };

        if fresh {
            BrowserState::Running
        } else {
            BrowserState::Stopped
        }
    }
}

impl StateProbe for ActivityProbe {
    fn observe(&mut self) -> BrowserState {
        self.observe_at(SystemTime::now())
    }

    fn name(&self) -> &'static str {
        "activity"
    }
}
