//! Browser state detection.
//!
//! A [`StateProbe`] turns one signal (process table, lock file, file activity)
//! into a [`BrowserState`] sample. [`StateTracker`] reduces those samples to
//! edge events, so the scheduler only sees a browser start or stop.

pub mod activity;
pub mod lockfile;
pub mod process;

use crate::config::{Config, DetectionStrategy};
use crate::utils::errors::{BrowsessionError, Result};
use activity::ActivityProbe;
use lockfile::LockFileProbe;
use process::ProcessProbe;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserState {
    /// No observation has resolved yet (or the last one was inconclusive)
    Unknown,
    Running,
    Stopped,
}

impl fmt::Display for BrowserState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BrowserState::Unknown => "unknown",
            BrowserState::Running => "running",
            BrowserState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// A change between two resolved states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Started,
    Stopped,
}

/// One way of telling whether the browser is running.
///
/// `observe` is called once per polling interval and must return quickly;
/// an inconclusive check reports [`BrowserState::Unknown`].
pub trait StateProbe: Send {
    fn observe(&mut self) -> BrowserState;

    fn name(&self) -> &'static str;
}

impl StateProbe for Box<dyn StateProbe> {
    fn observe(&mut self) -> BrowserState {
        (**self).observe()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Reduces a stream of observations to edge events.
#[derive(Debug, Clone)]
pub struct StateTracker {
    current: BrowserState,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            current: BrowserState::Unknown,
        }
    }

    pub fn current(&self) -> BrowserState {
        self.current
    }

    /// Feed one observation.
    ///
    /// `Unknown` never changes the tracked state. The first resolved value
    /// only sets the baseline; afterwards an event is returned exactly when the
    /// resolved value differs from the previous one.
    pub fn update(&mut self, observed: BrowserState) -> Option<StateEvent> {
        let previous = self.current;
        if observed == BrowserState::Unknown || observed == previous {
            return None;
        }
        self.current = observed;

        match (previous, observed) {
            (BrowserState::Unknown, _) => None,
            (_, BrowserState::Running) => Some(StateEvent::Started),
            (_, BrowserState::Stopped) => Some(StateEvent::Stopped),
            (_, BrowserState::Unknown) => None,
        }
    }
}

/// Built-in detection settings for common browsers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BrowserPreset {
    /// `History-journal` is non-empty while Chromium runs
    Chromium,
    /// Chromium on Windows keeps files under `Sessions` locked
    ChromiumWin,
    /// Firefox removes `sessionstore.jsonlz4` while running
    Firefox,
    /// Opera on Windows creates `lockfile`
    OperaWin,
    /// Opera creates `ssdfp*.lock` files
    Opera,
}

impl BrowserPreset {
    /// Lock-file target and probe mode this preset stands for
    pub fn lock_target(self) -> (&'static str, lockfile::LockProbeMode) {
        use lockfile::LockProbeMode;
        match self {
            BrowserPreset::Chromium => ("History-journal", LockProbeMode::NonEmpty),
            BrowserPreset::ChromiumWin => ("Sessions", LockProbeMode::AnyHeld),
            BrowserPreset::Firefox => ("sessionstore.jsonlz4", LockProbeMode::Absent),
            BrowserPreset::OperaWin => ("lockfile", LockProbeMode::Exists),
            BrowserPreset::Opera => ("ssdfp*.lock", LockProbeMode::Exists),
        }
    }
}

/// Build the probe selected by `[detection]`.
pub fn build_probe(config: &Config) -> Result<Box<dyn StateProbe>> {
    let detection = &config.detection;
    let profile = config.paths.browser_profile.clone();

    match detection.strategy {
        DetectionStrategy::Process => {
            let image = detection.process_name.clone().ok_or_else(|| {
                BrowsessionError::Config("detection.process_name is not set".to_string())
            })?;
            Ok(Box::new(ProcessProbe::new(image)))
        }
        DetectionStrategy::LockFile => {
            let (target, mode) = match (&detection.lock_file, detection.preset) {
                (Some(file), _) => (file.clone(), detection.lock_probe),
                (None, Some(preset)) => {
                    let (file, mode) = preset.lock_target();
                    (file.to_string(), mode)
                }
                (None, None) => {
                    return Err(BrowsessionError::Config(
                        "detection.lock_file is not set and no preset is selected".to_string(),
                    ))
                }
            };
            Ok(Box::new(LockFileProbe::new(profile, target, mode)))
        }
        DetectionStrategy::Activity => Ok(Box::new(ActivityProbe::new(
            profile,
            config.files.main.clone(),
            Duration::from_secs(detection.activity_grace_secs),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BrowserState::{Running, Stopped, Unknown};

    #[test]
    fn test_baseline_emits_nothing() {
        let mut tracker = StateTracker::new();
        assert_eq!(tracker.update(Unknown), None);
        assert_eq!(tracker.update(Running), None);
        assert_eq!(tracker.current(), Running);
    }

    #[test]
    fn test_events_only_on_change() {
        let observations = [
            Stopped, Stopped, Running, Running, Unknown, Running, Stopped, Unknown, Stopped, Running,
        ];
        let mut tracker = StateTracker::new();
        let events: Vec<_> = observations
            .iter()
            .filter_map(|o| tracker.update(*o))
            .collect();
        assert_eq!(
            events,
            vec![StateEvent::Started, StateEvent::Stopped, StateEvent::Started]
        );
    }

    #[test]
    fn test_event_iff_resolved_state_changes() {
        // Exhaustive over all sequences of length 5
        let states = [Unknown, Running, Stopped];
        for mut n in 0..3usize.pow(5) {
            let mut seq = Vec::new();
            for _ in 0..5 {
                seq.push(states[n % 3]);
                n /= 3;
            }

            let mut tracker = StateTracker::new();
            let mut last_resolved: Option<BrowserState> = None;
            for obs in seq {
                let event = tracker.update(obs);
                let expected = match (last_resolved, obs) {
                    (_, Unknown) => None,
                    (None, _) => None,
                    (Some(prev), now) if prev == now => None,
                    (Some(_), Running) => Some(StateEvent::Started),
                    (Some(_), _) => Some(StateEvent::Stopped),
                };
                assert_eq!(event, expected);
                if obs != Unknown {
                    last_resolved = Some(obs);
                }
            }
        }
    }

    #[test]
    fn test_build_probe_from_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::template();
        config.paths.browser_profile = dir.path().to_path_buf();

        // Default: chromium preset, History-journal must be non-empty
        let mut probe = build_probe(&config).unwrap();
        assert_eq!(probe.name(), "lock-file");
        assert_eq!(probe.observe(), Stopped);
        std::fs::write(dir.path().join("History-journal"), b"x").unwrap();
        assert_eq!(probe.observe(), Running);

        config.detection.preset = Some(BrowserPreset::Firefox);
        assert_eq!(build_probe(&config).unwrap().observe(), Running);

        config.detection.strategy = DetectionStrategy::Process;
        config.detection.process_name = None;
        assert!(build_probe(&config).is_err());
        config.detection.process_name = Some("firefox".into());
        assert_eq!(build_probe(&config).unwrap().name(), "process");

        config.detection.strategy = DetectionStrategy::Activity;
        assert_eq!(build_probe(&config).unwrap().name(), "activity");
    }
}
