//! The scheduler's decision logic, free of timers and I/O.
//!
//! The async loop feeds observations and ticks in; whatever trigger comes out
//! is then offered to [`SchedulerMachine::begin`], which refuses it while a
//! snapshot sequence is already running.

use crate::detect::{BrowserState, StateEvent, StateTracker};
use crate::snapshot::Trigger;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Snapshotting(Trigger),
}

#[derive(Debug)]
pub struct SchedulerMachine {
    tracker: StateTracker,
    phase: Phase,
    emergency_cooldown: Duration,
    last_emergency: Option<Instant>,
}

impl SchedulerMachine {
    pub fn new(emergency_cooldown: Duration) -> Self {
        Self {
            tracker: StateTracker::new(),
            phase: Phase::Idle,
            emergency_cooldown,
            last_emergency: None,
        }
    }

    pub fn state(&self) -> BrowserState {
        self.tracker.current()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.phase, Phase::Snapshotting(_))
    }

    /// Feed a detector observation; a state change yields its trigger.
    pub fn observe(&mut self, observed: BrowserState) -> Option<Trigger> {
        self.tracker.update(observed).map(|event| match event {
            StateEvent::Started => Trigger::BrowserStarted,
            StateEvent::Stopped => Trigger::BrowserStopped,
        })
    }

    /// Periodic timer fired. Only meaningful while the browser runs.
    pub fn tick(&self) -> Option<Trigger> {
        (self.state() == BrowserState::Running).then_some(Trigger::Periodic)
    }

    /// Free space dropped below the threshold.
    ///
    /// Yields an emergency trigger while the browser runs, at most once per
    /// cooldown.
    pub fn low_space(&mut self, now: Instant) -> Option<Trigger> {
        if self.state() != BrowserState::Running {
            return None;
        }
        if let Some(last) = self.last_emergency {
            if now.saturating_duration_since(last) < self.emergency_cooldown {
                return None;
            }
        }
        self.last_emergency = Some(now);
        Some(Trigger::Emergency)
    }

    /// Try to start a snapshot sequence. `false` means the trigger was
    /// coalesced into the one already running.
    pub fn begin(&mut self, trigger: Trigger) -> bool {
        match self.phase {
            Phase::Snapshotting(_) => false,
            Phase::Idle => {
                self.phase = Phase::Snapshotting(trigger);
                true
            }
        }
    }

    /// Back to idle; returns the trigger of the sequence that ended.
    pub fn finish(&mut self) -> Option<Trigger> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Snapshotting(trigger) => Some(trigger),
            Phase::Idle => None,
        }
    }
}
