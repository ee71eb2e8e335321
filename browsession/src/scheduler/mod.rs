//! Backup scheduler.
//!
//! Polls the detector, runs the periodic timer and the free-space check, and
//! hands triggers to [`SchedulerMachine`]. Accepted triggers run the
//! [`BackupJob`] on a blocking worker; at most one runs at a time and anything
//! arriving meanwhile is dropped. Job errors are logged and polling goes on.

pub mod events;
pub mod job;
pub mod machine;

use crate::detect::{BrowserState, StateProbe};
use crate::fs::space::available_space;
use crate::snapshot::Trigger;
use crate::utils::errors::{BrowsessionError, Result};
use events::{BackupEvent, EventSink};
use job::{BackupJob, JobOutcome, JobReport};
use machine::SchedulerMachine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Low-disk-space emergency snapshots
#[derive(Debug, Clone)]
pub struct EmergencySettings {
    /// Any path on the volume to watch
    pub volume: PathBuf,
    /// Trigger below this many free bytes
    pub free_space_trigger: u64,
    pub cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    /// `None` disables periodic snapshots
    pub periodic_interval: Option<Duration>,
    /// How long an in-flight snapshot may run on after shutdown is requested
    pub shutdown_grace: Duration,
    pub emergency: Option<EmergencySettings>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            periodic_interval: Some(Duration::from_secs(15 * 60)),
            shutdown_grace: Duration::from_secs(10),
            emergency: None,
        }
    }
}

/// A job running on the blocking pool
struct InFlight {
    trigger: Trigger,
    handle: JoinHandle<Result<JobReport>>,
    cancel: CancellationToken,
}

type JobResult = std::result::Result<Result<JobReport>, JoinError>;

pub struct Scheduler<P, J> {
    probe: P,
    job: Arc<J>,
    sink: Arc<dyn EventSink>,
    settings: SchedulerSettings,
    machine: SchedulerMachine,
}

impl<P, J> Scheduler<P, J>
where
    P: StateProbe,
    J: BackupJob,
{
    pub fn new(probe: P, job: J, sink: Arc<dyn EventSink>, settings: SchedulerSettings) -> Self {
        let cooldown = settings
            .emergency
            .as_ref()
            .map_or(Duration::ZERO, |e| e.cooldown);
        Self {
            probe,
            job: Arc::new(job),
            sink,
            settings,
            machine: SchedulerMachine::new(cooldown),
        }
    }

    /// Run until `shutdown` fires (or its sender goes away).
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            probe = self.probe.name(),
            poll = ?self.settings.poll_interval,
            periodic = ?self.settings.periodic_interval,
            "Scheduler started"
        );

        self.startup_prune().await;

        let mut poll = time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut periodic = self.settings.periodic_interval.map(|period| {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        let mut in_flight: Option<InFlight> = None;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown requested, stopping scheduler");
                    break;
                }
                (trigger, result) = wait_in_flight(&mut in_flight) => {
                    in_flight = None;
                    self.complete(trigger, result);
                }
                _ = poll.tick() => {
                    self.poll(&mut in_flight);
                }
                _ = next_tick(&mut periodic) => {
                    if let Some(trigger) = self.machine.tick() {
                        self.dispatch(trigger, &mut in_flight);
                    }
                }
            }
        }

        if let Some(job) = in_flight.take() {
            self.drain(job).await;
        }
        info!("Scheduler stopped");
    }

    // `&mut self` keeps the future `Send` without requiring the probe to be `Sync`.
    async fn startup_prune(&mut self) {
        let job = Arc::clone(&self.job);
        match tokio::task::spawn_blocking(move || job.prune()).await {
            Ok(Ok(report)) => self.sink.emit(&BackupEvent::PruneCompleted {
                deleted_ids: report.deleted,
                failed: report.failed.len(),
                purged_orphans: report.purged_orphans.len(),
            }),
            Ok(Err(e)) => warn!(error = %e, "Startup retention pass failed"),
            Err(e) => warn!(error = %e, "Startup retention task panicked"),
        }
    }

    fn poll(&mut self, in_flight: &mut Option<InFlight>) {
        let before = self.machine.state();
        let observed = self.probe.observe();
        let trigger = self.machine.observe(observed);
        let after = self.machine.state();

        if before != after {
            self.sink.emit(&BackupEvent::StateChanged {
                from: before,
                to: after,
            });
        }
        if let Some(trigger) = trigger {
            self.dispatch(trigger, in_flight);
        }

        if let Some(trigger) = self.check_space() {
            self.dispatch(trigger, in_flight);
        }
    }

    fn check_space(&mut self) -> Option<Trigger> {
        let emergency = self.settings.emergency.as_ref()?;
        if self.machine.is_busy() || self.machine.state() != BrowserState::Running {
            return None;
        }

        let free = match available_space(&emergency.volume) {
            Ok(free) => free,
            Err(e) => {
                debug!(path = %emergency.volume.display(), error = %e, "Free space unavailable");
                return None;
            }
        };
        if free >= emergency.free_space_trigger {
            return None;
        }

        let trigger = self.machine.low_space(Instant::now())?;
        warn!(
            free_bytes = free,
            threshold = emergency.free_space_trigger,
            "Low disk space, taking emergency snapshot"
        );
        Some(trigger)
    }

    fn dispatch(&mut self, trigger: Trigger, in_flight: &mut Option<InFlight>) {
        if !self.machine.begin(trigger) {
            debug!(trigger = %trigger, "Snapshot already running, trigger dropped");
            return;
        }

        self.sink.emit(&BackupEvent::SnapshotTriggered { trigger });

        let job = Arc::clone(&self.job);
        let cancel = CancellationToken::new();
        let job_cancel = cancel.clone();
        let handle = tokio::task::spawn_blocking(move || job.run(trigger, &job_cancel));

        *in_flight = Some(InFlight {
            trigger,
            handle,
            cancel,
        });
    }

    fn complete(&mut self, trigger: Trigger, result: JobResult) {
        self.machine.finish();

        let report = match result {
            Ok(Ok(report)) => report,
            Ok(Err(e @ BrowsessionError::Contention { .. })) => {
                self.sink.emit(&BackupEvent::SnapshotSkipped {
                    trigger,
                    reason: e.to_string(),
                });
                return;
            }
            Ok(Err(e)) => {
                self.sink.emit(&BackupEvent::SnapshotFailed {
                    trigger,
                    reason: e.to_string(),
                });
                return;
            }
            Err(e) => {
                self.sink.emit(&BackupEvent::SnapshotFailed {
                    trigger,
                    reason: format!("snapshot task aborted: {}", e),
                });
                return;
            }
        };

        match report.outcome {
            JobOutcome::Completed(result) => self.sink.emit(&BackupEvent::SnapshotCompleted {
                id: result.id,
                trigger,
                status: result.status,
                path: result.path,
            }),
            JobOutcome::Skipped(reason) => {
                self.sink.emit(&BackupEvent::SnapshotSkipped { trigger, reason })
            }
        }

        if let Some(prune) = report.prune {
            self.sink.emit(&BackupEvent::PruneCompleted {
                deleted_ids: prune.deleted,
                failed: prune.failed.len(),
                purged_orphans: prune.purged_orphans.len(),
            });
        }
    }

    /// Give an in-flight job the grace period, then cancel it.
    async fn drain(&mut self, job: InFlight) {
        let InFlight {
            trigger,
            mut handle,
            cancel,
        } = job;

        info!(grace = ?self.settings.shutdown_grace, "Waiting for in-flight snapshot");
        let result = match time::timeout(self.settings.shutdown_grace, &mut handle).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Grace period elapsed, abandoning snapshot");
                cancel.cancel();
                handle.await
            }
        };
        self.complete(trigger, result);
    }
}

async fn wait_in_flight(in_flight: &mut Option<InFlight>) -> (Trigger, JobResult) {
    match in_flight {
        Some(job) => {
            let result = (&mut job.handle).await;
            (job.trigger, result)
        }
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
