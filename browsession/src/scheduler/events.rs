//! Structured events emitted by the scheduler.

use crate::detect::BrowserState;
use crate::snapshot::layout::SnapshotId;
use crate::snapshot::{SnapshotStatus, Trigger};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BackupEvent {
    StateChanged {
        from: BrowserState,
        to: BrowserState,
    },
    SnapshotTriggered {
        trigger: Trigger,
    },
    SnapshotCompleted {
        id: SnapshotId,
        trigger: Trigger,
        status: SnapshotStatus,
        path: PathBuf,
    },
    SnapshotSkipped {
        trigger: Trigger,
        reason: String,
    },
    SnapshotFailed {
        trigger: Trigger,
        reason: String,
    },
    PruneCompleted {
        deleted_ids: Vec<SnapshotId>,
        failed: usize,
        purged_orphans: usize,
    },
}

/// Receives every [`BackupEvent`].
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &BackupEvent);
}

/// Logs events through `tracing`, with the event serialized as a field.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &BackupEvent) {
        let json = serde_json::to_string(event).unwrap_or_default();
        match event {
            BackupEvent::StateChanged { from, to } => {
                info!(event = %json, "Browser {} -> {}", from, to)
            }
            BackupEvent::SnapshotTriggered { trigger } => {
                info!(event = %json, "Snapshot triggered ({})", trigger)
            }
            BackupEvent::SnapshotCompleted { id, status, .. } => match status {
                SnapshotStatus::Complete => info!(event = %json, "Snapshot {} complete", id),
                _ => warn!(event = %json, "Snapshot {} is {}", id, status),
            },
            BackupEvent::SnapshotSkipped { reason, .. } => {
                info!(event = %json, "Snapshot skipped: {}", reason)
            }
            BackupEvent::SnapshotFailed { reason, .. } => {
                error!(event = %json, "Snapshot failed: {}", reason)
            }
            BackupEvent::PruneCompleted { deleted_ids, failed, .. } => {
                if *failed > 0 {
                    warn!(event = %json, "Pruned {} snapshots, {} deletions failed", deleted_ids.len(), failed)
                } else {
                    info!(event = %json, "Pruned {} snapshots", deleted_ids.len())
                }
            }
        }
    }
}

/// Keeps emitted events in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<BackupEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn events(&self) -> Vec<BackupEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl EventSink for RecordingSink {
    fn emit(&self, event: &BackupEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = BackupEvent::PruneCompleted {
            deleted_ids: vec![SnapshotId(1), SnapshotId(2)],
            failed: 0,
            purged_orphans: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "prune_completed");
        assert_eq!(json["deleted_ids"], serde_json::json!([1, 2]));

        let event = BackupEvent::StateChanged {
            from: BrowserState::Stopped,
            to: BrowserState::Running,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["from"], "stopped");
        assert_eq!(json["to"], "running");
    }
}
