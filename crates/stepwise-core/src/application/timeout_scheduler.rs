use crate::domain::flow_instance::{DeadlineKind, FlowInstanceId};
use crate::domain::repository::DueTimeout;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[cfg(feature = "testing")]
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

#[cfg(feature = "testing")]
impl ManualClock {
    /// Start at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump to an absolute time
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

#[cfg(feature = "testing")]
impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[cfg(feature = "testing")]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Tracks one pending deadline per flow instance
///
/// The scheduler is an in-memory index only. Deadlines are also part of
/// every checkpoint, so a restarted engine rebuilds them from the
/// persistence gateway.
#[derive(Debug, Default)]
pub struct TimeoutScheduler {
    deadlines: Mutex<HashMap<FlowInstanceId, (DeadlineKind, DateTime<Utc>)>>,
}

impl TimeoutScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a deadline, replacing any previous one for the instance
    pub fn schedule_at(&self, id: &FlowInstanceId, kind: DeadlineKind, deadline: DateTime<Utc>) {
        debug!(flow_instance_id = %id, ?kind, %deadline, "Deadline scheduled");
        self.deadlines.lock().insert(id.clone(), (kind, deadline));
    }

    /// Forget the deadline of an instance
    pub fn cancel(&self, id: &FlowInstanceId) -> bool {
        self.deadlines.lock().remove(id).is_some()
    }

    /// Remove and return every deadline at or before `now`, oldest first
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<DueTimeout> {
        let mut deadlines = self.deadlines.lock();
        let due_ids: Vec<FlowInstanceId> = deadlines
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut due: Vec<DueTimeout> = due_ids
            .into_iter()
            .filter_map(|id| {
                deadlines.remove(&id).map(|(kind, due_at)| DueTimeout {
                    flow_instance_id: id,
                    kind,
                    due_at,
                })
            })
            .collect();
        due.sort_by_key(|d| d.due_at);
        due
    }

    /// Number of tracked deadlines
    pub fn len(&self) -> usize {
        self.deadlines.lock().len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.deadlines.lock().is_empty()
    }
}
