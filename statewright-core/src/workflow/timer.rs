//! Clocks and the durable timer queue
//!
//! Timers are not sleeping tasks: each entry is derived from persisted state
//! (a suspended branch or a pending callback) and rebuilt from the store on
//! recovery. The orchestrator polls the queue against its [`Clock`].

use crate::models::execution::BranchPath;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Simulated time: wall clock plus an offset that only moves forward
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    offset_ms: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.offset_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }
}

/// What happens when a timer comes due
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerAction {
    /// Wake a branch suspended on a Wait or a retry backoff
    Resume {
        execution_id: Uuid,
        branch: BranchPath,
    },
    /// Time out a callback that was never completed
    ExpireCallback { execution_id: Uuid, token: String },
}

#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub due: DateTime<Utc>,
    pub action: TimerAction,
}

/// Armed timers keyed by an internal id
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: DashMap<u64, TimerEntry>,
    next_id: AtomicU64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, due: DateTime<Utc>, action: TimerAction) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(id, TimerEntry { due, action });
    }

    /// Remove and return every entry due at or before `now`, earliest first
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<TimerEntry> {
        let due_ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|entry| entry.due <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut due: Vec<(u64, TimerEntry)> = due_ids
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect();
        due.sort_by(|a, b| a.1.due.cmp(&b.1.due).then(a.0.cmp(&b.0)));
        due.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Drop every timer belonging to an execution
    pub fn cancel_execution(&self, execution_id: Uuid) {
        self.entries.retain(|_, entry| match &entry.action {
            TimerAction::Resume {
                execution_id: id, ..
            }
            | TimerAction::ExpireCallback {
                execution_id: id, ..
            } => *id != execution_id,
        });
    }

    pub fn cancel_callback(&self, token: &str) {
        self.entries.retain(|_, entry| {
            !matches!(&entry.action, TimerAction::ExpireCallback { token: t, .. } if t == token)
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest due time, if any timer is armed
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().map(|entry| entry.due).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let before = clock.now();
        clock.advance(Duration::from_secs(10));
        assert!(clock.now() - before >= ChronoDuration::seconds(10));
    }

    #[test]
    fn test_take_due_in_order() {
        let queue = TimerQueue::new();
        let now = Utc::now();
        let id = Uuid::new_v4();
        queue.schedule(
            now + ChronoDuration::seconds(5),
            TimerAction::ExpireCallback {
                execution_id: id,
                token: "late".to_string(),
            },
        );
        queue.schedule(
            now - ChronoDuration::seconds(1),
            TimerAction::Resume {
                execution_id: id,
                branch: BranchPath::root(),
            },
        );
        queue.schedule(
            now - ChronoDuration::seconds(2),
            TimerAction::ExpireCallback {
                execution_id: id,
                token: "early".to_string(),
            },
        );

        let due = queue.take_due(now);
        assert_eq!(due.len(), 2);
        assert_eq!(
            due[0].action,
            TimerAction::ExpireCallback {
                execution_id: id,
                token: "early".to_string()
            }
        );
        assert_eq!(queue.len(), 1);
        assert!(queue.take_due(now).is_empty());
    }

    #[test]
    fn test_cancel_execution_and_callback() {
        let queue = TimerQueue::new();
        let now = Utc::now();
        let id = Uuid::new_v4();
        queue.schedule(
            now,
            TimerAction::Resume {
                execution_id: id,
                branch: BranchPath::root(),
            },
        );
        queue.schedule(
            now,
            TimerAction::ExpireCallback {
                execution_id: Uuid::new_v4(),
                token: "tok".to_string(),
            },
        );
        queue.cancel_execution(id);
        assert_eq!(queue.len(), 1);
        queue.cancel_callback("tok");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel_execution_drops_callback_timeouts() {
        let queue = TimerQueue::new();
        let now = Utc::now();
        let finished = Uuid::new_v4();
        let other = Uuid::new_v4();
        for (execution_id, token) in [(finished, "a"), (finished, "b"), (other, "c")] {
            queue.schedule(
                now + ChronoDuration::days(1),
                TimerAction::ExpireCallback {
                    execution_id,
                    token: token.to_string(),
                },
            );
        }

        queue.cancel_execution(finished);
        assert_eq!(queue.len(), 1);
        assert!(queue.take_due(now + ChronoDuration::days(2)).iter().all(|entry| {
            matches!(&entry.action, TimerAction::ExpireCallback { token, .. } if token == "c")
        }));
    }
}
