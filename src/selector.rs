//! Picks and ranks jobs that look ready to run.
//!
//! Works on a snapshot of scheduling fields read key by key, so the result is only a
//! candidate list: the lock step re-checks before anything is taken.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::codec::{decode_int, decode_string, decode_time, Field};
use crate::config::WorkerConfig;

/// Fields read per key when selecting.
pub(crate) const SNAPSHOT_FIELDS: [Field; 6] = [
    Field::Priority,
    Field::RunAt,
    Field::Queue,
    Field::FailedAt,
    Field::LockedAt,
    Field::LockedBy,
];

/// Scheduling fields of one job as read during a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub key: String,
    pub priority: i64,
    pub run_at: Option<DateTime<Utc>>,
    pub queue: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
}

impl Snapshot {
    /// Builds a snapshot from values read in [`SNAPSHOT_FIELDS`] order.
    pub(crate) fn from_values(key: String, values: &[Option<Vec<u8>>]) -> Self {
        let get = |i: usize| values.get(i).and_then(|v| v.as_deref());
        Self {
            key,
            priority: decode_int(Field::Priority, get(0)),
            run_at: decode_time(Field::RunAt, get(1)),
            queue: decode_string(get(2)),
            failed_at: decode_time(Field::FailedAt, get(3)),
            locked_at: decode_time(Field::LockedAt, get(4)),
            locked_by: decode_string(get(5)),
        }
    }
}

/// What a worker asks for when polling.
#[derive(Debug, Clone)]
pub struct Selection<'a> {
    pub worker: &'a str,
    pub limit: usize,
    pub max_run_time: Duration,
    pub min_priority: Option<i64>,
    pub max_priority: Option<i64>,
    pub queues: &'a [String],
}

impl<'a> Selection<'a> {
    pub fn new(worker: &'a str, limit: usize, max_run_time: Duration) -> Self {
        Self {
            worker,
            limit,
            max_run_time,
            min_priority: None,
            max_priority: None,
            queues: &[],
        }
    }

    pub fn from_config(worker: &'a str, config: &'a WorkerConfig) -> Self {
        Self {
            worker,
            limit: config.limit,
            max_run_time: config.max_run_time,
            min_priority: config.min_priority,
            max_priority: config.max_priority,
            queues: &config.queues,
        }
    }

    pub fn min_priority(mut self, min: i64) -> Self {
        self.min_priority = Some(min);
        self
    }

    pub fn max_priority(mut self, max: i64) -> Self {
        self.max_priority = Some(max);
        self
    }

    pub fn queues(mut self, queues: &'a [String]) -> Self {
        self.queues = queues;
        self
    }
}

/// Instant before which a lock counts as abandoned. `None` when `max_run_time`
/// reaches past the representable range, in which case no lock ever expires.
pub(crate) fn expiry_cutoff(now: DateTime<Utc>, max_run_time: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(max_run_time)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
}

pub(crate) fn lock_expired(
    locked_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_run_time: Duration,
) -> bool {
    match locked_at {
        None => true,
        Some(at) => expiry_cutoff(now, max_run_time).map_or(false, |cutoff| at < cutoff),
    }
}

pub(crate) fn is_due(run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    run_at.map_or(true, |at| at <= now)
}

/// A job is ready when it is due and not held by a live lock, or when `worker`
/// already holds it. Failed jobs are never ready.
///
/// The owner branch ignores both `run_at` and lock age so a restarted worker can
/// resume what it had.
pub fn is_ready(
    snapshot: &Snapshot,
    worker: &str,
    now: DateTime<Utc>,
    max_run_time: Duration,
) -> bool {
    let free = is_due(snapshot.run_at, now) && lock_expired(snapshot.locked_at, now, max_run_time);
    let owned = snapshot.locked_by.as_deref() == Some(worker);
    snapshot.failed_at.is_none() && (free || owned)
}

/// Filters and ranks snapshots, keeping at most `selection.limit`.
///
/// Order is `(priority, run_at)` ascending; the sort is stable so ties keep scan order.
pub fn select(
    snapshots: Vec<Snapshot>,
    selection: &Selection<'_>,
    now: DateTime<Utc>,
) -> Vec<Snapshot> {
    let mut ready: Vec<Snapshot> = snapshots
        .into_iter()
        .filter(|s| is_ready(s, selection.worker, now, selection.max_run_time))
        .filter(|s| selection.min_priority.map_or(true, |min| s.priority >= min))
        .filter(|s| selection.max_priority.map_or(true, |max| s.priority <= max))
        .filter(|s| {
            selection.queues.is_empty()
                || s.queue
                    .as_ref()
                    .map_or(false, |q| selection.queues.contains(q))
        })
        .collect();

    ready.sort_by_key(|s| (s.priority, s.run_at.map_or(0, |t| t.timestamp())));
    ready.truncate(selection.limit);
    ready
}
