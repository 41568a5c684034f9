use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::codec::whole_seconds;

/// Opaque job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// `locked_at` and `locked_by` travel as a pair; a job is locked only when both are set.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub priority: i64,
    pub run_at: Option<DateTime<Utc>>,
    pub queue: Option<String>,
    pub payload: Bytes,
    pub failed_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl JobRecord {
    pub fn with_id(id: JobId) -> Self {
        Self {
            id,
            priority: 0,
            run_at: None,
            queue: None,
            payload: Bytes::new(),
            failed_at: None,
            locked_at: None,
            locked_by: None,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some() && self.locked_by.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    pub(crate) fn set_lock(&mut self, at: DateTime<Utc>, by: &str) {
        self.locked_at = Some(at);
        self.locked_by = Some(by.to_string());
    }

    pub(crate) fn clear_lock(&mut self) {
        self.locked_at = None;
        self.locked_by = None;
    }
}

impl PartialEq for JobRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for JobRecord {}

#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub id: Option<JobId>,
    pub priority: i64,
    pub run_at: Option<DateTime<Utc>>,
    pub queue: Option<String>,
    pub payload: Bytes,
}

impl NewJob {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// `None` leaves a field as it is.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub priority: Option<i64>,
    pub run_at: Option<DateTime<Utc>>,
    pub queue: Option<String>,
    pub payload: Option<Bytes>,
    pub failed_at: Option<DateTime<Utc>>,
    pub attempts: Option<u32>,
    pub last_error: Option<String>,
}

impl JobPatch {
    pub(crate) fn apply(self, record: &mut JobRecord) {
        if let Some(priority) = self.priority {
            record.priority = priority;
        }
        if let Some(run_at) = self.run_at {
            record.run_at = Some(whole_seconds(run_at));
        }
        if let Some(queue) = self.queue {
            record.queue = Some(queue);
        }
        if let Some(payload) = self.payload {
            record.payload = payload;
        }
        if let Some(failed_at) = self.failed_at {
            record.failed_at = Some(whole_seconds(failed_at));
        }
        if let Some(attempts) = self.attempts {
            record.attempts = attempts;
        }
        if let Some(last_error) = self.last_error {
            record.last_error = Some(last_error);
        }
    }
}
