//! Exclusive job ownership through optimistic transactions.
//!
//! Candidate lists come from stale scans, so several workers may go after the same
//! job. The lock is taken by watching the job's key, re-checking eligibility through
//! the watching connection and committing the lock fields; a concurrent change to the
//! key aborts the commit. At most one worker can therefore hold a live lock on a job.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::backend::{HashWrite, KeyValueStore, Transaction};
use crate::codec::{self, decode_string, decode_time, encode_time, field_names, Field};
use crate::error::Result;
use crate::selector::{is_due, lock_expired};
use crate::store::JobStore;
use crate::types::{JobId, JobRecord};

const LOCK_CHECK_FIELDS: [Field; 4] = [
    Field::Id,
    Field::LockedAt,
    Field::LockedBy,
    Field::RunAt,
];

impl<S: KeyValueStore> JobStore<S> {
    pub async fn lock_exclusively(
        &self,
        record: &mut JobRecord,
        max_run_time: Duration,
        worker: &str,
    ) -> Result<bool> {
        let now = self.now();
        self.lock_exclusively_at(record, max_run_time, worker, now)
            .await
    }

    /// A worker that already holds `record` only refreshes `locked_at`, whatever the
    /// schedule or lock age. Returns `Ok(false)`, with nothing written, when the job is
    /// not eligible or another worker changed it first.
    #[instrument(skip_all, fields(job_id = %record.id, worker = %worker), err)]
    pub async fn lock_exclusively_at(
        &self,
        record: &mut JobRecord,
        max_run_time: Duration,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now = codec::whole_seconds(now);
        let resuming = record.locked_by.as_deref() == Some(worker);

        let keys = self.keys_for_id(&record.id).await?;
        if keys.is_empty() {
            debug!("job is gone");
            return Ok(false);
        }

        let mut tx = self.backend().watch(&keys).await?;
        let names = field_names(&LOCK_CHECK_FIELDS);
        let mut writes = Vec::new();
        for key in &keys {
            let values = tx.hmget(key, &names).await?;
            let get = |i: usize| values.get(i).and_then(|v| v.as_deref());

            if decode_string(get(0)).as_deref() != Some(record.id.as_str()) {
                continue;
            }
            let eligible = if resuming {
                decode_string(get(2)).as_deref() == Some(worker)
            } else {
                lock_expired(decode_time(Field::LockedAt, get(1)), now, max_run_time)
                    && is_due(decode_time(Field::RunAt, get(3)), now)
            };
            if eligible {
                let mut write =
                    HashWrite::new(key.as_str()).set(Field::LockedAt.as_str(), encode_time(now));
                if !resuming {
                    write = write.set(Field::LockedBy.as_str(), worker);
                }
                writes.push(write);
            }
        }

        if writes.len() != 1 {
            tx.discard().await?;
            debug!(eligible = writes.len(), "job not lockable");
            return Ok(false);
        }

        if !tx.commit(writes).await? {
            debug!("lost lock race");
            return Ok(false);
        }

        record.set_lock(now, worker);
        self.save(record).await?;
        debug!(resumed = resuming, "locked job");
        Ok(true)
    }

    /// Saves `record` with its lock removed, as long as `worker` still holds it.
    ///
    /// Returns `Ok(false)` and writes nothing when the lock expired and another worker
    /// took the job over, or when the job is gone.
    #[instrument(skip_all, fields(job_id = %record.id, worker = %worker), err)]
    pub async fn release_lock(&self, record: &mut JobRecord, worker: &str) -> Result<bool> {
        let key = self.key_for(&record.id);
        let mut tx = self.backend().watch(std::slice::from_ref(&key)).await?;
        let values = tx.hmget(&key, &field_names(&[Field::LockedBy])).await?;
        let holder = decode_string(values.first().and_then(|v| v.as_deref()));
        if holder.as_deref() != Some(worker) {
            tx.discard().await?;
            debug!(holder = ?holder, "lock no longer held");
            return Ok(false);
        }

        if record.run_at.is_none() {
            record.run_at = Some(self.now());
        }
        let write = HashWrite::new(key.as_str())
            .set_all(codec::encode(record))
            .remove(Field::LockedAt.as_str())
            .remove(Field::LockedBy.as_str());
        if !tx.commit(vec![write]).await? {
            debug!("lock changed during release");
            return Ok(false);
        }

        record.clear_lock();
        Ok(true)
    }

    async fn keys_for_id(&self, id: &JobId) -> Result<Vec<String>> {
        let names = field_names(&[Field::Id]);
        let mut keys = Vec::new();
        for key in self.all_keys().await? {
            let values = self.backend().hmget(&key, &names).await?;
            let stored = values.first().and_then(|v| v.as_deref());
            if stored == Some(id.as_str().as_bytes()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}
