use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::backend::KeyValueStore;
use crate::codec::{self, field_names, Field};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::selector::{self, Selection, Snapshot, SNAPSHOT_FIELDS};
use crate::types::{JobId, JobPatch, JobRecord, NewJob};

/// Job persistence on top of a [`KeyValueStore`].
///
/// Each job is one hash under `"{namespace}_{id}"`. There is no index: discovery is a
/// prefix scan over the namespace, so selection cost grows with the number of stored jobs.
pub struct JobStore<S> {
    backend: S,
    namespace: String,
}

impl<S: KeyValueStore> JobStore<S> {
    pub fn new(backend: S, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    pub fn from_config(backend: S, config: &StoreConfig) -> Self {
        Self::new(backend, config.namespace.clone())
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn key_for(&self, id: &JobId) -> String {
        format!("{}_{}", self.namespace, id)
    }

    pub(crate) fn key_prefix(&self) -> String {
        format!("{}_", self.namespace)
    }

    pub(crate) fn id_from_key(&self, key: &str) -> Option<JobId> {
        key.strip_prefix(&self.key_prefix()).map(JobId::from)
    }

    pub fn now(&self) -> DateTime<Utc> {
        codec::whole_seconds(Utc::now())
    }

    /// Best-effort snapshot; concurrent writers may add or remove keys meanwhile.
    pub async fn all_keys(&self) -> Result<Vec<String>> {
        self.backend.scan_prefix(&self.key_prefix()).await
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.all_keys().await?.len())
    }

    #[instrument(skip(self), fields(namespace = %self.namespace), err)]
    pub async fn delete_all(&self) -> Result<usize> {
        let keys = self.all_keys().await?;
        for key in &keys {
            self.backend.del(key).await?;
        }
        Ok(keys.len())
    }

    #[instrument(skip(self), err)]
    pub async fn find(&self, id: &JobId) -> Result<JobRecord> {
        self.backend
            .hgetall(&self.key_for(id))
            .await?
            .map(|fields| codec::decode(id.clone(), &fields))
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))
    }

    pub(crate) async fn find_by_key(&self, key: &str) -> Result<Option<JobRecord>> {
        let Some(id) = self.id_from_key(key) else {
            return Ok(None);
        };
        let fields = self.backend.hgetall(key).await?;
        Ok(fields.map(|fields| codec::decode(id, &fields)))
    }

    /// Writes every field that is set on `record`, defaulting `run_at` to now.
    ///
    /// This is a merge: a field that is unset in memory is left alone in storage, so
    /// clearing an attribute on the record does not clear it in the store. Use
    /// [`JobStore::remove_fields`] to delete stored fields.
    #[instrument(skip_all, fields(job_id = %record.id), err)]
    pub async fn save(&self, record: &mut JobRecord) -> Result<()> {
        if record.run_at.is_none() {
            record.run_at = Some(self.now());
        }
        let pairs = codec::encode(record);
        self.backend.hset(&self.key_for(&record.id), &pairs).await
    }

    pub async fn create(&self, job: NewJob) -> Result<JobRecord> {
        let mut record = JobRecord::with_id(job.id.unwrap_or_else(JobId::generate));
        record.priority = job.priority;
        record.run_at = job.run_at.map(codec::whole_seconds);
        record.queue = job.queue;
        record.payload = job.payload;
        self.save(&mut record).await?;
        debug!(job_id = %record.id, "created job");
        Ok(record)
    }

    pub async fn update(&self, record: &mut JobRecord, patch: JobPatch) -> Result<()> {
        patch.apply(record);
        self.save(record).await
    }

    #[instrument(skip_all, fields(job_id = %record.id), err)]
    pub async fn reload(&self, record: &mut JobRecord) -> Result<()> {
        *record = self.find(&record.id).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %record.id), err)]
    pub async fn destroy(&self, record: &JobRecord) -> Result<()> {
        self.backend.del(&self.key_for(&record.id)).await
    }

    pub async fn remove_fields(&self, id: &JobId, fields: &[Field]) -> Result<()> {
        self.backend
            .hdel(&self.key_for(id), &field_names(fields))
            .await
    }

    pub async fn find_available(&self, selection: &Selection<'_>) -> Result<Vec<JobRecord>> {
        self.find_available_at(selection, self.now()).await
    }

    /// Candidates come from a stale scan; only `lock_exclusively` decides ownership.
    #[instrument(skip_all, fields(worker = selection.worker, limit = selection.limit), err)]
    pub async fn find_available_at(
        &self,
        selection: &Selection<'_>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        let names = field_names(&SNAPSHOT_FIELDS);
        let mut snapshots = Vec::new();
        for key in self.all_keys().await? {
            let values = self.backend.hmget(&key, &names).await?;
            snapshots.push(Snapshot::from_values(key, &values));
        }

        let mut jobs = Vec::new();
        for candidate in selector::select(snapshots, selection, now) {
            match self.find_by_key(&candidate.key).await? {
                Some(job) => jobs.push(job),
                None => debug!(key = %candidate.key, "candidate vanished before load"),
            }
        }
        Ok(jobs)
    }

    /// Returns how many jobs were released.
    #[instrument(skip(self), err)]
    pub async fn clear_locks(&self, worker: &str) -> Result<usize> {
        let lock_fields = field_names(&[Field::LockedBy]);
        let mut cleared = 0;
        for key in self.all_keys().await? {
            let values = self.backend.hmget(&key, &lock_fields).await?;
            let owned = values
                .first()
                .and_then(|v| v.as_deref())
                .map_or(false, |by| by == worker.as_bytes());
            if owned {
                self.backend
                    .hdel(&key, &field_names(&[Field::LockedBy, Field::LockedAt]))
                    .await?;
                cleared += 1;
            }
        }
        info!(worker, cleared, "cleared worker locks");
        Ok(cleared)
    }

    pub async fn before_fork(&self) {
        self.backend.disconnect().await;
    }

    pub async fn after_fork(&self) -> Result<()> {
        self.backend.connect().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::backend::MemoryStore;

    fn store() -> JobStore<MemoryStore> {
        JobStore::new(MemoryStore::new(), "dj")
    }

    #[tokio::test]
    async fn create_then_find_returns_written_fields() {
        let store = store();
        let run_at = store.now() - chrono::Duration::seconds(30);
        let created = store
            .create(
                NewJob::new(Bytes::from_static(b"\x01\x02payload"))
                    .priority(3)
                    .queue("mail")
                    .run_at(run_at),
            )
            .await
            .unwrap();

        let found = store.find(&created.id).await.unwrap();

        assert_eq!(found.id, created.id);
        assert_eq!(found.priority, 3);
        assert_eq!(found.queue.as_deref(), Some("mail"));
        assert_eq!(found.run_at, Some(run_at));
        assert_eq!(found.payload, Bytes::from_static(b"\x01\x02payload"));
        assert_eq!(found.attempts, 0);
        assert!(!found.is_locked());
    }

    #[tokio::test]
    async fn create_defaults_run_at_and_generates_id() {
        let store = store();
        let before = store.now();
        let job = store.create(NewJob::new("p")).await.unwrap();

        assert!(job.run_at.unwrap() >= before);
        assert_eq!(job.id.as_str().len(), 36);
        assert_eq!(store.all_keys().await.unwrap(), vec![store.key_for(&job.id)]);
    }

    #[tokio::test]
    async fn find_missing_job_is_not_found() {
        let err = store().find(&JobId::from("nope")).await.unwrap_err();
        assert!(matches!(err, StoreError::JobNotFound(id) if id.as_str() == "nope"));
    }

    #[tokio::test]
    async fn save_merges_and_never_clears_stored_fields() {
        let store = store();
        let mut job = store.create(NewJob::new("p")).await.unwrap();
        job.last_error = Some("boom".into());
        store.save(&mut job).await.unwrap();

        job.last_error = None;
        job.attempts = 1;
        store.save(&mut job).await.unwrap();

        let found = store.find(&job.id).await.unwrap();
        assert_eq!(found.last_error.as_deref(), Some("boom"));
        assert_eq!(found.attempts, 1);

        store.remove_fields(&job.id, &[Field::LastError]).await.unwrap();
        assert_eq!(store.find(&job.id).await.unwrap().last_error, None);
    }

    #[tokio::test]
    async fn reload_discards_unsaved_changes() {
        let store = store();
        let mut job = store.create(NewJob::new("p").priority(2)).await.unwrap();
        job.priority = 9;
        job.queue = Some("ghost".into());

        store.reload(&mut job).await.unwrap();

        assert_eq!(job.priority, 2);
        assert_eq!(job.queue, None);
    }

    #[tokio::test]
    async fn update_applies_patch_and_saves() {
        let store = store();
        let mut job = store.create(NewJob::new("p")).await.unwrap();

        store
            .update(
                &mut job,
                JobPatch {
                    attempts: Some(2),
                    last_error: Some("timeout".into()),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();

        let found = store.find(&job.id).await.unwrap();
        assert_eq!(found.attempts, 2);
        assert_eq!(found.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn update_keeps_stored_time_resolution() {
        let store = store();
        let mut job = store.create(NewJob::new("p")).await.unwrap();
        let run_at = store.now() + chrono::Duration::milliseconds(60_250);

        store
            .update(
                &mut job,
                JobPatch {
                    run_at: Some(run_at),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();

        let stored = store.find(&job.id).await.unwrap();
        assert_eq!(job.run_at, stored.run_at);
        assert_eq!(job.run_at.unwrap().timestamp_subsec_nanos(), 0);
    }

    #[tokio::test]
    async fn destroy_and_delete_all_remove_keys() {
        let store = store();
        let a = store.create(NewJob::new("a")).await.unwrap();
        store.create(NewJob::new("b")).await.unwrap();
        store.create(NewJob::new("c")).await.unwrap();

        store.destroy(&a).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store.find(&a.id).await.is_err());

        assert_eq!(store.delete_all().await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn namespaces_do_not_see_each_other() {
        let backend = MemoryStore::new();
        let jobs = JobStore::new(backend.clone(), "dj");
        let others = JobStore::new(backend, "other");
        jobs.create(NewJob::new("p")).await.unwrap();

        assert_eq!(others.count().await.unwrap(), 0);
        assert_eq!(jobs.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn find_available_skips_failed_and_respects_limit() {
        let store = store();
        let past = store.now() - chrono::Duration::seconds(10);
        for priority in [4, 1, 3, 2] {
            store
                .create(NewJob::new("p").priority(priority).run_at(past))
                .await
                .unwrap();
        }
        let mut failed = store
            .create(NewJob::new("p").priority(0).run_at(past))
            .await
            .unwrap();
        failed.failed_at = Some(past);
        store.save(&mut failed).await.unwrap();

        let found = store
            .find_available(&Selection::new("w1", 3, Duration::from_secs(600)))
            .await
            .unwrap();

        let priorities: Vec<i64> = found.iter().map(|j| j.priority).collect();
        assert_eq!(priorities, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn clear_locks_only_touches_own_locks() {
        let store = store();
        let now = store.now();
        let mut mine = store.create(NewJob::new("a")).await.unwrap();
        let mut theirs = store.create(NewJob::new("b")).await.unwrap();
        mine.set_lock(now, "w1");
        mine.attempts = 2;
        theirs.set_lock(now, "w2");
        store.save(&mut mine).await.unwrap();
        store.save(&mut theirs).await.unwrap();

        assert_eq!(store.clear_locks("w1").await.unwrap(), 1);

        let mine = store.find(&mine.id).await.unwrap();
        assert!(!mine.is_locked());
        assert_eq!(mine.locked_at, None);
        assert_eq!(mine.attempts, 2);
        let theirs = store.find(&theirs.id).await.unwrap();
        assert_eq!(theirs.locked_by.as_deref(), Some("w2"));
        assert_eq!(theirs.locked_at, Some(now));
    }

    #[tokio::test]
    async fn fork_hooks_drop_and_restore_connection() {
        let store = store();
        store.create(NewJob::new("p")).await.unwrap();

        store.before_fork().await;
        assert!(matches!(store.count().await, Err(StoreError::Disconnected)));

        store.after_fork().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
