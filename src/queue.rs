use std::{collections::HashSet, sync::Arc};

use aide_de_camp::core::{
    job_processor::JobProcessor,
    new_xid,
    queue::{Queue, QueueError},
    DateTime, Xid,
};
use anyhow::Context;
use async_trait::async_trait;
use bincode::{Decode, Encode};
use tokio::sync::RwLock;
use tracing::{instrument, warn};

use crate::{
    backend::{KeyValueStore, RedisStore},
    config::WorkerConfig,
    error::StoreError,
    job_handle::RedisJobHandle,
    selector::Selection,
    store::JobStore,
    types::{JobId, JobRecord, NewJob},
};

/// aide-de-camp queue over a [`JobStore`], polling on behalf of one named worker.
///
/// Job types map onto the record's `queue` tag. aide-de-camp runs higher priorities
/// first while the store runs lower values first, so priorities are stored negated.
pub struct RedisQueue<S = RedisStore> {
    store: Arc<JobStore<S>>,
    worker: String,
    config: WorkerConfig,
    in_flight: Arc<RwLock<HashSet<JobId>>>,
    bincode_config: bincode::config::Configuration,
}

impl<S: KeyValueStore> RedisQueue<S> {
    pub fn new(store: Arc<JobStore<S>>, worker: impl Into<String>, config: WorkerConfig) -> Self {
        Self {
            store,
            worker: worker.into(),
            config,
            in_flight: Arc::new(RwLock::new(HashSet::new())),
            bincode_config: bincode::config::standard(),
        }
    }

    pub fn store(&self) -> &Arc<JobStore<S>> {
        &self.store
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Releases the locks this worker still holds. Call on orderly shutdown.
    pub async fn shutdown(&self) -> Result<usize, QueueError> {
        let cleared = self
            .store
            .clear_locks(&self.worker)
            .await
            .context("Failed to clear worker locks")?;
        self.in_flight.write().await.clear();
        Ok(cleared)
    }

    /// Loads a job that is still waiting to run, i.e. present and unlocked.
    async fn find_pending(&self, job_id: Xid) -> Result<JobRecord, QueueError> {
        let job = self
            .store
            .find(&JobId::from(job_id.to_string()))
            .await
            .map_err(|err| queue_error(err, job_id))?;
        if job.is_locked() {
            return Err(QueueError::JobNotFound(job_id));
        }
        Ok(job)
    }

    /// Attempts to lock `job`, unless another task of this process is already running it.
    async fn claim(&self, job: &mut JobRecord, now: DateTime) -> Result<bool, QueueError> {
        if !self.in_flight.write().await.insert(job.id.clone()) {
            return Ok(false);
        }
        let locked = self
            .store
            .lock_exclusively_at(job, self.config.max_run_time, &self.worker, now)
            .await;
        if !matches!(locked, Ok(true)) {
            self.in_flight.write().await.remove(&job.id);
        }
        Ok(locked.context("Failed to lock job")?)
    }
}

pub(crate) fn queue_error(err: StoreError, job_id: Xid) -> QueueError {
    match err {
        StoreError::JobNotFound(_) => QueueError::JobNotFound(job_id),
        other => QueueError::from(anyhow::Error::from(other)),
    }
}

#[async_trait]
impl<S: KeyValueStore + 'static> Queue for RedisQueue<S> {
    type JobHandle = RedisJobHandle<S>;

    #[instrument(skip_all, err, ret, fields(job_type = J::name(), payload_size))]
    async fn schedule_at<J>(
        &self,
        payload: J::Payload,
        scheduled_at: DateTime,
        priority: i8,
    ) -> Result<Xid, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Encode,
    {
        let payload = bincode::encode_to_vec(&payload, self.bincode_config)?;
        let jid = new_xid();

        tracing::Span::current().record("payload_size", payload.len());

        let job = NewJob::new(payload)
            .id(jid.to_string())
            .queue(J::name())
            .priority(-i64::from(priority))
            .run_at(scheduled_at);
        self.store
            .create(job)
            .await
            .context("Failed to add job to the queue")?;

        Ok(jid)
    }

    #[instrument(skip_all, err)]
    async fn poll_next_with_instant(
        &self,
        job_types: &[&str],
        now: DateTime,
    ) -> Result<Option<Self::JobHandle>, QueueError> {
        let queues: Vec<String> = job_types.iter().map(|t| t.to_string()).collect();
        let mut selection = Selection::from_config(&self.worker, &self.config).queues(&queues);
        // Jobs this queue is running stay ready for their owner; look past them.
        let running = self.in_flight.read().await.clone();
        selection.limit = selection.limit.saturating_add(running.len());

        let candidates = self
            .store
            .find_available_at(&selection, now)
            .await
            .context("Failed to fetch candidate jobs")?;

        for mut job in candidates {
            if running.contains(&job.id) {
                continue;
            }
            let jid: Xid = match job.id.as_str().parse() {
                Ok(jid) => jid,
                Err(_) => {
                    warn!(job_id = %job.id, "skipping job whose id is not an xid");
                    continue;
                }
            };
            if self.claim(&mut job, now).await? {
                return Ok(Some(RedisJobHandle::new(
                    Arc::clone(&self.store),
                    Arc::clone(&self.in_flight),
                    self.worker.clone(),
                    jid,
                    job,
                )));
            }
        }

        Ok(None)
    }

    #[instrument(skip_all, err)]
    async fn cancel_job(&self, job_id: Xid) -> Result<(), QueueError> {
        let job = self.find_pending(job_id).await?;
        self.store
            .destroy(&job)
            .await
            .context("Failed to cancel job")?;
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn unschedule_job<J>(&self, job_id: Xid) -> Result<J::Payload, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Decode,
    {
        let job = self.find_pending(job_id).await?;
        if job.queue.as_deref() != Some(J::name()) {
            return Err(QueueError::JobNotFound(job_id));
        }

        let (decoded, _) = bincode::decode_from_slice(&job.payload, self.bincode_config)?;
        self.store
            .destroy(&job)
            .await
            .context("Failed to unschedule job")?;
        Ok(decoded)
    }
}
