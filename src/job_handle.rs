use std::{collections::HashSet, sync::Arc};

use aide_de_camp::core::{job_handle::JobHandle, queue::QueueError, Bytes, Xid};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::{
    backend::KeyValueStore,
    queue::queue_error,
    store::JobStore,
    types::{JobId, JobRecord},
};

/// A job locked by a [`RedisQueue`](crate::RedisQueue) poll.
pub struct RedisJobHandle<S> {
    store: Arc<JobStore<S>>,
    in_flight: Arc<RwLock<HashSet<JobId>>>,
    worker: String,
    jid: Xid,
    row: JobRecord,
}

impl<S: KeyValueStore> RedisJobHandle<S> {
    pub(crate) fn new(
        store: Arc<JobStore<S>>,
        in_flight: Arc<RwLock<HashSet<JobId>>>,
        worker: String,
        jid: Xid,
        row: JobRecord,
    ) -> Self {
        Self {
            store,
            in_flight,
            worker,
            jid,
            row,
        }
    }

    pub fn record(&self) -> &JobRecord {
        &self.row
    }

    async fn save_unlocked(&mut self) -> Result<(), QueueError> {
        let released = self
            .store
            .release_lock(&mut self.row, &self.worker)
            .await
            .map_err(|err| queue_error(err, self.jid))?;
        if !released {
            warn!(
                job_id = %self.row.id,
                worker = %self.worker,
                "lock was lost, job left to its new owner"
            );
        }
        Ok(())
    }

    async fn release(&self) {
        self.in_flight.write().await.remove(&self.row.id);
    }
}

#[async_trait]
impl<S: KeyValueStore + 'static> JobHandle for RedisJobHandle<S> {
    fn id(&self) -> Xid {
        self.jid
    }

    fn job_type(&self) -> &str {
        self.row.queue.as_deref().unwrap_or_default()
    }

    fn payload(&self) -> Bytes {
        self.row.payload.clone()
    }

    fn retries(&self) -> u32 {
        self.row.attempts
    }

    async fn complete(self) -> Result<(), QueueError> {
        let result = self
            .store
            .destroy(&self.row)
            .await
            .map_err(|err| queue_error(err, self.jid));
        self.release().await;
        result
    }

    async fn fail(mut self) -> Result<(), QueueError> {
        self.row.attempts += 1;
        let result = self.save_unlocked().await;
        self.release().await;
        result
    }

    async fn dead_queue(mut self) -> Result<(), QueueError> {
        self.row.attempts += 1;
        self.row.failed_at = Some(self.store.now());
        let result = self.save_unlocked().await;
        self.release().await;
        result
    }
}
