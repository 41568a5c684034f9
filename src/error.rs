use thiserror::Error;

use crate::types::JobId;

/// Failures surfaced by the job store.
///
/// Losing a lock race is not one of them: `lock_exclusively` reports that as `Ok(false)`.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("store connection is closed")]
    Disconnected,
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
