use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where jobs are stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Every job key is `"{namespace}_{id}"`.
    pub namespace: String,
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: "delayed_job".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Selection and locking parameters for one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Jobs with a lower priority value are skipped.
    pub min_priority: Option<i64>,
    /// Jobs with a higher priority value are skipped.
    pub max_priority: Option<i64>,
    /// Queues this worker serves. Empty means all of them.
    pub queues: Vec<String>,
    /// A lock older than this is considered abandoned.
    #[serde(with = "humantime_serde")]
    pub max_run_time: Duration,
    /// Candidates fetched per poll.
    pub limit: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            min_priority: None,
            max_priority: None,
            queues: Vec::new(),
            max_run_time: Duration::from_secs(4 * 60 * 60),
            limit: 5,
        }
    }
}
