//! Redis-backed job storage for background workers.
//!
//! Jobs are stored one hash per key under a namespace prefix. Workers poll with
//! [`JobStore::find_available`] for a ranked list of candidates, then take one with
//! [`JobStore::lock_exclusively`], which uses a watch-then-commit transaction so that
//! at most one worker holds a live lock on any job. Locks older than the configured
//! maximum run time are treated as abandoned and can be taken over.
//!
//! [`RedisQueue`] exposes the same store as an `aide-de-camp` queue.

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod job_handle;
mod lock;
pub mod queue;
pub mod selector;
pub mod store;
pub mod types;

pub use backend::{KeyValueStore, MemoryStore, RedisStore};
pub use codec::Field;
pub use config::{StoreConfig, WorkerConfig};
pub use error::{Result, StoreError};
pub use job_handle::RedisJobHandle;
pub use queue::RedisQueue;
pub use selector::Selection;
pub use store::JobStore;
pub use types::{JobId, JobPatch, JobRecord, NewJob};
